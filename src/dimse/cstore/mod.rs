pub mod storescp;

use crate::dimse::{DicomMessage, DATA_SET_MISSING, STATUS_SUCCESS};
use crate::types::{AE, UI, US};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use anyhow::Context;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// C-STORE-RQ, sent by tests that play the archive.
#[cfg(test)]
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	pub data_set: InMemDicomObject,
}

#[cfg(test)]
impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
        let mut command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [crate::dimse::DATA_SET_EXISTS])),
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
        ]);

        if let Some(move_originator_message_id) = request.move_originator_message_id {
            command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [move_originator_message_id])));
        }

        if let Some(move_originator_aet) = request.move_originator_aet {
            command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, dicom_value!(Str, move_originator_aet)));
        }

        Self {
            command,
            data: Some(request.data_set),
            presentation_context_id: None
        }
    }
}

/// C-STORE-RSP
///
/// The status is always success: archives expect every sub-operation to be acknowledged,
/// whatever the receiver decides to do with the object.
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [STATUS_SUCCESS])),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid))
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None
        }
    }
}

/// An object pushed to the store service class provider, together with the information
/// negotiated on its association.
#[derive(Debug, Clone)]
pub struct StoreEvent {
	/// The AE title of the peer that sent the object.
	pub calling_aet: AE,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	/// The transfer syntax of the presentation context the data set was read with.
	pub transfer_syntax: UI,
	pub data_set: InMemDicomObject,
}

impl StoreEvent {
	/// Merges the file meta information into the data set so it can be written as a DICOM file.
	pub fn into_file_object(self) -> anyhow::Result<FileDicomObject<InMemDicomObject>> {
		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(self.sop_class_uid.trim_end_matches('\0'))
			.media_storage_sop_instance_uid(self.sop_instance_uid.trim_end_matches('\0'))
			.transfer_syntax(self.transfer_syntax.trim_end_matches('\0'))
			.implementation_class_uid(IMPLEMENTATION_CLASS_UID)
			.implementation_version_name(IMPLEMENTATION_VERSION_NAME)
			.build()
			.context("Failed to build the file meta group")?;

		Ok(self.data_set.with_exact_meta(meta))
	}
}

/// Handler invoked by the store service class provider for every received object.
///
/// Runs on a blocking worker, concurrently with whatever the rest of the application does.
/// The handler has no way to influence the C-STORE-RSP status.
pub trait StoreEventHandler: Send + Sync + 'static {
	fn on_store(&self, event: StoreEvent);
}
