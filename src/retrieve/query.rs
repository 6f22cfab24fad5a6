//! Identifiers for the C-FIND and C-MOVE requests sent to the archive.
//!
//! Attributes set to a value are matching keys; attributes set to an empty value are return keys
//! the archive fills in for every match.

use crate::types::QueryRetrieveLevel;
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub const MODALITY_RT_PLAN: &str = "RTPLAN";
pub const MODALITY_RT_IMAGE: &str = "RTIMAGE";

fn level(identifier: &mut InMemDicomObject, level: QueryRetrieveLevel) {
	identifier.put(DataElement::new(
		tags::QUERY_RETRIEVE_LEVEL,
		VR::CS,
		PrimitiveValue::from(level),
	));
}

fn return_key(identifier: &mut InMemDicomObject, tag: Tag, vr: VR) {
	identifier.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
}

/// Image level query for the RT plan labelled `plan_name` of a patient.
pub fn plan_query(patient_id: &str, plan_name: &str) -> InMemDicomObject {
	let mut identifier = InMemDicomObject::new_empty();
	level(&mut identifier, QueryRetrieveLevel::Image);
	identifier.put_str(tags::MODALITY, VR::CS, MODALITY_RT_PLAN);
	identifier.put_str(tags::PATIENT_ID, VR::LO, patient_id);
	identifier.put_str(tags::RT_PLAN_LABEL, VR::SH, plan_name);
	return_key(&mut identifier, tags::SOP_INSTANCE_UID, VR::UI);
	return_key(&mut identifier, tags::STUDY_INSTANCE_UID, VR::UI);
	identifier
}

/// Series level query for all RT image series of a study.
pub fn series_query(study_uid: &str) -> InMemDicomObject {
	let mut identifier = InMemDicomObject::new_empty();
	level(&mut identifier, QueryRetrieveLevel::Series);
	identifier.put_str(tags::MODALITY, VR::CS, MODALITY_RT_IMAGE);
	identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study_uid);
	return_key(&mut identifier, tags::SERIES_INSTANCE_UID, VR::UI);
	identifier
}

/// Image level query for RT images of a study with the given Image Type (0008,0008),
/// e.g. `ORIGINAL\PRIMARY\PORTAL`.
pub fn image_query(study_uid: &str, image_type: &str) -> InMemDicomObject {
	let mut identifier = InMemDicomObject::new_empty();
	level(&mut identifier, QueryRetrieveLevel::Image);
	identifier.put_str(tags::MODALITY, VR::CS, MODALITY_RT_IMAGE);
	identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study_uid);
	identifier.put_str(tags::IMAGE_TYPE, VR::CS, image_type);
	return_key(&mut identifier, tags::SERIES_INSTANCE_UID, VR::UI);
	return_key(&mut identifier, tags::ACQUISITION_DATE, VR::DA);
	return_key(&mut identifier, tags::ACQUISITION_TIME, VR::TM);
	identifier.put(DataElement::new(
		tags::REFERENCED_RT_PLAN_SEQUENCE,
		VR::SQ,
		Value::Sequence(DataSetSequence::empty()),
	));
	identifier
}

/// Narrows an image level query down to a single series.
pub fn restrict_to_series(identifier: &mut InMemDicomObject, series_uid: &str) {
	identifier.put_str(tags::SERIES_INSTANCE_UID, VR::UI, series_uid);
}

/// Narrows an image level query down to images acquired on `date` (`YYYYMMDD`).
pub fn restrict_to_acquisition_date(identifier: &mut InMemDicomObject, date: &str) {
	identifier.put_str(tags::ACQUISITION_DATE, VR::DA, date);
}

/// Series level identifier for moving a single series.
pub fn move_identifier(study_uid: &str, series_uid: &str) -> InMemDicomObject {
	let mut identifier = series_query(study_uid);
	identifier.put_str(tags::SERIES_INSTANCE_UID, VR::UI, series_uid);
	identifier
}
