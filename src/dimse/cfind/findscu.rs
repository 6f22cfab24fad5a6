use crate::dimse::association;
use crate::dimse::cfind::{CompositeFindRequest, CompositeFindResponse};
use crate::dimse::{
	presentation_context_id, DicomMessageReader, DicomMessageWriter, NegotiationError, ReadError,
	StatusType, WriteError,
};
use crate::types::{Priority, UI, US};
use association::client::ClientAssociation;
use async_stream::try_stream;
use dicom::dictionary_std::uids;
use dicom::object::InMemDicomObject;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Service class user for the Study Root Query/Retrieve Information Model - FIND SOP class.
pub struct FindServiceClassUser<'a> {
	association: &'a ClientAssociation,
	timeout: Duration,
}

pub struct FindServiceClassUserOptions {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: Priority,
}

impl From<FindServiceClassUserOptions> for CompositeFindRequest {
	fn from(options: FindServiceClassUserOptions) -> Self {
		Self {
			identifier: options.identifier,
			message_id: options.message_id,
			priority: options.priority as US,
			affected_sop_class_uid: UI::from(
				uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			),
		}
	}
}

impl<'a> FindServiceClassUser<'a> {
	pub const fn new(association: &'a ClientAssociation, timeout: Duration) -> Self {
		Self {
			association,
			timeout,
		}
	}

	/// Sends a C-FIND-RQ and yields every C-FIND-RSP, including the final one.
	/// The stream ends after the first response that is not pending.
	pub fn invoke(
		self,
		options: FindServiceClassUserOptions,
	) -> impl Stream<Item = Result<CompositeFindResponse, FindError>> + 'a {
		let association = self.association;
		let timeout = self.timeout;

		try_stream! {
			let abstract_syntax = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
			let presentation_context_id = presentation_context_id(association, abstract_syntax)
				.ok_or_else(|| NegotiationError::AbstractSyntaxRejected(UI::from(abstract_syntax)))?;

			let request = CompositeFindRequest::from(options);
			association
				.write_message(request, Some(presentation_context_id), timeout)
				.await?;
			trace!("Sent C-FIND-RQ");

			loop {
				let response = association.read_message(timeout).await?;
				let response = CompositeFindResponse::try_from(response)?;
				trace!(status = response.status, "Received C-FIND-RSP");

				let status_type = response.status_type();
				yield response;

				if status_type != StatusType::Pending {
					break;
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}
