use crate::dimse::association;
use crate::dimse::cmove::{CompositeMoveRequest, CompositeMoveResponse};
use crate::dimse::{
	presentation_context_id, DicomMessageReader, DicomMessageWriter, NegotiationError, ReadError,
	StatusType, WriteError,
};
use crate::types::UI;
use association::client::ClientAssociation;
use async_stream::try_stream;
use dicom::dictionary_std::uids;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Service class user for the Study Root Query/Retrieve Information Model - MOVE SOP class.
pub struct MoveServiceClassUser<'a> {
	association: &'a ClientAssociation,
	timeout: Duration,
}

impl<'a> MoveServiceClassUser<'a> {
	pub const fn new(association: &'a ClientAssociation, timeout: Duration) -> Self {
		Self {
			association,
			timeout,
		}
	}

	/// Sends a C-MOVE-RQ and yields every C-MOVE-RSP, including the final one.
	/// The stream ends after the first response that is not pending.
	pub fn invoke(
		self,
		request: CompositeMoveRequest,
	) -> impl Stream<Item = Result<CompositeMoveResponse, MoveError>> + 'a {
		let association = self.association;
		let timeout = self.timeout;

		try_stream! {
			let abstract_syntax = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE;
			let presentation_context_id = presentation_context_id(association, abstract_syntax)
				.ok_or_else(|| NegotiationError::AbstractSyntaxRejected(UI::from(abstract_syntax)))?;

			association
				.write_message(request, Some(presentation_context_id), timeout)
				.await?;
			trace!("Sent C-MOVE-RQ");

			loop {
				let response = association.read_message(timeout).await?;
				let response = CompositeMoveResponse::try_from(response)?;
				debug!(
					status = response.status,
					remaining = ?response.remaining,
					completed = ?response.completed,
					failed = ?response.failed,
					"Received C-MOVE-RSP"
				);

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
pub enum MoveError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("C-MOVE response stream ended before a final status was received")]
	Interrupted,
}
