//! DIMSE messaging with the archive.
//! - [`cfind`] queries the archive (C-FIND service class user).
//! - [`cmove`] asks the archive to send a series to this node (C-MOVE service class user).
//! - [`cstore`] receives what the archive sends (C-STORE service class provider).

pub mod association;
pub mod cfind;
pub mod cmove;
pub mod cstore;

use crate::types::{UI, US};
use association::{Association, AssociationError};
use dicom::dictionary_std::tags;
use dicom::encoding::{TransferSyntax, TransferSyntaxIndex};
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Command Data Set Type (0000,0800) of a message followed by a data set.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Command Data Set Type (0000,0800) of a message without data set. Any other value means a
/// data set follows.
pub const DATA_SET_MISSING: US = 0x0101;

/// Status (0000,0900) of a completed operation.
pub const STATUS_SUCCESS: US = 0x0000;
/// Status (0000,0900) of an operation that has more responses to come.
pub const STATUS_PENDING: US = 0xFF00;

/// A command set and the data set that may follow it.
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
	/// The presentation context the message was received on or is to be sent on.
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DicomMessage")
			.field("presentation_context_id", &self.presentation_context_id)
			.field("has_data", &self.data.is_some())
			.finish_non_exhaustive()
	}
}

impl DicomMessage {
	/// Reads the Status (0000,0900) attribute of the command set.
	pub fn status(&self) -> Result<US, ReadError> {
		self.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tags::STATUS))
	}
}

/// Outcome class of a DIMSE status code.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl StatusType {
	/// Classifies a raw status code. Unknown codes are treated as failures.
	pub const fn classify(status: US) -> Self {
		match status {
			STATUS_SUCCESS => Self::Success,
			0xFF00 | 0xFF01 => Self::Pending,
			0xFE00 => Self::Cancel,
			0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Self::Warning,
			_ => Self::Failure,
		}
	}
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

/// Looks up the id of the negotiated presentation context for the given abstract syntax.
pub fn presentation_context_id<A: Association>(association: &A, abstract_syntax: &str) -> Option<u8> {
	association
		.presentation_contexts()
		.iter()
		.find(|pctx| pctx.abstract_syntax.trim_end_matches('\0') == abstract_syntax)
		.map(|pctx| pctx.id)
}

fn negotiated_context<A: Association>(
	association: &A,
	id: u8,
) -> Result<&PresentationContextNegotiated, NegotiationError> {
	association
		.presentation_contexts()
		.iter()
		.find(|pctx| pctx.id == id)
		.ok_or(NegotiationError::NoPresentationContext)
}

fn transfer_syntax_of(
	pctx: &PresentationContextNegotiated,
) -> Result<&'static TransferSyntax, NegotiationError> {
	let registry: &'static TransferSyntaxRegistry = &TransferSyntaxRegistry;
	registry
		.get(&pctx.transfer_syntax)
		.ok_or_else(|| NegotiationError::UnknownTransferSyntax(UI::from(&pctx.transfer_syntax)))
}

/// A P-DATA-TF carrying a single, complete fragment.
fn single_fragment(value_type: PDataValueType, presentation_context_id: u8, data: Vec<u8>) -> Pdu {
	Pdu::PData {
		data: vec![PDataValue {
			value_type,
			presentation_context_id,
			is_last: true,
			data,
		}],
	}
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = message.into();

		// Without an explicit context the first negotiated one is used
		let pctx = match presentation_context_id.or(message.presentation_context_id) {
			Some(id) => negotiated_context(self, id)?,
			None => self
				.presentation_contexts()
				.first()
				.ok_or(NegotiationError::NoPresentationContext)?,
		};

		let mut command = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
		self.send(single_fragment(PDataValueType::Command, pctx.id, command), timeout)
			.await?;

		if let Some(data_set) = message.data {
			let mut data = Vec::new();
			data_set.write_dataset_with_ts(&mut data, transfer_syntax_of(pctx)?)?;
			self.send(single_fragment(PDataValueType::Data, pctx.id, data), timeout)
				.await?;
		}
		Ok(())
	}
}

/// Collects P-DATA fragments until a message is complete.
#[derive(Default)]
struct MessageAssembler {
	command_fragments: Vec<u8>,
	data_fragments: Vec<u8>,
	command: Option<InMemDicomObject>,
}

impl MessageAssembler {
	/// Returns the message once its last fragment has been pushed.
	fn push<A: Association>(
		&mut self,
		association: &A,
		mut pdv: PDataValue,
	) -> Result<Option<DicomMessage>, ReadError> {
		let presentation_context_id = Some(pdv.presentation_context_id);
		match pdv.value_type {
			PDataValueType::Command => {
				trace!("Received command fragment (last={})", pdv.is_last);
				if self.command.is_some() {
					return Err(ReadError::OutOfOrder);
				}
				self.command_fragments.append(&mut pdv.data);
				if !pdv.is_last {
					return Ok(None);
				}

				let command = InMemDicomObject::read_dataset_with_ts(
					self.command_fragments.as_slice(),
					&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
				)?;
				let has_data_set = command
					.get(tags::COMMAND_DATA_SET_TYPE)
					.map(InMemElement::to_int::<US>)
					.and_then(Result::ok)
					.is_some_and(|value| value != DATA_SET_MISSING);
				if has_data_set {
					self.command = Some(command);
					Ok(None)
				} else {
					Ok(Some(DicomMessage {
						command,
						data: None,
						presentation_context_id,
					}))
				}
			}
			PDataValueType::Data => {
				trace!("Received data fragment (last={})", pdv.is_last);
				if self.command.is_none() {
					return Err(ReadError::OutOfOrder);
				}
				self.data_fragments.append(&mut pdv.data);
				if !pdv.is_last {
					return Ok(None);
				}

				let pctx = negotiated_context(association, pdv.presentation_context_id)?;
				let data = InMemDicomObject::read_dataset_with_ts(
					self.data_fragments.as_slice(),
					transfer_syntax_of(pctx)?,
				)?;
				Ok(self.command.take().map(|command| DicomMessage {
					command,
					data: Some(data),
					presentation_context_id,
				}))
			}
		}
	}
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut assembler = MessageAssembler::default();
		loop {
			match self.receive(timeout).await? {
				Pdu::PData { data } => {
					for pdv in data {
						if let Some(message) = assembler.push(self, pdv)? {
							return Ok(message);
						}
					}
				}
				pdu => return Err(ReadError::UnexpectedPdu(pdu)),
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to decode message: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Expected P-DATA-TF, got {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Message fragments arrived out of order")]
	OutOfOrder,
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Message has no value for {0}")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to encode message: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Transfer syntax '{0}' is not supported")]
	UnknownTransferSyntax(UI),
	#[error("No matching presentation context was negotiated")]
	NoPresentationContext,
	#[error("The archive did not accept a presentation context for '{0}'")]
	AbstractSyntaxRejected(UI),
}

/// Returns a new message id from a process wide counter.
pub fn next_message_id() -> US {
	static NEXT: AtomicU16 = AtomicU16::new(1);
	NEXT.fetch_add(1, Ordering::Relaxed)
}
