//! Locates the latest RT image series of a treatment plan and moves it into a local directory.
//!
//! A retrieve runs in three steps, each of them available on its own:
//! 1. [`RetrieveSession::resolve_plan`] finds the unique RT plan for a patient ID and plan label.
//! 2. [`RetrieveSession::select_latest_series`] looks at every RT image series of the plan's study,
//!    keeps those whose first image references the plan and picks the latest acquisition.
//! 3. [`RetrieveSession::retrieve_series`] starts a store receiver, moves the series to it and
//!    returns the acquisition timestamp.

pub mod archive;
pub mod correlation;
pub mod plan;
pub mod query;
pub mod records;
pub mod store;
#[cfg(test)]
mod testing;

use crate::config::AppConfig;
use crate::dimse::association::AssociationError;
use crate::dimse::cfind::findscu::FindError;
use crate::dimse::cfind::CompositeFindResponse;
use crate::dimse::cmove::movescu::MoveError;
use crate::dimse::cmove::CompositeMoveResponse;
use crate::dimse::cstore::storescp::ReceiverError;
use crate::dimse::{StatusType, STATUS_PENDING, STATUS_SUCCESS};
use crate::endpoint::{EndpointIdentity, InvalidEndpoint};
use crate::types::{AE, DA, UI, US};
use archive::{
	Capability, DimseArchive, DimseReceivers, QueryRetrieveAssociation, QueryRetrieveConnector,
	ReceiverFactory, StoreReceiver,
};
use chrono::NaiveDate;
use correlation::{correlate, SeriesCandidate};
use dicom::object::{InMemDicomObject, Tag};
use futures::{Stream, StreamExt};
use plan::PlanIdentity;
use query::{move_identifier, plan_query};
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;
use store::ImageSink;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	InvalidEndpoint(#[from] InvalidEndpoint),
	#[error("Association with the archive failed: {0}")]
	AssociationFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
	#[error("No plan '{plan_name}' found for patient {patient_id}")]
	PlanNotFound {
		patient_id: String,
		plan_name: String,
	},
	#[error("{matches} plans named '{plan_name}' found for patient {patient_id}")]
	AmbiguousPlan {
		patient_id: String,
		plan_name: String,
		matches: usize,
	},
	#[error("No RT image series references plan {plan_uid}")]
	NoQualifyingSeries { plan_uid: UI },
	#[error("Failed to start the store receiver: {0}")]
	ReceiverStartFailed(#[from] ReceiverError),
	#[error("Archive rejected the C-MOVE with status {status:#06x}")]
	RetrieveRejected { status: US },
	#[error("Archive rejected the C-FIND with status {status:#06x}")]
	QueryRejected { status: US },
	#[error("Archive returned a match without {tag}")]
	MalformedResponse { tag: Tag },
	#[error("Failed to prepare the destination directory: {0}")]
	Io(#[from] std::io::Error),
}

impl From<AssociationError> for Error {
	fn from(err: AssociationError) -> Self {
		Self::AssociationFailed(Box::new(err))
	}
}

impl From<FindError> for Error {
	fn from(err: FindError) -> Self {
		Self::AssociationFailed(Box::new(err))
	}
}

impl From<MoveError> for Error {
	fn from(err: MoveError) -> Self {
		Self::AssociationFailed(Box::new(err))
	}
}

/// Narrows down which images of a plan are retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveFilter {
	/// Image Type (0008,0008) the images are queried with.
	pub image_type: String,
	/// Discard kV images as they arrive.
	pub ignore_low_energy: bool,
	/// Only consider series acquired on this day.
	pub acquisition_date: Option<NaiveDate>,
}

impl RetrieveFilter {
	pub const PORTAL_IMAGE_TYPE: &'static str = r"ORIGINAL\PRIMARY\PORTAL";

	pub fn new(image_type: impl Into<String>) -> Self {
		Self {
			image_type: image_type.into(),
			ignore_low_energy: true,
			acquisition_date: None,
		}
	}

	/// The acquisition date formatted as DICOM date (`YYYYMMDD`).
	pub fn acquisition_date_string(&self) -> Option<DA> {
		self.acquisition_date
			.map(|date| date.format("%Y%m%d").to_string())
	}
}

impl Default for RetrieveFilter {
	fn default() -> Self {
		Self::new(Self::PORTAL_IMAGE_TYPE)
	}
}

/// Collects the identifiers of all C-FIND responses.
async fn collect_identifiers(
	responses: impl Stream<Item = Result<CompositeFindResponse, FindError>>,
) -> Result<Vec<InMemDicomObject>, Error> {
	let mut responses = pin!(responses);
	let mut identifiers = Vec::new();
	while let Some(response) = responses.next().await {
		let response = response?;
		match response.status_type() {
			StatusType::Pending | StatusType::Success => {}
			_ => return Err(Error::QueryRejected { status: response.status }),
		}
		if let Some(identifier) = response.data {
			identifiers.push(identifier);
		}
	}
	Ok(identifiers)
}

/// Drives a C-MOVE until it completes.
/// Any status other than success or pending aborts it, including pending with warnings.
async fn await_move(
	responses: impl Stream<Item = Result<CompositeMoveResponse, MoveError>>,
) -> Result<(), Error> {
	let mut responses = pin!(responses);
	while let Some(response) = responses.next().await {
		let response = response?;
		match response.status {
			STATUS_PENDING => {}
			STATUS_SUCCESS => {
				info!(
					completed = ?response.completed,
					failed = ?response.failed,
					warning = ?response.warning,
					"C-MOVE completed"
				);
				return Ok(());
			}
			status => return Err(Error::RetrieveRejected { status }),
		}
	}
	Err(MoveError::Interrupted.into())
}

/// Runs plan resolution, series selection and retrieves against one archive.
pub struct RetrieveSession<C, R> {
	local: EndpointIdentity,
	connector: C,
	receivers: R,
}

impl RetrieveSession<DimseArchive, DimseReceivers> {
	/// A session talking DIMSE to the configured remote endpoint.
	pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
		let timeout = config.dimse.timeout();
		let archive = DimseArchive::new(&config.local, &config.remote, timeout)?;
		let receivers = DimseReceivers::new(config.dimse.uncompressed, timeout);
		Ok(Self::new(config.local.clone(), archive, receivers))
	}
}

impl<C, R> RetrieveSession<C, R>
where
	C: QueryRetrieveConnector,
	R: ReceiverFactory,
{
	/// `local` is both the calling AE title and the endpoint the store receiver listens on.
	pub const fn new(local: EndpointIdentity, connector: C, receivers: R) -> Self {
		Self {
			local,
			connector,
			receivers,
		}
	}

	#[instrument(skip(self))]
	pub async fn resolve_plan(
		&self,
		patient_id: &str,
		plan_name: &str,
	) -> Result<PlanIdentity, Error> {
		let mut association = self.connector.connect(&[Capability::Find]).await?;
		let matches =
			collect_identifiers(association.find(plan_query(patient_id, plan_name))).await;
		association.release();

		let plan = PlanIdentity::from_matches(patient_id, plan_name, &matches?)?;
		info!("Resolved plan {plan}");
		Ok(plan)
	}

	#[instrument(skip_all, fields(plan_uid = plan.plan_uid()))]
	pub async fn select_latest_series(
		&self,
		plan: &PlanIdentity,
		filter: &RetrieveFilter,
	) -> Result<SeriesCandidate, Error> {
		let mut association = self.connector.connect(&[Capability::Find]).await?;
		let selected = correlate(&association, plan, filter).await;
		association.release();
		selected
	}

	/// Moves a series of the plan into `destination` and returns its acquisition timestamp.
	///
	/// The series is selected on the association used for the move, unless `selected` is given.
	/// The store receiver is running before the move is requested and is shut down after the
	/// association was released, on success and failure alike.
	#[allow(clippy::needless_pass_by_ref_mut)]
	#[instrument(skip_all, fields(plan_uid = plan.plan_uid(), destination = %destination.display()))]
	pub async fn retrieve_series(
		&mut self,
		plan: &PlanIdentity,
		selected: Option<&SeriesCandidate>,
		filter: &RetrieveFilter,
		destination: &Path,
	) -> Result<String, Error> {
		tokio::fs::create_dir_all(destination).await?;

		let sink = Arc::new(ImageSink::new(destination, filter.ignore_low_energy));
		let mut receiver = self.receivers.start(&self.local, sink).await?;

		let result = match self
			.connector
			.connect(&[Capability::Find, Capability::Move])
			.await
		{
			Ok(mut association) => {
				let result = self.move_series(&association, plan, selected, filter).await;
				association.release();
				result
			}
			Err(err) => Err(Error::from(err)),
		};

		receiver.shutdown().await;
		result
	}

	async fn move_series(
		&self,
		association: &C::Association,
		plan: &PlanIdentity,
		selected: Option<&SeriesCandidate>,
		filter: &RetrieveFilter,
	) -> Result<String, Error> {
		let candidate = match selected {
			Some(candidate) => candidate.clone(),
			None => correlate(association, plan, filter).await?,
		};

		info!(
			series_uid = %candidate.series_uid,
			destination = self.local.title(),
			"Requesting C-MOVE"
		);
		let identifier = move_identifier(plan.study_uid(), &candidate.series_uid);
		await_move(association.move_to(identifier, AE::from(self.local.title()))).await?;

		Ok(candidate.timestamp_key())
	}

	/// Resolves the plan and retrieves its latest series into `destination`.
	pub async fn fetch_latest(
		&mut self,
		patient_id: &str,
		plan_name: &str,
		filter: &RetrieveFilter,
		destination: &Path,
	) -> Result<String, Error> {
		let plan = self.resolve_plan(patient_id, plan_name).await?;
		self.retrieve_series(&plan, None, filter, destination).await
	}
}
