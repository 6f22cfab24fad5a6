use super::archive::QueryRetrieveAssociation;
use super::plan::PlanIdentity;
use super::query::{image_query, restrict_to_acquisition_date, restrict_to_series, series_query};
use super::records::{ImageRecord, SeriesRecord};
use super::{collect_identifiers, Error, RetrieveFilter};
use crate::types::{DA, TM, UI};
use tracing::{debug, info, instrument, warn};

/// An RT image series together with the metadata of its representative image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesCandidate {
	pub series_uid: UI,
	pub acquisition_date: DA,
	pub acquisition_time: TM,
	pub referenced_plan_uid: UI,
}

impl SeriesCandidate {
	/// Acquisition date and time concatenated, e.g. `20240315120000`.
	/// Compared as a plain string, so it is only meaningful if the archive formats all values alike.
	pub fn timestamp_key(&self) -> String {
		format!("{}{}", self.acquisition_date, self.acquisition_time)
	}

	pub fn qualifies_for(&self, plan_uid: &str) -> bool {
		self.referenced_plan_uid == plan_uid
	}
}

/// Picks the most recently acquired candidate that references the plan and, if given, was
/// acquired on `acquisition_date` (`YYYYMMDD`).
///
/// Candidates with equal timestamps are ordered by series UID, the greatest one wins.
pub fn select_latest(
	candidates: impl IntoIterator<Item = SeriesCandidate>,
	plan_uid: &str,
	acquisition_date: Option<&str>,
) -> Option<SeriesCandidate> {
	candidates
		.into_iter()
		.filter(|candidate| candidate.qualifies_for(plan_uid))
		.filter(|candidate| acquisition_date.is_none_or(|date| candidate.acquisition_date == date))
		.max_by_key(|candidate| (candidate.timestamp_key(), candidate.series_uid.clone()))
}

/// Finds the latest series of the plan's study whose representative image references the plan.
///
/// Only the first image returned per series is inspected. A series whose image query is rejected
/// by the archive does not qualify.
#[instrument(skip_all, fields(plan_uid = plan.plan_uid()))]
pub async fn correlate<A: QueryRetrieveAssociation>(
	association: &A,
	plan: &PlanIdentity,
	filter: &RetrieveFilter,
) -> Result<SeriesCandidate, Error> {
	let acquisition_date = filter.acquisition_date_string();
	let series = collect_identifiers(association.find(series_query(plan.study_uid()))).await?;
	debug!("Found {} RT image series", series.len());

	let mut candidates = Vec::with_capacity(series.len());
	for identifier in &series {
		let series_uid = match SeriesRecord::try_from(identifier) {
			Ok(record) => record.series_instance_uid,
			Err(err) => {
				warn!("Skipped series: {err}");
				continue;
			}
		};

		let mut query = image_query(plan.study_uid(), &filter.image_type);
		restrict_to_series(&mut query, &series_uid);
		if let Some(date) = &acquisition_date {
			restrict_to_acquisition_date(&mut query, date);
		}

		let images = match collect_identifiers(association.find(query)).await {
			Ok(images) => images,
			Err(Error::QueryRejected { status }) => {
				warn!(%series_uid, "Skipped series, image query ended with status {status:#06x}");
				continue;
			}
			Err(err) => return Err(err),
		};
		let Some(representative) = images.first() else {
			debug!(%series_uid, "No matching images");
			continue;
		};

		match ImageRecord::try_from(representative) {
			Ok(ImageRecord {
				acquisition_date,
				acquisition_time,
				referenced_plan_uid: Some(referenced_plan_uid),
				..
			}) => {
				debug!(%series_uid, %referenced_plan_uid, "Correlated series");
				candidates.push(SeriesCandidate {
					series_uid,
					acquisition_date,
					acquisition_time,
					referenced_plan_uid,
				});
			}
			Ok(_) => debug!(%series_uid, "Representative image references no plan"),
			Err(err) => warn!(%series_uid, "Skipped series: {err}"),
		}
	}

	let selected = select_latest(candidates, plan.plan_uid(), acquisition_date.as_deref())
		.ok_or_else(|| Error::NoQualifyingSeries {
			plan_uid: UI::from(plan.plan_uid()),
		})?;
	info!(
		series_uid = %selected.series_uid,
		timestamp = %selected.timestamp_key(),
		"Selected series"
	);
	Ok(selected)
}
