//! Typed views over the identifiers returned by the archive.

use crate::types::{DA, TM, UI};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Returned identifier has no value for {0}")]
pub struct MissingAttribute(pub Tag);

/// Reads a string attribute without padding. Absent and empty attributes are both `None`.
fn string(identifier: &InMemDicomObject, tag: Tag) -> Option<String> {
	identifier
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_owned())
		.filter(|value| !value.is_empty())
}

fn required(identifier: &InMemDicomObject, tag: Tag) -> Result<String, MissingAttribute> {
	string(identifier, tag).ok_or(MissingAttribute(tag))
}

/// A match of the plan query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRecord {
	pub sop_instance_uid: UI,
	pub study_instance_uid: UI,
}

impl TryFrom<&InMemDicomObject> for PlanRecord {
	type Error = MissingAttribute;

	fn try_from(identifier: &InMemDicomObject) -> Result<Self, Self::Error> {
		Ok(Self {
			sop_instance_uid: required(identifier, tags::SOP_INSTANCE_UID)?,
			study_instance_uid: required(identifier, tags::STUDY_INSTANCE_UID)?,
		})
	}
}

/// A match of the series query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRecord {
	pub series_instance_uid: UI,
}

impl TryFrom<&InMemDicomObject> for SeriesRecord {
	type Error = MissingAttribute;

	fn try_from(identifier: &InMemDicomObject) -> Result<Self, Self::Error> {
		Ok(Self {
			series_instance_uid: required(identifier, tags::SERIES_INSTANCE_UID)?,
		})
	}
}

/// A match of the image query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
	pub series_instance_uid: UI,
	/// Empty if the archive did not return it.
	pub acquisition_date: DA,
	/// Empty if the archive did not return it.
	pub acquisition_time: TM,
	/// Referenced SOP Instance UID of the first item of the Referenced RT Plan Sequence.
	pub referenced_plan_uid: Option<UI>,
}

impl TryFrom<&InMemDicomObject> for ImageRecord {
	type Error = MissingAttribute;

	fn try_from(identifier: &InMemDicomObject) -> Result<Self, Self::Error> {
		let referenced_plan_uid = identifier
			.get(tags::REFERENCED_RT_PLAN_SEQUENCE)
			.and_then(InMemElement::items)
			.and_then(<[InMemDicomObject]>::first)
			.and_then(|item| string(item, tags::REFERENCED_SOP_INSTANCE_UID));

		Ok(Self {
			series_instance_uid: required(identifier, tags::SERIES_INSTANCE_UID)?,
			acquisition_date: string(identifier, tags::ACQUISITION_DATE).unwrap_or_default(),
			acquisition_time: string(identifier, tags::ACQUISITION_TIME).unwrap_or_default(),
			referenced_plan_uid,
		})
	}
}
