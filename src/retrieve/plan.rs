use super::records::{MissingAttribute, PlanRecord};
use super::Error;
use crate::types::UI;
use dicom::object::InMemDicomObject;
use std::fmt::{Display, Formatter};

/// A treatment plan resolved on the archive.
///
/// Only created from the results of the plan query, so both UIDs are always known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanIdentity {
	patient_id: String,
	plan_name: String,
	plan_uid: UI,
	study_uid: UI,
}

impl PlanIdentity {
	/// Resolves the plan from all identifiers returned for the plan query.
	pub(crate) fn from_matches(
		patient_id: &str,
		plan_name: &str,
		matches: &[InMemDicomObject],
	) -> Result<Self, Error> {
		match matches {
			[] => Err(Error::PlanNotFound {
				patient_id: patient_id.to_owned(),
				plan_name: plan_name.to_owned(),
			}),
			[identifier] => {
				let record = PlanRecord::try_from(identifier)
					.map_err(|MissingAttribute(tag)| Error::MalformedResponse { tag })?;
				Ok(Self {
					patient_id: patient_id.to_owned(),
					plan_name: plan_name.to_owned(),
					plan_uid: record.sop_instance_uid,
					study_uid: record.study_instance_uid,
				})
			}
			_ => Err(Error::AmbiguousPlan {
				patient_id: patient_id.to_owned(),
				plan_name: plan_name.to_owned(),
				matches: matches.len(),
			}),
		}
	}

	pub fn patient_id(&self) -> &str {
		&self.patient_id
	}

	pub fn plan_name(&self) -> &str {
		&self.plan_name
	}

	/// SOP Instance UID of the RT plan.
	pub fn plan_uid(&self) -> &str {
		&self.plan_uid
	}

	/// Study Instance UID of the study the plan belongs to.
	pub fn study_uid(&self) -> &str {
		&self.study_uid
	}
}

impl Display for PlanIdentity {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} ({}) of patient {}", self.plan_name, self.plan_uid, self.patient_id)
	}
}
