use crate::dimse::cstore::{StoreEvent, StoreEventHandler};
use anyhow::Context;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Primary Dosimeter Unit (300A,00B3) of kV images, which are dosed in minutes instead of MU.
const LOW_ENERGY_DOSIMETER_UNIT: &str = "MINUTE";
const MAX_UID_LENGTH: usize = 64;

/// What happened to a received object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreDecision {
	Persisted(PathBuf),
	Discarded,
	Failed,
}

/// Writes objects received during a retrieve into a directory.
#[derive(Debug, Clone)]
pub struct ImageSink {
	destination: PathBuf,
	ignore_low_energy: bool,
}

impl ImageSink {
	pub fn new(destination: impl Into<PathBuf>, ignore_low_energy: bool) -> Self {
		Self {
			destination: destination.into(),
			ignore_low_energy,
		}
	}

	/// Discards low energy images if configured to, otherwise writes the object to
	/// `<destination>/<SOP Instance UID>.dcm`. Failures are logged and not propagated.
	/// Objects whose SOP Instance UID is not a valid UID are never written.
	pub fn on_object_received(&self, event: StoreEvent) -> StoreDecision {
		let sop_instance_uid = event.sop_instance_uid.clone();

		if !is_valid_uid(&sop_instance_uid) {
			error!(%sop_instance_uid, "Refused to store object with invalid SOP Instance UID");
			return StoreDecision::Failed;
		}

		if self.ignore_low_energy && is_low_energy(&event.data_set) {
			info!(%sop_instance_uid, "Discarded kV image");
			return StoreDecision::Discarded;
		}

		let path = self.destination.join(format!("{sop_instance_uid}.dcm"));
		match Self::persist(event, &path) {
			Ok(()) => {
				info!(%sop_instance_uid, "Wrote {}", path.display());
				StoreDecision::Persisted(path)
			}
			Err(err) => {
				error!(%sop_instance_uid, "{err:#}");
				StoreDecision::Failed
			}
		}
	}

	fn persist(event: StoreEvent, path: &Path) -> anyhow::Result<()> {
		event
			.into_file_object()?
			.write_to_file(path)
			.with_context(|| format!("Failed to write {}", path.display()))
	}
}

impl StoreEventHandler for ImageSink {
	fn on_store(&self, event: StoreEvent) {
		self.on_object_received(event);
	}
}

/// Digits and dots only, so the UID can be used as a file name.
fn is_valid_uid(uid: &str) -> bool {
	!uid.is_empty()
		&& uid.len() <= MAX_UID_LENGTH
		&& uid.bytes().all(|byte| byte.is_ascii_digit() || byte == b'.')
}

fn is_low_energy(data_set: &InMemDicomObject) -> bool {
	data_set
		.get(tags::PRIMARY_DOSIMETER_UNIT)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.is_some_and(|unit| {
			unit.trim_matches(|c: char| c == '\0' || c.is_whitespace()) == LOW_ENERGY_DOSIMETER_UNIT
		})
}
