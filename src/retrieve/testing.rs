//! An in-memory archive that answers queries from a script and records what it was asked to do.

use super::archive::{
	Capability, QueryRetrieveAssociation, QueryRetrieveConnector, ReceiverFactory, StoreReceiver,
};
use super::{Error, RetrieveFilter, RetrieveSession};
use crate::dimse::association::AssociationError;
use crate::dimse::cfind::findscu::FindError;
use crate::dimse::cfind::CompositeFindResponse;
use crate::dimse::cmove::movescu::MoveError;
use crate::dimse::cmove::CompositeMoveResponse;
use crate::dimse::cstore::storescp::ReceiverError;
use crate::dimse::cstore::{StoreEvent, StoreEventHandler};
use crate::dimse::{STATUS_PENDING, STATUS_SUCCESS};
use crate::endpoint::EndpointIdentity;
use crate::types::{AE, UI, US};
use chrono::NaiveDate;
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{InMemDicomObject, Tag};
use futures::Stream;
use std::io;
use std::sync::{Arc, Mutex};

const PATIENT_ID: &str = "12345";
const PLAN_NAME: &str = "PlanA";
const PLAN_UID: &str = "1.2.3.100";
const STUDY_UID: &str = "1.2.3.1";
const S1: &str = "1.2.3.1.1";
const S2: &str = "1.2.3.1.2";
const S3: &str = "1.2.3.1.3";
const S4: &str = "1.2.3.1.4";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
	Connected(Vec<Capability>),
	Find(String),
	Moved { series_uid: UI, destination: AE },
	Released,
	ReceiverStarted(AE),
	ReceiverStopped,
}

#[derive(Clone, Default)]
struct ScriptedArchive {
	plans: Vec<InMemDicomObject>,
	series: Vec<InMemDicomObject>,
	images: Vec<InMemDicomObject>,
	/// Sent to the running receiver when the series they belong to is moved.
	instances: Vec<StoreEvent>,
	move_statuses: Vec<US>,
	find_status: US,
	/// Image queries for these series end with a failure status.
	rejected_series: Vec<UI>,
	refuse_connections: bool,
	refuse_bind: bool,
	journal: Arc<Mutex<Vec<Event>>>,
	receiver: Arc<Mutex<Option<Arc<dyn StoreEventHandler>>>>,
}

fn text(identifier: &InMemDicomObject, tag: Tag) -> Option<String> {
	identifier
		.get(tag)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_owned())
		.filter(|value| !value.is_empty())
}

fn identifier(attributes: &[(Tag, VR, &str)]) -> InMemDicomObject {
	InMemDicomObject::from_element_iter(
		attributes
			.iter()
			.map(|(tag, vr, value)| DataElement::new(*tag, *vr, PrimitiveValue::from(*value))),
	)
}

fn plan(sop_instance_uid: &str) -> InMemDicomObject {
	identifier(&[
		(tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid),
		(tags::STUDY_INSTANCE_UID, VR::UI, STUDY_UID),
	])
}

fn series(series_uid: &str) -> InMemDicomObject {
	identifier(&[(tags::SERIES_INSTANCE_UID, VR::UI, series_uid)])
}

fn image(series_uid: &str, date: &str, time: &str, plan_uid: Option<&str>) -> InMemDicomObject {
	let mut image = identifier(&[
		(tags::SERIES_INSTANCE_UID, VR::UI, series_uid),
		(tags::ACQUISITION_DATE, VR::DA, date),
		(tags::ACQUISITION_TIME, VR::TM, time),
	]);
	if let Some(plan_uid) = plan_uid {
		let reference = identifier(&[(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, plan_uid)]);
		image.put(DataElement::new(
			tags::REFERENCED_RT_PLAN_SEQUENCE,
			VR::SQ,
			Value::Sequence(DataSetSequence::from(vec![reference])),
		));
	}
	image
}

fn instance(series_uid: &str, sop_instance_uid: &str, dosimeter_unit: &str) -> StoreEvent {
	StoreEvent {
		calling_aet: AE::from("ESAPI"),
		sop_class_uid: UI::from(uids::RT_IMAGE_STORAGE),
		sop_instance_uid: UI::from(sop_instance_uid),
		transfer_syntax: UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
		data_set: identifier(&[
			(tags::SOP_CLASS_UID, VR::UI, uids::RT_IMAGE_STORAGE),
			(tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid),
			(tags::SERIES_INSTANCE_UID, VR::UI, series_uid),
			(tags::PRIMARY_DOSIMETER_UNIT, VR::CS, dosimeter_unit),
		]),
	}
}

impl ScriptedArchive {
	/// Patient 12345 with plan PlanA. Only S2 qualifies: S4 is newer, but its first image does not
	/// reference the plan.
	fn portal_images() -> Self {
		Self {
			plans: vec![plan(PLAN_UID)],
			series: vec![series(S1), series(S2), series(S3), series(S4)],
			images: vec![
				image(S1, "20240316", "080000", Some("1.2.3.999")),
				image(S2, "20240315", "120000", Some(PLAN_UID)),
				image(S2, "20240315", "120500", Some(PLAN_UID)),
				image(S3, "20240317", "090000", None),
				image(S4, "20240318", "100000", None),
				image(S4, "20240318", "100500", Some(PLAN_UID)),
			],
			instances: vec![
				instance(S2, "1.2.3.1.2.1", "MU"),
				instance(S2, "1.2.3.1.2.2", "MINUTE"),
				instance(S1, "1.2.3.1.1.1", "MU"),
			],
			move_statuses: vec![STATUS_PENDING, STATUS_PENDING, STATUS_SUCCESS],
			..Self::default()
		}
	}

	fn session(&self) -> RetrieveSession<Self, Self> {
		let local = EndpointIdentity::new("QATRACK", "127.0.0.1", 9999).unwrap();
		RetrieveSession::new(local, self.clone(), self.clone())
	}

	fn record(&self, event: Event) {
		self.journal.lock().unwrap().push(event);
	}

	fn journal(&self) -> Vec<Event> {
		self.journal.lock().unwrap().clone()
	}

	fn count(&self, event: &Event) -> usize {
		self.journal().iter().filter(|recorded| *recorded == event).count()
	}
}

impl QueryRetrieveConnector for ScriptedArchive {
	type Association = ScriptedAssociation;

	async fn connect(
		&self,
		capabilities: &[Capability],
	) -> Result<Self::Association, AssociationError> {
		if self.refuse_connections {
			return Err(AssociationError::Stream(io::Error::from(
				io::ErrorKind::ConnectionRefused,
			)));
		}
		self.record(Event::Connected(capabilities.to_vec()));
		Ok(ScriptedAssociation {
			archive: self.clone(),
			released: false,
		})
	}
}

struct ScriptedAssociation {
	archive: ScriptedArchive,
	released: bool,
}

impl QueryRetrieveAssociation for ScriptedAssociation {
	fn find(
		&self,
		identifier: InMemDicomObject,
	) -> impl Stream<Item = Result<CompositeFindResponse, FindError>> + '_ {
		let level = text(&identifier, tags::QUERY_RETRIEVE_LEVEL).unwrap_or_default();
		let modality = text(&identifier, tags::MODALITY).unwrap_or_default();
		self.archive.record(Event::Find(level.clone()));

		let records = match (level.as_str(), modality.as_str()) {
			("IMAGE", "RTPLAN") => &self.archive.plans,
			("SERIES", _) => &self.archive.series,
			_ => &self.archive.images,
		};
		let rejected = level == "IMAGE"
			&& text(&identifier, tags::SERIES_INSTANCE_UID)
				.is_some_and(|series_uid| self.archive.rejected_series.contains(&series_uid));
		if rejected {
			return futures::stream::iter(vec![Ok(CompositeFindResponse {
				status: 0xC000,
				data: None,
			})]);
		}
		// Archive side matching on the keys the image query can narrow down by
		let keys = [tags::SERIES_INSTANCE_UID, tags::ACQUISITION_DATE];
		let mut responses: Vec<_> = records
			.iter()
			.filter(|record| {
				keys.iter().all(|tag| match text(&identifier, *tag) {
					Some(key) => text(record, *tag).as_deref() == Some(key.as_str()),
					None => true,
				})
			})
			.map(|record| {
				Ok(CompositeFindResponse {
					status: STATUS_PENDING,
					data: Some(record.clone()),
				})
			})
			.collect();
		responses.push(Ok(CompositeFindResponse {
			status: self.archive.find_status,
			data: None,
		}));
		futures::stream::iter(responses)
	}

	fn move_to(
		&self,
		identifier: InMemDicomObject,
		destination: AE,
	) -> impl Stream<Item = Result<CompositeMoveResponse, MoveError>> + '_ {
		let series_uid = text(&identifier, tags::SERIES_INSTANCE_UID).unwrap_or_default();
		self.archive.record(Event::Moved {
			series_uid: series_uid.clone(),
			destination,
		});

		let receiver = self.archive.receiver.lock().unwrap().clone();
		if let Some(receiver) = receiver {
			self.archive
				.instances
				.iter()
				.filter(|event| {
					text(&event.data_set, tags::SERIES_INSTANCE_UID).as_deref()
						== Some(series_uid.as_str())
				})
				.for_each(|event| receiver.on_store(event.clone()));
		}

		let responses: Vec<_> = self
			.archive
			.move_statuses
			.iter()
			.map(|status| Ok(CompositeMoveResponse::with_status(*status)))
			.collect();
		futures::stream::iter(responses)
	}

	fn release(&mut self) {
		if !self.released {
			self.released = true;
			self.archive.record(Event::Released);
		}
	}
}

impl Drop for ScriptedAssociation {
	fn drop(&mut self) {
		self.release();
	}
}

impl ReceiverFactory for ScriptedArchive {
	type Receiver = ScriptedReceiver;

	async fn start(
		&self,
		local: &EndpointIdentity,
		handler: Arc<dyn StoreEventHandler>,
	) -> Result<Self::Receiver, ReceiverError> {
		if self.refuse_bind {
			return Err(ReceiverError::Bind {
				address: local.socket_addr()?,
				source: io::Error::from(io::ErrorKind::AddrInUse),
			});
		}
		*self.receiver.lock().unwrap() = Some(handler);
		self.record(Event::ReceiverStarted(AE::from(local.title())));
		Ok(ScriptedReceiver {
			archive: self.clone(),
			running: true,
		})
	}
}

struct ScriptedReceiver {
	archive: ScriptedArchive,
	running: bool,
}

impl ScriptedReceiver {
	fn stop(&mut self) {
		if self.running {
			self.running = false;
			self.archive.receiver.lock().unwrap().take();
			self.archive.record(Event::ReceiverStopped);
		}
	}
}

impl StoreReceiver for ScriptedReceiver {
	async fn shutdown(&mut self) {
		self.stop();
	}
}

impl Drop for ScriptedReceiver {
	fn drop(&mut self) {
		self.stop();
	}
}

fn position(journal: &[Event], event: &Event) -> usize {
	journal
		.iter()
		.position(|recorded| recorded == event)
		.unwrap_or_else(|| panic!("{event:?} not in {journal:?}"))
}

#[tokio::test]
async fn fetches_latest_portal_series() {
	let archive = ScriptedArchive::portal_images();
	let destination = tempfile::tempdir().unwrap();

	let timestamp = archive
		.session()
		.fetch_latest(PATIENT_ID, PLAN_NAME, &RetrieveFilter::default(), destination.path())
		.await
		.unwrap();
	assert_eq!(timestamp, "20240315120000");

	// The kV image was discarded, S1 was never requested
	assert!(destination.path().join("1.2.3.1.2.1.dcm").exists());
	assert!(!destination.path().join("1.2.3.1.2.2.dcm").exists());
	assert!(!destination.path().join("1.2.3.1.1.1.dcm").exists());

	let journal = archive.journal();
	let moved = Event::Moved {
		series_uid: UI::from(S2),
		destination: AE::from("QATRACK"),
	};
	assert!(
		position(&journal, &Event::ReceiverStarted(AE::from("QATRACK"))) < position(&journal, &moved)
	);
	assert_eq!(journal[journal.len() - 2..], [Event::Released, Event::ReceiverStopped]);
	assert_eq!(archive.count(&Event::Connected(vec![Capability::Find])), 1);
	assert_eq!(
		archive.count(&Event::Connected(vec![Capability::Find, Capability::Move])),
		1
	);
	assert_eq!(archive.count(&Event::Released), 2);
}

#[tokio::test]
async fn keeps_kv_images_if_requested() {
	let archive = ScriptedArchive::portal_images();
	let destination = tempfile::tempdir().unwrap();
	let filter = RetrieveFilter {
		ignore_low_energy: false,
		..RetrieveFilter::default()
	};

	archive
		.session()
		.fetch_latest(PATIENT_ID, PLAN_NAME, &filter, destination.path())
		.await
		.unwrap();
	assert!(destination.path().join("1.2.3.1.2.1.dcm").exists());
	assert!(destination.path().join("1.2.3.1.2.2.dcm").exists());
}

#[tokio::test]
async fn creates_missing_destination() {
	let archive = ScriptedArchive::portal_images();
	let root = tempfile::tempdir().unwrap();
	let destination = root.path().join("qa").join("portal");

	archive
		.session()
		.fetch_latest(PATIENT_ID, PLAN_NAME, &RetrieveFilter::default(), &destination)
		.await
		.unwrap();
	assert!(destination.join("1.2.3.1.2.1.dcm").exists());
}

#[tokio::test]
async fn plan_must_be_unique() {
	let archive = ScriptedArchive {
		plans: Vec::new(),
		..ScriptedArchive::portal_images()
	};
	let result = archive.session().resolve_plan(PATIENT_ID, PLAN_NAME).await;
	assert!(matches!(result, Err(Error::PlanNotFound { .. })));

	let archive = ScriptedArchive {
		plans: vec![plan(PLAN_UID), plan("1.2.3.101")],
		..ScriptedArchive::portal_images()
	};
	let result = archive.session().resolve_plan(PATIENT_ID, PLAN_NAME).await;
	assert!(matches!(result, Err(Error::AmbiguousPlan { matches: 2, .. })));
	assert_eq!(archive.count(&Event::Released), 1);
}

#[tokio::test]
async fn failed_query_is_rejected() {
	let archive = ScriptedArchive {
		find_status: 0xC000,
		..ScriptedArchive::portal_images()
	};
	let result = archive.session().resolve_plan(PATIENT_ID, PLAN_NAME).await;
	assert!(matches!(result, Err(Error::QueryRejected { status: 0xC000 })));
	assert_eq!(archive.count(&Event::Released), 1);
}

#[tokio::test]
async fn selects_by_acquisition_date() {
	let archive = ScriptedArchive::portal_images();
	let session = archive.session();
	let plan = session.resolve_plan(PATIENT_ID, PLAN_NAME).await.unwrap();

	let filter = RetrieveFilter {
		acquisition_date: NaiveDate::from_ymd_opt(2024, 3, 15),
		..RetrieveFilter::default()
	};
	let selected = session.select_latest_series(&plan, &filter).await.unwrap();
	assert_eq!(selected.series_uid, S2);
	assert_eq!(selected.referenced_plan_uid, PLAN_UID);

	let filter = RetrieveFilter {
		acquisition_date: NaiveDate::from_ymd_opt(2024, 3, 14),
		..RetrieveFilter::default()
	};
	let result = session.select_latest_series(&plan, &filter).await;
	assert!(matches!(result, Err(Error::NoQualifyingSeries { .. })));
}

#[tokio::test]
async fn rejected_image_query_skips_series() {
	let archive = ScriptedArchive {
		rejected_series: vec![UI::from(S1), UI::from(S3)],
		..ScriptedArchive::portal_images()
	};
	let session = archive.session();
	let plan = session.resolve_plan(PATIENT_ID, PLAN_NAME).await.unwrap();

	let selected = session
		.select_latest_series(&plan, &RetrieveFilter::default())
		.await
		.unwrap();
	assert_eq!(selected.series_uid, S2);
	// The plan query and one image query per series
	assert_eq!(archive.count(&Event::Find(String::from("IMAGE"))), 5);

	let archive = ScriptedArchive {
		rejected_series: vec![UI::from(S2)],
		..ScriptedArchive::portal_images()
	};
	let session = archive.session();
	let result = session
		.select_latest_series(&plan, &RetrieveFilter::default())
		.await;
	assert!(matches!(result, Err(Error::NoQualifyingSeries { .. })));
}

#[tokio::test]
async fn only_first_image_decides_qualification() {
	let archive = ScriptedArchive {
		series: vec![series(S4)],
		..ScriptedArchive::portal_images()
	};
	let session = archive.session();
	let plan = session.resolve_plan(PATIENT_ID, PLAN_NAME).await.unwrap();

	// A later image of S4 references the plan, its first one does not
	let result = session
		.select_latest_series(&plan, &RetrieveFilter::default())
		.await;
	assert!(matches!(result, Err(Error::NoQualifyingSeries { .. })));

	let archive = ScriptedArchive {
		images: vec![
			image(S4, "20240318", "100000", Some(PLAN_UID)),
			image(S4, "20240318", "100500", None),
		],
		..archive
	};
	let selected = archive
		.session()
		.select_latest_series(&plan, &RetrieveFilter::default())
		.await
		.unwrap();
	assert_eq!(selected.timestamp_key(), "20240318100000");
}

#[tokio::test]
async fn preselected_series_is_moved_without_queries() {
	let archive = ScriptedArchive::portal_images();
	let mut session = archive.session();
	let destination = tempfile::tempdir().unwrap();
	let filter = RetrieveFilter::default();

	let plan = session.resolve_plan(PATIENT_ID, PLAN_NAME).await.unwrap();
	let selected = session.select_latest_series(&plan, &filter).await.unwrap();
	let timestamp = session
		.retrieve_series(&plan, Some(&selected), &filter, destination.path())
		.await
		.unwrap();
	assert_eq!(timestamp, "20240315120000");

	let journal = archive.journal();
	let started = position(&journal, &Event::ReceiverStarted(AE::from("QATRACK")));
	assert!(!journal[started..]
		.iter()
		.any(|event| matches!(event, Event::Find(_))));
}

#[tokio::test]
async fn association_failure_stops_receiver() {
	let archive = ScriptedArchive::portal_images();
	let plan = archive
		.session()
		.resolve_plan(PATIENT_ID, PLAN_NAME)
		.await
		.unwrap();

	let offline = ScriptedArchive {
		refuse_connections: true,
		..archive.clone()
	};
	let destination = tempfile::tempdir().unwrap();
	let result = offline
		.session()
		.retrieve_series(&plan, None, &RetrieveFilter::default(), destination.path())
		.await;
	assert!(matches!(result, Err(Error::AssociationFailed(_))));

	let journal = archive.journal();
	assert_eq!(
		journal[journal.len() - 2..],
		[Event::ReceiverStarted(AE::from("QATRACK")), Event::ReceiverStopped]
	);
}

#[tokio::test]
async fn rejected_move_releases_everything() {
	// Pending with warnings is not accepted either
	let scripts = [
		(vec![STATUS_PENDING, 0xA701], 0xA701),
		(vec![0xFF01, STATUS_SUCCESS], 0xFF01),
	];
	for (move_statuses, expected) in scripts {
		let archive = ScriptedArchive {
			move_statuses,
			..ScriptedArchive::portal_images()
		};
		let destination = tempfile::tempdir().unwrap();
		let result = archive
			.session()
			.fetch_latest(PATIENT_ID, PLAN_NAME, &RetrieveFilter::default(), destination.path())
			.await;

		match result {
			Err(Error::RetrieveRejected { status }) => assert_eq!(status, expected),
			other => panic!("Unexpected result {other:?}"),
		}

		let journal = archive.journal();
		assert_eq!(journal[journal.len() - 2..], [Event::Released, Event::ReceiverStopped]);
	}
}

#[tokio::test]
async fn interrupted_move_is_an_association_failure() {
	let archive = ScriptedArchive {
		move_statuses: vec![STATUS_PENDING],
		..ScriptedArchive::portal_images()
	};
	let destination = tempfile::tempdir().unwrap();
	let result = archive
		.session()
		.fetch_latest(PATIENT_ID, PLAN_NAME, &RetrieveFilter::default(), destination.path())
		.await;
	assert!(matches!(result, Err(Error::AssociationFailed(_))));
	assert_eq!(archive.count(&Event::ReceiverStopped), 1);
}

#[tokio::test]
async fn receiver_start_failure() {
	let archive = ScriptedArchive {
		refuse_bind: true,
		..ScriptedArchive::portal_images()
	};
	let destination = tempfile::tempdir().unwrap();
	let result = archive
		.session()
		.fetch_latest(PATIENT_ID, PLAN_NAME, &RetrieveFilter::default(), destination.path())
		.await;
	assert!(matches!(result, Err(Error::ReceiverStartFailed(_))));

	// Only the plan query went out
	assert_eq!(archive.count(&Event::Connected(vec![Capability::Find])), 1);
	assert_eq!(
		archive.count(&Event::Connected(vec![Capability::Find, Capability::Move])),
		0
	);
}

#[tokio::test]
async fn session_can_retrieve_repeatedly() {
	let archive = ScriptedArchive::portal_images();
	let mut session = archive.session();
	let destination = tempfile::tempdir().unwrap();
	let filter = RetrieveFilter::default();
	let plan = session.resolve_plan(PATIENT_ID, PLAN_NAME).await.unwrap();

	for _ in 0..2 {
		let timestamp = session
			.retrieve_series(&plan, None, &filter, destination.path())
			.await
			.unwrap();
		assert_eq!(timestamp, "20240315120000");
	}
	assert_eq!(archive.count(&Event::ReceiverStopped), 2);
	assert_eq!(archive.count(&Event::Released), 3);
}
