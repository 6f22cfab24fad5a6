//! The seam between the retrieve logic and the network.
//!
//! [`DimseArchive`] and [`DimseReceivers`] implement it on top of the [`crate::dimse`] layer.

use crate::dimse::association::client::{ClientAssociation, ClientAssociationOptions};
use crate::dimse::association::AssociationError;
use crate::dimse::cfind::findscu::{FindError, FindServiceClassUser, FindServiceClassUserOptions};
use crate::dimse::cfind::CompositeFindResponse;
use crate::dimse::cmove::movescu::{MoveError, MoveServiceClassUser};
use crate::dimse::cmove::{CompositeMoveRequest, CompositeMoveResponse};
use crate::dimse::cstore::storescp::{
	ReceiverError, StoreReceiverHandle, StoreServiceClassProvider,
	StoreServiceClassProviderOptions,
};
use crate::dimse::cstore::StoreEventHandler;
use crate::dimse::next_message_id;
use crate::endpoint::{EndpointIdentity, InvalidEndpoint};
use crate::types::{Priority, AE};
use dicom::dictionary_std::uids;
use dicom::object::InMemDicomObject;
use futures::Stream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Services requested when opening an association with the archive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Capability {
	Find,
	Move,
}

impl Capability {
	pub const fn abstract_syntax(self) -> &'static str {
		match self {
			Self::Find => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Move => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
		}
	}
}

/// Opens associations with the archive.
pub trait QueryRetrieveConnector {
	type Association: QueryRetrieveAssociation;

	async fn connect(
		&self,
		capabilities: &[Capability],
	) -> Result<Self::Association, AssociationError>;
}

/// An open association with the archive.
pub trait QueryRetrieveAssociation {
	/// Sends a C-FIND-RQ and streams all C-FIND-RSPs, the final one included.
	fn find(
		&self,
		identifier: InMemDicomObject,
	) -> impl Stream<Item = Result<CompositeFindResponse, FindError>> + '_;

	/// Sends a C-MOVE-RQ and streams all C-MOVE-RSPs, the final one included.
	fn move_to(
		&self,
		identifier: InMemDicomObject,
		destination: AE,
	) -> impl Stream<Item = Result<CompositeMoveResponse, MoveError>> + '_;

	/// Releases the association. Calling this more than once has no effect.
	fn release(&mut self);
}

/// Starts store receivers for the objects an archive sends back during a move.
pub trait ReceiverFactory {
	type Receiver: StoreReceiver;

	/// Returns as soon as the receiver accepts connections on the local endpoint.
	async fn start(
		&self,
		local: &EndpointIdentity,
		handler: Arc<dyn StoreEventHandler>,
	) -> Result<Self::Receiver, ReceiverError>;
}

pub trait StoreReceiver {
	/// Stops the receiver and returns once the local endpoint is free again.
	/// Calling this more than once has no effect.
	async fn shutdown(&mut self);
}

/// Connects to the archive over the network.
#[derive(Debug, Clone)]
pub struct DimseArchive {
	calling_aet: AE,
	called_aet: AE,
	address: SocketAddr,
	timeout: Duration,
}

impl DimseArchive {
	pub fn new(
		local: &EndpointIdentity,
		remote: &EndpointIdentity,
		timeout: Duration,
	) -> Result<Self, InvalidEndpoint> {
		Ok(Self {
			calling_aet: AE::from(local.title()),
			called_aet: AE::from(remote.title()),
			address: remote.socket_addr()?,
			timeout,
		})
	}
}

impl QueryRetrieveConnector for DimseArchive {
	type Association = DimseAssociation;

	#[instrument(skip_all, fields(called_aet = %self.called_aet, peer = %self.address))]
	async fn connect(
		&self,
		capabilities: &[Capability],
	) -> Result<Self::Association, AssociationError> {
		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			abstract_syntaxes: capabilities
				.iter()
				.map(|capability| String::from(capability.abstract_syntax()))
				.collect(),
			transfer_syntaxes: vec![
				String::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
				String::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
			],
			address: self.address,
		};

		Ok(DimseAssociation {
			inner: ClientAssociation::new(options).await?,
			timeout: self.timeout,
		})
	}
}

pub struct DimseAssociation {
	inner: ClientAssociation,
	timeout: Duration,
}

impl QueryRetrieveAssociation for DimseAssociation {
	fn find(
		&self,
		identifier: InMemDicomObject,
	) -> impl Stream<Item = Result<CompositeFindResponse, FindError>> + '_ {
		let options = FindServiceClassUserOptions {
			identifier,
			message_id: next_message_id(),
			priority: Priority::Medium,
		};
		FindServiceClassUser::new(&self.inner, self.timeout).invoke(options)
	}

	fn move_to(
		&self,
		identifier: InMemDicomObject,
		destination: AE,
	) -> impl Stream<Item = Result<CompositeMoveResponse, MoveError>> + '_ {
		let request = CompositeMoveRequest::new(next_message_id(), destination).identifier(identifier);
		MoveServiceClassUser::new(&self.inner, self.timeout).invoke(request)
	}

	fn release(&mut self) {
		self.inner.release();
	}
}

/// Starts a [`StoreServiceClassProvider`] per retrieve.
#[derive(Debug, Clone)]
pub struct DimseReceivers {
	uncompressed: bool,
	timeout: Duration,
}

impl DimseReceivers {
	pub const fn new(uncompressed: bool, timeout: Duration) -> Self {
		Self {
			uncompressed,
			timeout,
		}
	}
}

impl ReceiverFactory for DimseReceivers {
	type Receiver = StoreReceiverHandle;

	async fn start(
		&self,
		local: &EndpointIdentity,
		handler: Arc<dyn StoreEventHandler>,
	) -> Result<Self::Receiver, ReceiverError> {
		let options = StoreServiceClassProviderOptions {
			aet: AE::from(local.title()),
			address: local.socket_addr()?,
			uncompressed: self.uncompressed,
			timeout: self.timeout,
		};
		StoreServiceClassProvider::new(options, handler).spawn().await
	}
}

impl StoreReceiver for StoreReceiverHandle {
	async fn shutdown(&mut self) {
		Self::shutdown(self).await;
	}
}
