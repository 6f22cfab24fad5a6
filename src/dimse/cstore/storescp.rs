use crate::dimse::association;
use crate::dimse::cstore::{
	CompositeStoreResponse, StoreEvent, StoreEventHandler, COMMAND_FIELD_COMPOSITE_STORE_REQUEST,
};
use crate::dimse::{DicomMessageReader, DicomMessageWriter};
use crate::types::{AE, UI, US};
use anyhow::Context;
use association::server::{ServerAssociation, ServerAssociationOptions};
use association::Association;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

pub struct StoreServiceClassProviderOptions {
	/// The AE title the provider answers with.
	pub aet: AE,
	pub address: SocketAddr,
	/// Only accept native (uncompressed) transfer syntaxes.
	pub uncompressed: bool,
	/// Timeout for writing C-STORE-RSP messages.
	pub timeout: Duration,
}

/// Transient store service class provider. It accepts inbound associations in the background
/// until the returned [`StoreReceiverHandle`] is shut down.
pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
}

struct InnerStoreServiceClassProvider {
	options: StoreServiceClassProviderOptions,
	handler: Arc<dyn StoreEventHandler>,
}

impl StoreServiceClassProvider {
	pub fn new(options: StoreServiceClassProviderOptions, handler: Arc<dyn StoreEventHandler>) -> Self {
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider { options, handler }),
		}
	}

	/// Binds the listener and starts accepting connections without blocking the caller.
	pub async fn spawn(self) -> Result<StoreReceiverHandle, ReceiverError> {
		let address = self.inner.options.address;
		let listener = TcpListener::bind(&address)
			.await
			.map_err(|source| ReceiverError::Bind { address, source })?;
		let local_addr = listener
			.local_addr()
			.map_err(|source| ReceiverError::Bind { address, source })?;
		info!("Started Store Service Class Provider on {local_addr}");

		let task = tokio::spawn(Self::accept(listener, self.inner));
		Ok(StoreReceiverHandle {
			task: Some(task),
			local_addr,
		})
	}

	async fn accept(listener: TcpListener, inner: Arc<InnerStoreServiceClassProvider>) {
		// Connections live inside this task, so aborting it tears all of them down.
		let mut connections = JoinSet::new();
		loop {
			tokio::select! {
				accepted = listener.accept() => match accepted {
					Ok((stream, peer)) => {
						let span = info_span!(
							"STORE-SCP",
							aet = &inner.options.aet,
							peer = peer.to_string()
						);
						info!("Accepted incoming connection from {peer}");
						let inner = Arc::clone(&inner);
						connections.spawn(async move {
							if let Err(err) = Self::process(stream, inner).instrument(span).await {
								error!("{err:#}");
							}
						});
					}
					Err(err) => error!("Failed to accept incoming connection: {err}"),
				},
				Some(joined) = connections.join_next(), if !connections.is_empty() => {
					if let Err(err) = joined {
						warn!("STORE-SCP connection task failed: {err}");
					}
				}
			}
		}
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// This is required because the `dicom-rs` crate does not use non-blocking reads/writes.
		// The actual reading/writing happens in ServerAssociation, which moves IO operation
		// to another thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.options.aet.clone(),
			tcp_stream,
			uncompressed: inner.options.uncompressed,
		};
		let association = ServerAssociation::new(options).await?;

		// Duration::MAX to indefinitely wait for incoming messages
		while let Ok(message) = association.read_message(Duration::MAX).await {
			let pctx = message
				.presentation_context_id
				.and_then(|id| {
					association
						.presentation_contexts()
						.iter()
						.find(|pctx| pctx.id == id)
				})
				.context("No presentation context available")?;
			debug!(
				"Used transfer syntax {} to read message",
				pctx.transfer_syntax
			);

			let command_field = message
				.command
				.get(tags::COMMAND_FIELD)
				.map(InMemElement::to_int::<US>)
				.and_then(Result::ok)
				.context("Missing tag COMMAND_FIELD (0000,0100)")?;

			if command_field != COMMAND_FIELD_COMPOSITE_STORE_REQUEST {
				return Err(anyhow::Error::msg(
					"Unexpected Command Field. Only C-STORE-RQ is supported.",
				));
			}

			let message_id = message
				.command
				.get(tags::MESSAGE_ID)
				.map(InMemElement::to_int)
				.and_then(Result::ok)
				.unwrap_or(0);

			let sop_class_uid = message
				.command
				.get(tags::AFFECTED_SOP_CLASS_UID)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
				.map(|uid| UI::from(uid.trim_end_matches('\0')))
				.context("Missing tag AFFECTED_SOP_CLASS_UID (0000,0002)")?;

			let sop_instance_uid = message
				.command
				.get(tags::AFFECTED_SOP_INSTANCE_UID)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
				.map(|uid| UI::from(uid.trim_end_matches('\0')))
				.context("Missing tag AFFECTED_SOP_INSTANCE_UID (0000,1000)")?;

			info!(
				sop_instance_uid = sop_instance_uid.as_str(),
				sop_class_uid = sop_class_uid.as_str(),
				"Received instance"
			);

			if let Some(data_set) = message.data {
				let event = StoreEvent {
					calling_aet: AE::from(association.calling_aet()),
					sop_class_uid: sop_class_uid.clone(),
					sop_instance_uid: sop_instance_uid.clone(),
					transfer_syntax: UI::from(pctx.transfer_syntax.as_str()),
					data_set,
				};
				// The object is handed over before the acknowledgement, so it has been dealt
				// with by the time the peer reports the sub-operation as completed.
				let handler = Arc::clone(&inner.handler);
				if let Err(err) = tokio::task::spawn_blocking(move || handler.on_store(event)).await
				{
					error!("Store handler panicked: {err}");
				}
			} else {
				warn!("C-STORE-RQ without data set");
			}

			let response = CompositeStoreResponse {
				sop_instance_uid,
				sop_class_uid,
				message_id,
			};

			association
				.write_message(
					response,
					message.presentation_context_id,
					inner.options.timeout,
				)
				.await?;
		}
		Ok(())
	}
}

/// Handle to a running [`StoreServiceClassProvider`].
pub struct StoreReceiverHandle {
	task: Option<JoinHandle<()>>,
	local_addr: SocketAddr,
}

impl StoreReceiverHandle {
	/// The address the listener is actually bound to.
	pub const fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Stops accepting connections and aborts the ones in progress.
	/// Returns once the listener is closed. Calling this more than once has no effect.
	pub async fn shutdown(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
			// The listener is owned by the task and only dropped once the task has finished.
			match task.await {
				Err(err) if !err.is_cancelled() => warn!("STORE-SCP accept task failed: {err}"),
				_ => {}
			}
			info!("Stopped Store Service Class Provider on {}", self.local_addr);
		}
	}
}

impl Drop for StoreReceiverHandle {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

#[derive(Debug, Error)]
pub enum ReceiverError {
	#[error("Failed to bind Store Service Class Provider to {address}: {source}")]
	Bind {
		address: SocketAddr,
		source: std::io::Error,
	},
	#[error(transparent)]
	Endpoint(#[from] crate::endpoint::InvalidEndpoint),
}
