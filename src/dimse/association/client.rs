use dicom::ul::pdu::{PDataValueType, PresentationContextNegotiated};
use dicom::ul::Pdu;
use std::convert::identity;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{AskPattern, Association, AssociationError, ChannelError, Command};

/// An outbound association whose blocking I/O runs on a dedicated thread.
///
/// The association is released gracefully once [`ClientAssociation::release`] is called or the
/// value is dropped, whichever happens first. After a failed or timed out request the I/O thread
/// may still be blocked on the peer, so the connection is shut down instead.
pub struct ClientAssociation {
	channel: Option<Sender<Command>>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	failed: AtomicBool,
}

pub struct ClientAssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	/// One presentation context is proposed per abstract syntax.
	pub abstract_syntaxes: Vec<String>,
	pub transfer_syntaxes: Vec<String>,
	pub address: SocketAddr,
}

impl ClientAssociation {
	fn chunked_send(
		association: &mut dicom::ul::ClientAssociation<TcpStream>,
		pdu: &Pdu,
	) -> Result<(), AssociationError> {
		match &pdu {
			Pdu::PData { data } => {
				let is_command = data
					.first()
					.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
				if is_command {
					association.send(pdu).map_err(AssociationError::Association)
				} else {
					let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
					if data_length > association.acceptor_max_pdu_length() as usize {
						for pdv in data {
							debug_assert_eq!(pdv.value_type, PDataValueType::Data);
							let mut writer = association.send_pdata(pdv.presentation_context_id);
							writer
								.write_all(&pdv.data)
								.map_err(AssociationError::ChunkWriter)?;
						}
						Ok(())
					} else {
						association.send(pdu).map_err(AssociationError::Association)
					}
				}
			}
			_ => association.send(pdu).map_err(AssociationError::Association),
		}
	}

	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = options.address;
		let thread_name = format!("{}-client", options.calling_aet);
		let mut association_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet);
		for abstract_syntax in options.abstract_syntaxes {
			association_options = association_options
				.with_presentation_context(abstract_syntax, options.transfer_syntaxes.clone());
		}

		let _handle = thread::Builder::new()
			.name(thread_name)
			.spawn(move || {
				let mut association = match association_options.establish(address) {
					Ok(mut association) => {
						let presentation_contexts = Vec::from(association.presentation_contexts());

						match association.inner_stream().try_clone() {
							Ok(stream) => {
								connect_tx
									.send(Ok((stream, presentation_contexts)))
									.map_err(|_| ())?;
							}
							Err(err) => {
								connect_tx
									.send(Err(AssociationError::Stream(err)))
									.map_err(|_| ())?;
								return Err(());
							}
						}

						association
					}
					Err(e) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = Self::chunked_send(&mut association, &pdu);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result = association
								.receive()
								.map_err(AssociationError::Association);
							reply_to
								.send(receive_result)
								.map_err(|_| ChannelError::Closed)
						}
					};
					if let Some(err) = result.err() {
						error!(
							backend_uuid = uuid.to_string(),
							"Error in ClientAssociation backend: {err}"
						);
						return Err(());
					}
				}

				rx.close();

				// All senders are gone, so nobody is waiting for another response.
				if let Err(err) = association.release() {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to release ClientAssociation: {err}"
					);
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = connect_result
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		info!(
			backend_uuid = uuid.to_string(),
			peer = address.to_string(),
			"Established client association"
		);

		Ok(Self {
			channel: Some(tx),
			uuid,
			tcp_stream,
			presentation_contexts,
			failed: AtomicBool::new(false),
		})
	}

	/// Releases the association. Calling this more than once has no effect.
	pub fn release(&mut self) {
		let Some(channel) = self.channel.take() else {
			return;
		};
		if self.failed.load(Ordering::Acquire) {
			self.close();
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Closed client association after a failed request"
			);
		} else {
			// Dropping the last sender ends the command loop, which then sends A-RELEASE-RQ.
			drop(channel);
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Released client association"
			);
		}
	}

	fn track<T>(&self, result: Result<T, AssociationError>) -> Result<T, AssociationError> {
		if result.is_err() {
			self.failed.store(true, Ordering::Release);
		}
		result
	}

	fn channel(&self) -> Result<&Sender<Command>, AssociationError> {
		self.channel
			.as_ref()
			.ok_or(AssociationError::Channel(ChannelError::Closed))
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.release();
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		let result = self
			.channel()?
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity);
		self.track(result)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		let result = self
			.channel()?
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity);
		self.track(result)
	}

	fn close(&mut self) {
		self.channel = None;
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::dictionary_std::uids;
	use std::net::TcpListener;
	use std::sync::mpsc;

	const PEER_AET: &str = "SILENT";

	/// Accepts one association and never answers. Reports whatever the next read returns.
	fn silent_peer() -> (SocketAddr, mpsc::Receiver<Result<Pdu, dicom::ul::association::Error>>) {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let address = listener.local_addr().unwrap();
		let (tx, rx) = mpsc::channel();
		thread::spawn(move || {
			let (stream, _) = listener.accept().unwrap();
			stream
				.set_read_timeout(Some(Duration::from_secs(10)))
				.unwrap();
			let mut association = dicom::ul::ServerAssociationOptions::new()
				.ae_title(PEER_AET)
				.promiscuous(true)
				.with_abstract_syntax(uids::VERIFICATION)
				.with_transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
				.establish(stream)
				.unwrap();
			let _ = tx.send(association.receive());
		});
		(address, rx)
	}

	async fn connect(address: SocketAddr) -> ClientAssociation {
		ClientAssociation::new(ClientAssociationOptions {
			calling_aet: String::from("QATRACK"),
			called_aet: String::from(PEER_AET),
			abstract_syntaxes: vec![String::from(uids::VERIFICATION)],
			transfer_syntaxes: vec![String::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			address,
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn release_closes_connection_after_timeout() {
		let (address, peer) = silent_peer();
		let mut association = connect(address).await;

		let received = association.receive(Duration::from_millis(200)).await;
		assert!(matches!(
			received,
			Err(AssociationError::Channel(ChannelError::Timeout))
		));

		association.release();
		association.release();

		// Well before the peer's own read timeout
		let next = tokio::task::spawn_blocking(move || peer.recv_timeout(Duration::from_secs(5)))
			.await
			.unwrap()
			.expect("connection left open after release");
		assert!(!matches!(next, Ok(Pdu::PData { .. })));
	}

	#[tokio::test]
	async fn release_is_graceful_without_failures() {
		let (address, peer) = silent_peer();
		let mut association = connect(address).await;
		association.release();

		let next = tokio::task::spawn_blocking(move || peer.recv_timeout(Duration::from_secs(5)))
			.await
			.unwrap()
			.unwrap();
		assert!(matches!(next, Ok(Pdu::ReleaseRQ)));
	}
}
