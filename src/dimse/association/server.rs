//! Inbound associations opened by the archive while it delivers the objects of a move.

use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::Association as _;
use dicom::ul::pdu::{Pdu, PresentationContextNegotiated};
use std::convert::identity;
use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

/// An association accepted by the store service class provider. Its blocking I/O runs on a
/// dedicated thread. The connection is shut down when the value is dropped.
#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	calling_aet: String,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	tcp_stream: TcpStream,
}

pub struct ServerAssociationOptions {
	/// The AE title this node answers with.
	pub aet: String,
	pub tcp_stream: TcpStream,
	/// Only accept native (uncompressed) transfer syntaxes.
	pub uncompressed: bool,
}

/// Transfer syntaxes offered for every abstract syntax a peer proposes.
fn accepted_transfer_syntaxes(uncompressed: bool) -> impl Iterator<Item = &'static str> {
	let registry: &'static TransferSyntaxRegistry = &TransferSyntaxRegistry;
	registry
		.iter()
		.filter(move |syntax| {
			if uncompressed {
				syntax.is_codec_free()
			} else {
				!syntax.is_unsupported()
			}
		})
		.map(|syntax| syntax.uid())
}

type Handshake = (TcpStream, Vec<PresentationContextNegotiated>, String);

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let association_id = Uuid::new_v4();
		let acceptor = accepted_transfer_syntaxes(options.uncompressed).fold(
			dicom::ul::ServerAssociationOptions::new()
				.ae_title(options.aet.clone())
				.promiscuous(true),
			|acceptor, syntax| acceptor.with_transfer_syntax(syntax),
		);

		let (handshake_tx, handshake) = oneshot::channel::<Result<Handshake, AssociationError>>();
		let (tx, mut commands) = tokio::sync::mpsc::channel::<Command>(1);

		thread::Builder::new()
			.name(format!("{}-scp", options.aet))
			.spawn(move || {
				let span = info_span!("inbound", association_id = %association_id);
				let _entered = span.enter();

				let mut association = match acceptor.establish(options.tcp_stream) {
					Ok(association) => association,
					Err(err) => {
						let _ = handshake_tx.send(Err(err.into()));
						return;
					}
				};
				let calling_aet = association.peer_ae_title().to_owned();
				info!(%calling_aet, "Accepted inbound association");

				let accepted = association
					.inner_stream()
					.try_clone()
					.map(|stream| {
						let contexts = association.presentation_contexts().to_vec();
						(stream, contexts, calling_aet)
					})
					.map_err(AssociationError::Stream);
				let ready = accepted.is_ok();
				if handshake_tx.send(accepted).is_err() || !ready {
					return;
				}

				while let Some(command) = commands.blocking_recv() {
					let delivered = match command {
						Command::Send(pdu, reply_to) => reply_to
							.send(association.send(&pdu).map_err(AssociationError::from))
							.is_ok(),
						Command::Receive(reply_to) => reply_to
							.send(association.receive().map_err(AssociationError::from))
							.is_ok(),
					};
					if !delivered {
						debug!("Nobody is waiting for the result anymore");
						break;
					}
				}
				commands.close();

				// The peer ends a store association; whatever is still open at this point is aborted.
				match association.abort() {
					Ok(()) => {}
					// The peer may have closed the connection already
					Err(dicom::ul::association::Error::WireSend { source, .. })
						if source.kind() == ErrorKind::BrokenPipe => {}
					Err(err) => warn!("Failed to abort inbound association: {err}"),
				}
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, calling_aet) = handshake
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		Ok(Self {
			channel: tx,
			calling_aet,
			presentation_contexts,
			tcp_stream,
		})
	}

	/// The AE title of the peer that opened the association.
	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(Shutdown::Both) {
			debug!("Inbound connection was already closed: {err}");
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}
