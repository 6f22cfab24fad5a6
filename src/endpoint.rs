use crate::types::AE;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;

/// The (title, address, port) triple identifying a DICOM application entity on the network.
///
/// Titles longer than [`EndpointIdentity::MAX_TITLE_LENGTH`] are truncated instead of rejected,
/// because the upper layer protocol caps them at that length anyway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "EndpointConfig")]
pub struct EndpointIdentity {
	title: AE,
	address: String,
	port: u16,
}

/// Raw endpoint section as it appears in the configuration.
#[derive(Debug, Deserialize)]
struct EndpointConfig {
	aet: String,
	address: String,
	port: i64,
}

impl TryFrom<EndpointConfig> for EndpointIdentity {
	type Error = InvalidEndpoint;

	fn try_from(config: EndpointConfig) -> Result<Self, Self::Error> {
		Self::new(&config.aet, &config.address, config.port)
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidEndpoint {
	#[error("IP address '{0}' is not formatted as four dot-separated parts")]
	Address(String),
	#[error("Port number {0} is out of range")]
	Port(i64),
	#[error("IP address '{0}' cannot be used as a socket address")]
	Unresolvable(String),
}

impl EndpointIdentity {
	pub const MAX_TITLE_LENGTH: usize = 16;

	pub fn new(title: &str, address: &str, port: i64) -> Result<Self, InvalidEndpoint> {
		let title: AE = title.trim().chars().take(Self::MAX_TITLE_LENGTH).collect();

		let parts: Vec<&str> = address.split('.').collect();
		if parts.len() != 4 || parts.iter().any(|part| part.is_empty()) {
			return Err(InvalidEndpoint::Address(address.to_owned()));
		}

		let port = u16::try_from(port).map_err(|_| InvalidEndpoint::Port(port))?;

		Ok(Self {
			title,
			address: address.to_owned(),
			port,
		})
	}

	pub fn title(&self) -> &str {
		&self.title
	}

	pub fn address(&self) -> &str {
		&self.address
	}

	pub const fn port(&self) -> u16 {
		self.port
	}

	/// The address is only validated syntactically on construction, so this may still fail.
	pub fn socket_addr(&self) -> Result<SocketAddr, InvalidEndpoint> {
		let ip: Ipv4Addr = self
			.address
			.parse()
			.map_err(|_| InvalidEndpoint::Unresolvable(self.address.clone()))?;
		Ok(SocketAddr::from((ip, self.port)))
	}
}

impl Display for EndpointIdentity {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} - {}:{}", self.title, self.address, self.port)
	}
}
