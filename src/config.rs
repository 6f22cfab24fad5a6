use crate::endpoint::EndpointIdentity;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,

	/// This node. Its title is used as calling AE title and as C-MOVE destination,
	/// its address and port are where the transient STORE-SCP listens.
	pub local: EndpointIdentity,
	/// The archive that is queried and asked to move images.
	pub remote: EndpointIdentity,
	pub dimse: DimseConfig,
}

impl AppConfig {
	/// Loads the configuration from the embedded defaults, an optional configuration file
	/// (`config.toml` unless another path is given) and `RTQA_`-prefixed environment variables.
	pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
		let file = match path {
			Some(path) => config::File::from(path).required(true),
			None => config::File::with_name("config.toml").required(false),
		};

		config::Config::builder()
			.add_source(Self::defaults())
			.add_source(file)
			.add_source(config::Environment::with_prefix("RTQA").separator("_"))
			.build()?
			.try_deserialize()
	}

	fn defaults() -> impl config::Source + Send + Sync + 'static {
		config::File::from_str(include_str!("defaults.toml"), config::FileFormat::Toml)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	// Configurable logging level. Also configurable via env vars RUST_LOG and RTQA_TELEMETRY_LEVEL
	pub level: String,
	/// Sentry DSN. Error tracking is disabled if unset.
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimseConfig {
	/// Timeout in milliseconds for every DIMSE message exchanged with the archive.
	pub timeout: u64,
	/// Only accept native (uncompressed) transfer syntaxes on the STORE-SCP.
	pub uncompressed: bool,
}

impl DimseConfig {
	pub const fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}
}
