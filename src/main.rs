use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use rtqa_fetch::config::AppConfig;
use rtqa_fetch::retrieve::{RetrieveFilter, RetrieveSession};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Retrieves the latest RT image series of a treatment plan from a DICOM archive
/// and prints its acquisition timestamp.
#[derive(Debug, Parser)]
#[command(name = "rtqa-fetch", version, about)]
struct Cli {
	/// Patient ID (0010,0020) of the patient the plan belongs to
	#[arg(long)]
	patient_id: String,
	/// RT Plan Label (300A,0002) of the plan
	#[arg(long)]
	plan: String,
	/// Image Type (0008,0008) of the images to retrieve
	#[arg(long, default_value = RetrieveFilter::PORTAL_IMAGE_TYPE)]
	image_type: String,
	/// Only consider series acquired on this day (YYYY-MM-DD)
	#[arg(long)]
	date: Option<NaiveDate>,
	/// Directory the images are written to
	#[arg(long, default_value = ".")]
	output: PathBuf,
	/// Keep kV images instead of discarding them
	#[arg(long)]
	include_kv: bool,
	/// Configuration file. Defaults to config.toml in the working directory, if present.
	#[arg(long)]
	config: Option<PathBuf>,
}

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false)
				.with_writer(std::io::stderr),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
	let cli = Cli::parse();
	let config = AppConfig::load(cli.config.as_deref())?;
	init_logger(config.telemetry.level.parse()?);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let result = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(cli, &config));

	match result {
		Ok(timestamp) => {
			println!("{timestamp}");
			Ok(ExitCode::SUCCESS)
		}
		Err(err) => {
			error!("{err:#}");
			Ok(ExitCode::FAILURE)
		}
	}
}

async fn run(cli: Cli, config: &AppConfig) -> anyhow::Result<String> {
	let filter = RetrieveFilter {
		image_type: cli.image_type,
		ignore_low_energy: !cli.include_kv,
		acquisition_date: cli.date,
	};

	let mut session = RetrieveSession::from_config(config)?;
	info!(
		local = %config.local,
		remote = %config.remote,
		"Fetching latest images of plan '{}' for patient {}",
		cli.plan,
		cli.patient_id
	);

	session
		.fetch_latest(&cli.patient_id, &cli.plan, &filter, &cli.output)
		.await
		.with_context(|| format!("Failed to fetch images of plan '{}'", cli.plan))
}
