use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backend::{FsArchive, MemoryLedger};
use chaintrack::MetricKind;
use runtime::{Tracker, TrackerConfig, TrackerError};

#[tokio::main]
async fn main() {
	if let Err(error) = run().await {
		eprintln!("tracker failed: {error}");
		std::process::exit(1);
	}
}

async fn run() -> Result<(), TrackerError> {
	let config_path = std::env::args()
		.nth(1)
		.or_else(|| std::env::var("CHAINTRACK_CONFIG").ok())
		.map(PathBuf::from);
	let config = TrackerConfig::resolve(config_path.as_deref())?;
	chaintrack::init_logging(&config.log.level);

	let archive = FsArchive::open(config.archive_dir()).map_err(TrackerError::Archive)?;
	let ledger = MemoryLedger::new(config.ledger.network.clone());
	tracing::info!(
		network = %config.ledger.network,
		contract = config.ledger.contract_address.as_deref().unwrap_or("-"),
		archive = %archive.root().display(),
		"tracker starting"
	);

	let tracker = Tracker::open(config, Arc::new(ledger), Arc::new(archive))?;
	let handle = tracker.start();

	let page_view = tracker.record_metric(MetricKind::PageView, 1)?;
	let interaction = tracker.record_metric(MetricKind::Interaction, 1)?;
	tracing::info!(%page_view, %interaction, "metrics recorded");

	if !tracker.drain(Duration::from_secs(30)).await? {
		tracing::warn!(pending = tracker.pending()?, "queue not drained, remaining events retry on next start");
	}
	let summary = handle.stop().await?;

	print!("{}", tracker.dashboard()?);
	let report = tracker.dead_letter_report()?;
	for (reason, count) in &report.by_reason {
		println!("dead-letter reason={reason} count={count}");
	}
	println!(
		"tracker done dispatched={} confirmed={} retries={}",
		summary.dispatched, summary.confirmed, summary.retries
	);
	Ok(())
}

