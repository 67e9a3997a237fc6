use crate::services::recovery;
use crate::AppState;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// Scheduled recovery loop, spawned from main. Independent of request
/// handling; each tick is one bounded scan pass.
pub async fn run_recovery_loop(state: Arc<AppState>) {
    let interval = Duration::from_secs(state.config.recovery_interval_secs);
    info!("recovery scanner started, interval {:?}", interval);

    loop {
        sleep(interval).await;

        match recovery::run_scan(&state).await {
            Ok(report) => {
                if report.scanned > 0 {
                    info!(
                        scanned = report.scanned,
                        recovered = report.recovered,
                        still_processing = report.still_processing,
                        failed = report.failed,
                        skipped = report.skipped_unrecoverable,
                        errors = report.errors,
                        "recovery scan finished"
                    );
                }
            }
            Err(e) => error!("recovery scan aborted: {e}"),
        }
    }
}
