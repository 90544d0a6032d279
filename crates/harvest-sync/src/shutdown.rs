use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Exit status used when a second interrupt abandons the run.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Cooperative stop request shared between the signal listener and the
/// orchestrator, which checks it once per record.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// First ctrl-c sets the flag; the run finishes its current record, saves
/// and stops. A second ctrl-c exits at once without saving, which can lose
/// everything since the last checkpoint.
pub fn install_signal_handler(flag: ShutdownFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "could not listen for interrupts");
            return;
        }
        warn!(
            "interrupt received, finishing the current record then saving; \
             interrupt again to exit immediately without saving"
        );
        flag.request();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("second interrupt, exiting without saving");
            std::process::exit(FORCED_EXIT_CODE);
        }
    })
}
