use std::sync::Arc;

use signal_hook::consts::SIGHUP;
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::overrides::OverrideStore;

/// Spawn a thread that handles SIGHUP by flushing the override store's
/// read-through cache, so edits made directly to the database take effect.
pub fn spawn_sighup_handler(overrides: Arc<OverrideStore>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("sighup".to_string())
        .spawn(move || {
            let mut signals = match Signals::new([SIGHUP]) {
                Ok(signals) => signals,
                Err(err) => {
                    error!(%err, "failed to register SIGHUP handler");
                    return;
                }
            };

            for sig in signals.forever() {
                if sig == SIGHUP {
                    overrides.flush_cache();
                    info!("received SIGHUP, flushed option override cache");
                }
            }
        })
        .expect("Failed to spawn SIGHUP handler thread")
}
