//! Background expiry sweep for the forecast cache
//!
//! Expired entries are ignored on read but stay in memory until removed. The
//! sweep task drops them periodically so a long-running server does not grow
//! without bound.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::cache::ForecastCache;

/// Configuration for the sweep interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// Time between two sweeps
    pub interval: Duration,
    /// Whether the sweep runs at all
    pub enabled: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300), // 5 minutes
            enabled: true,
        }
    }
}

/// Handle for controlling the background sweep
pub struct SweepHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Spawns the sweep task for `cache`
    ///
    /// A disabled config, or a zero interval, spawns nothing. Dropping the
    /// handle also stops the task.
    pub fn spawn(cache: Arc<ForecastCache>, config: SweepConfig) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = (config.enabled && !config.interval.is_zero()).then(|| {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(config.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // Skip the first tick (immediate)
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let removed = cache.sweep();
                            if removed > 0 {
                                debug!(removed, remaining = cache.len(), "swept expired forecasts");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            break;
                        }
                    }
                }
            })
        });

        Self { shutdown_tx, task }
    }

    /// Whether a sweep task is alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the sweep task and waits for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Some(task) = self.task {
            let _ = task.await;
        }
    }
}
