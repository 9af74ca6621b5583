//! Background task keeping warm templates fresh on a fixed interval

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::registry::Shared;

/// Handle to the single poll task of a registry
#[derive(Debug)]
pub(crate) struct RefresherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    /// Spawn the poll loop.
    ///
    /// The task only holds a weak reference, so a registry dropped without
    /// shutdown still lets it exit on the next tick.
    pub(crate) fn spawn(shared: Weak<Shared>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }

                let Some(shared) = shared.upgrade() else {
                    debug!("Registry dropped, refresher exiting");
                    break;
                };
                shared.refresh_warm().await;
            }
        });

        info!("Started template refresher with interval {:?}", interval);
        Self { stop, task }
    }

    /// Signal the loop to exit and wait until it has.
    pub(crate) async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("Template refresher ended abnormally: {}", e);
        }
        info!("Stopped template refresher");
    }
}
