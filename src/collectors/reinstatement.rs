//! Reinstatement Watcher
//!
//! Watches the transient broken-flag directory and reports drives whose
//! flag was deleted by an operator, which is the signal to take the drive
//! back into service.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::collectors::Event;
use crate::os::OsFacade;
use crate::util;

/// Collector task that emits [`Event::DriveReinstated`].
pub async fn collect_reinstatements(os: Arc<dyn OsFacade>, queue: mpsc::Sender<Vec<Event>>) {
    // tracks broken devices between ticks; an event fires when a device
    // leaves this set
    let mut broken_devices: BTreeSet<String> = BTreeSet::new();

    let interval = util::job_interval(Duration::from_secs(5), Duration::from_secs(1));
    loop {
        tokio::time::sleep(interval).await;

        let flags = match os.list_broken_flags().await {
            Ok(flags) => flags,
            Err(err) => {
                // transient read error, retry on the next tick
                debug!("cannot read broken flags: {err}");
                continue;
            }
        };
        let current: BTreeSet<String> = flags.into_values().collect();

        let events: Vec<Event> = broken_devices
            .difference(&current)
            .map(|device_path| Event::DriveReinstated {
                device_path: device_path.clone(),
            })
            .collect();
        broken_devices = current;

        if !events.is_empty() && queue.send(events).await.is_err() {
            return;
        }
    }
}
