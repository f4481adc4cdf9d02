//! Wakeup Scheduler
//!
//! Pushes a no-op event in a fixed interval so that the converger's
//! consistency checks run even when the system is quiescent.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::collectors::Event;
use crate::util;

/// Collector task that emits [`Event::Wakeup`] every 30 seconds (10 seconds
/// in test mode).
pub async fn schedule_wakeups(queue: mpsc::Sender<Vec<Event>>) {
    let interval = util::job_interval(Duration::from_secs(30), Duration::from_secs(10));
    loop {
        tokio::time::sleep(interval).await;
        if queue.send(vec![Event::Wakeup]).await.is_err() {
            return;
        }
    }
}
