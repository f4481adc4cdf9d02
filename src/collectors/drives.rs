//! Drive Enumerator
//!
//! Periodically expands the configured drive globs and reports drives that
//! appeared or disappeared since the last tick.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::collectors::Event;
use crate::config::Config;
use crate::error::fatal;
use crate::os::{DriveObservation, OsFacade};
use crate::util;

/// Collector task that emits [`Event::DriveAdded`] and
/// [`Event::DriveRemoved`].
pub async fn collect_drive_events(
    os: Arc<dyn OsFacade>,
    config: Arc<Config>,
    queue: mpsc::Sender<Vec<Event>>,
) {
    // tracks drives between ticks, keyed by pre-symlink-resolution path
    let mut known_drives: BTreeMap<String, String> = BTreeMap::new();

    // every 5 seconds in production; in test mode the trigger file is
    // polled once per second instead
    let mut trigger =
        util::standard_trigger(Duration::from_secs(5), util::TEST_TRIGGER_PATH, true);

    while trigger.recv().await.is_some() {
        let observations = match os.scan_drives(&config.drive_globs).await {
            Ok(observations) => observations,
            Err(err) => fatal(&err.to_string()),
        };

        let events = diff_observations(&mut known_drives, &observations);
        if !events.is_empty() && queue.send(events).await.is_err() {
            return;
        }
    }
}

/// Update the known-drive map and derive the events for this tick. Removed
/// drives come first, each group sorted by device path for deterministic
/// behavior in tests.
fn diff_observations(
    known_drives: &mut BTreeMap<String, String>,
    observations: &[DriveObservation],
) -> Vec<Event> {
    let mut events = Vec::new();

    // check if any of the reported drives have been removed
    let mut removed: Vec<String> = known_drives
        .iter()
        .filter(|(found_at, _)| {
            !observations
                .iter()
                .any(|observation| observation.found_at_path == **found_at)
        })
        .map(|(_, device_path)| device_path.clone())
        .collect();
    known_drives.retain(|found_at, _| {
        observations
            .iter()
            .any(|observation| observation.found_at_path == *found_at)
    });
    removed.sort();
    events.extend(
        removed
            .into_iter()
            .map(|device_path| Event::DriveRemoved { device_path }),
    );

    // handle new drives; observations are already sorted by device path
    for observation in observations {
        if known_drives.contains_key(&observation.found_at_path) {
            continue;
        }
        known_drives.insert(
            observation.found_at_path.clone(),
            observation.device_path.clone(),
        );
        events.push(Event::DriveAdded {
            device_path: observation.device_path.clone(),
            found_at_path: observation.found_at_path.clone(),
            serial: observation.serial.clone(),
        });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(device_path: &str) -> DriveObservation {
        DriveObservation {
            device_path: device_path.to_string(),
            found_at_path: device_path.to_string(),
            serial: None,
            media_type: None,
        }
    }

    #[test]
    fn test_first_tick_reports_all_as_added() {
        let mut known = BTreeMap::new();
        let events = diff_observations(
            &mut known,
            &[observation("/dev/sdb"), observation("/dev/sdc")],
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::DriveAdded { device_path, .. } if device_path == "/dev/sdb"));
        assert!(matches!(&events[1], Event::DriveAdded { device_path, .. } if device_path == "/dev/sdc"));
    }

    #[test]
    fn test_unchanged_tick_reports_nothing() {
        let mut known = BTreeMap::new();
        let observations = [observation("/dev/sdb")];
        diff_observations(&mut known, &observations);
        assert!(diff_observations(&mut known, &observations).is_empty());
    }

    #[test]
    fn test_removal_and_addition() {
        let mut known = BTreeMap::new();
        diff_observations(
            &mut known,
            &[observation("/dev/sdb"), observation("/dev/sdc")],
        );

        let events = diff_observations(
            &mut known,
            &[observation("/dev/sdc"), observation("/dev/sdd")],
        );
        assert_eq!(
            events,
            vec![
                Event::DriveRemoved {
                    device_path: "/dev/sdb".into()
                },
                Event::DriveAdded {
                    device_path: "/dev/sdd".into(),
                    found_at_path: "/dev/sdd".into(),
                    serial: None,
                },
            ]
        );
    }

    #[test]
    fn test_symlink_identity_is_tracked_by_found_path() {
        let mut known = BTreeMap::new();
        let by_id = DriveObservation {
            device_path: "/dev/sdb".into(),
            found_at_path: "/dev/disk/by-id/ata-foo".into(),
            serial: Some("SER1".into()),
            media_type: None,
        };
        diff_observations(&mut known, &[by_id.clone()]);

        // the same disk now also matches a direct glob; it counts as a new
        // sighting because identity is per globbed path
        let direct = observation("/dev/sdb");
        let events = diff_observations(&mut known, &[by_id, direct]);
        assert_eq!(events.len(), 1);
    }
}
