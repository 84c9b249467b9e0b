//! Background housekeeping for overdue leases.
//!
//! Expiry is lazy everywhere else; the sweeper only marks overdue leases
//! released and writes the audit trail. A failure in one project's store is
//! logged and the cycle moves on to the next project.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::manager::LeaseManager;

pub struct Sweeper;

pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Run one sweep over every project that has ever held a lease.
    /// Returns the total number of leases expired. Individual project
    /// failures are logged and skipped; the cycle always completes.
    pub fn sweep_once(manager: &LeaseManager) -> Result<usize> {
        let projects = manager.db().projects_with_leases()?;
        let mut total = 0;
        for project in projects {
            match manager.expire_stale(&project.slug) {
                Ok(expired) => {
                    if expired > 0 {
                        debug!(project = %project.slug, expired, "sweep expired leases");
                    }
                    total += expired;
                }
                Err(err) => {
                    warn!(project = %project.slug, error = %err, "sweep failed for project, continuing");
                }
            }
        }
        Ok(total)
    }

    /// Spawn the sweeper thread. Each cycle opens its own database handle so
    /// a poisoned cycle never takes the host down with it.
    pub fn spawn(settings: Settings, interval: Duration) -> SweeperHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match LeaseManager::new(settings.clone()) {
                    Ok(manager) => {
                        if let Err(err) = Self::sweep_once(&manager) {
                            warn!(error = %err, "sweep cycle failed");
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "sweeper could not open store");
                    }
                }
                // Sleep in short slices so stop() is honored promptly
                let mut remaining = interval;
                while !stop_flag.load(Ordering::Relaxed) && remaining > Duration::ZERO {
                    let slice = remaining.min(Duration::from_millis(200));
                    thread::sleep(slice);
                    remaining = remaining.saturating_sub(slice);
                }
            }
        });
        SweeperHandle {
            stop,
            handle: Some(handle),
        }
    }
}

impl SweeperHandle {
    /// Signal the thread to stop and wait for the current cycle to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn overdue_everything(manager: &LeaseManager) {
        manager
            .db()
            .conn()
            .execute(
                "UPDATE leases SET expires_ts = '2000-01-01T00:00:00.000000Z'",
                [],
            )
            .unwrap();
    }

    #[test]
    fn sweep_once_marks_overdue_leases() {
        let dir = TempDir::new().unwrap();
        let manager = LeaseManager::new(Settings::with_root(dir.path())).unwrap();
        manager
            .register_agent("alpha", Some("A"), "", "", "")
            .unwrap();
        manager
            .request("alpha", "A", &["src/*".into()], 3600, true, "")
            .unwrap();
        overdue_everything(&manager);

        assert_eq!(Sweeper::sweep_once(&manager).unwrap(), 1);
        assert!(manager.list_active("alpha").unwrap().is_empty());
        // Second sweep finds nothing
        assert_eq!(Sweeper::sweep_once(&manager).unwrap(), 0);
    }

    #[test]
    fn sweep_skips_projects_without_leases() {
        let dir = TempDir::new().unwrap();
        let manager = LeaseManager::new(Settings::with_root(dir.path())).unwrap();
        manager
            .register_agent("quiet", Some("A"), "", "", "")
            .unwrap();
        assert_eq!(Sweeper::sweep_once(&manager).unwrap(), 0);
    }

    #[test]
    fn spawned_sweeper_stops_cleanly() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::with_root(dir.path());
        let handle = Sweeper::spawn(settings, Duration::from_millis(50));
        thread::sleep(Duration::from_millis(120));
        handle.stop();
    }
}
