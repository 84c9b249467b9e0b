use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{Result, WardenError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Acquire an exclusive advisory lock, polling until `timeout` elapses.
/// Returns the locked File handle; the lock is released when it is dropped.
pub fn acquire_lock(path: &Path, timeout: Duration) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(_) => {
                return Err(WardenError::LockTimeout(path.display().to_string()));
            }
        }
    }
}

/// Release a lock explicitly (normally handled by Drop).
pub fn release_lock(file: File) -> Result<()> {
    fs2::FileExt::unlock(&file)?;
    Ok(())
}
