use crate::CRATE_NAME;
use fs4::tokio::AsyncFileExt;
use std::path::Path;
use tokio::fs::File;
use tracing::{error, info};

pub const LOCK_FILE: &str = "acme.lock";

/// Opens `<storage>/acme.lock` and waits until this process holds it exclusively.
///
/// The storage directory is created here because the lock is the first thing an operation touches, before any
/// key exists. A fresh installation has no directory yet.
async fn storage_lock(storage: &Path) -> std::io::Result<File> {
    tokio::fs::create_dir_all(storage).await?;
    let lock_file = File::create(storage.join(LOCK_FILE)).await?;
    if lock_file.try_lock_exclusive()? {
        Ok(lock_file)
    } else {
        info!("Another {CRATE_NAME} instance is currently working on {}. Waiting for it to finish...", storage.display());
        tokio::task::spawn_blocking(move || {
            lock_file.lock_exclusive()?;
            Ok(lock_file)
        })
        .await?
    }
}

/// Exclusive advisory lock on the storage directory, shared with other processes.
#[must_use]
#[clippy::has_significant_drop]
pub struct RenewalLock {
    lock_file: File,
}

impl RenewalLock {
    pub async fn exclusive_lock(storage: &Path) -> std::io::Result<Self> {
        let lock_file = storage_lock(storage).await?;
        Ok(Self { lock_file })
    }
}

impl Drop for RenewalLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_file.unlock() {
            error!("Failed to release storage lock: {e}");
        }
    }
}
