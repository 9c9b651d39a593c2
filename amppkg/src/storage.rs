// SPDX-License-Identifier: MIT

//! Mostly-read storage for a single expensive-to-recompute blob.
//!
//! An [`Updateable`] reads current contents, and only when a staleness
//! predicate says so does it upgrade to an exclusive section, re-check, and
//! run the (expensive, typically network-bound) update callback before
//! persisting the result. The update is assumed to be costly enough that it
//! should run at most once per staleness window across every reader, and --
//! for the disk-backed implementation -- across every co-located process
//! sharing the file.
//!
//! Update callbacks are infallible by contract: on any internal failure they
//! must return the original contents unchanged, so a failed refresh never
//! destroys a previously cached valid value.

use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::PathBuf;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::RwLock;

use crate::error::StorageError;

/// The staleness predicate. Must be cheap; it runs on every read.
pub type IsExpired = dyn Fn(&[u8]) -> bool + Send + Sync;

/// Recomputes the cached value from its previous contents.
///
/// Implementations must return the original bytes rather than fail; staleness
/// is recoverable, corruption is not.
#[async_trait]
pub trait UpdateFn: Send + Sync {
    async fn update(&self, orig: Vec<u8>) -> Vec<u8>;
}

#[async_trait]
pub trait Updateable: Send + Sync {
    /// Read the current contents, refreshing them first if `is_expired` says
    /// they are stale.
    async fn read(
        &self,
        is_expired: &IsExpired,
        update: &dyn UpdateFn,
    ) -> Result<Vec<u8>, StorageError>;
}

/// An in-process tier. No persistence; a read/write lock provides the
/// double-checked staleness discipline.
#[derive(Debug, Default)]
pub struct InMemory {
    contents: RwLock<Vec<u8>>,
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Updateable for InMemory {
    async fn read(
        &self,
        is_expired: &IsExpired,
        update: &dyn UpdateFn,
    ) -> Result<Vec<u8>, StorageError> {
        {
            let contents = self.contents.read().await;
            if !is_expired(&contents) {
                return Ok(contents.clone());
            }
        }
        let mut contents = self.contents.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if is_expired(&contents) {
            *contents = update.update(contents.clone()).await;
        }
        Ok(contents.clone())
    }
}

/// A tier backed by a single local file, coordinated between processes with
/// OS advisory locks: shared for the fast path, exclusive for the update
/// path. Locks are acquired with try-lock semantics so contention fails fast
/// instead of queueing.
///
/// This is good enough for a few replicas on one machine. Deployments that
/// need wider coordination should provide their own [`Updateable`] on top of
/// a remote store.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<std::fs::File, StorageError> {
        // A missing file is first-ever initialization and reads as empty;
        // a missing parent directory is an operator error and propagates.
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| StorageError::Open {
                path: self.path.clone(),
                source,
            })
    }

    fn read_all(&self, file: &mut std::fs::File) -> Result<Vec<u8>, StorageError> {
        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut contents))
            .map_err(|source| StorageError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(contents)
    }
}

#[async_trait]
impl Updateable for LocalFile {
    async fn read(
        &self,
        is_expired: &IsExpired,
        update: &dyn UpdateFn,
    ) -> Result<Vec<u8>, StorageError> {
        let mut file = self.open()?;
        // Qualified calls: std::fs::File grew same-named inherent locking
        // methods with a different error type, and those take priority.
        FileExt::try_lock_shared(&file).map_err(|source| StorageError::Lock {
            kind: "shared",
            path: self.path.clone(),
            source,
        })?;
        let result = self.locked_read(&mut file, is_expired, update).await;
        if let Err(error) = FileExt::unlock(&file) {
            tracing::warn!(path = %self.path.display(), %error, "failed to unlock cache file");
        }
        result
    }
}

impl LocalFile {
    async fn locked_read(
        &self,
        file: &mut std::fs::File,
        is_expired: &IsExpired,
        update: &dyn UpdateFn,
    ) -> Result<Vec<u8>, StorageError> {
        let contents = self.read_all(file)?;
        if !is_expired(&contents) {
            return Ok(contents);
        }
        // Upgrade to an exclusive lock. Whether the upgrade is atomic is
        // system-dependent, so re-read and re-check once we hold it.
        FileExt::try_lock_exclusive(file)
            .map_err(|source| StorageError::Lock {
                kind: "exclusive",
                path: self.path.clone(),
                source,
            })?;
        let mut contents = self.read_all(file)?;
        if is_expired(&contents) {
            contents = update.update(contents).await;
            file.set_len(0)
                .and_then(|_| file.seek(SeekFrom::Start(0)).map(|_| ()))
                .and_then(|_| file.write_all(&contents))
                .map_err(|source| StorageError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        }
        Ok(contents)
    }
}

/// Composes two tiers so that `first` (fast, e.g. memory) is consulted
/// before `second` (slow, e.g. disk), and the real update callback only runs
/// when both are stale. A freshly started process therefore picks up another
/// process's persisted update without its own network call.
///
/// No atomicity is assumed across the tiers; each one owns its own lock
/// discipline and the composition is purely sequential delegation.
#[derive(Debug)]
pub struct Chained<A, B> {
    first: A,
    second: B,
}

impl<A: Updateable, B: Updateable> Chained<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

/// The update callback handed to the fast tier: a read of the slow tier.
struct SecondTier<'a> {
    second: &'a dyn Updateable,
    is_expired: &'a IsExpired,
    update: &'a dyn UpdateFn,
}

#[async_trait]
impl UpdateFn for SecondTier<'_> {
    async fn update(&self, orig: Vec<u8>) -> Vec<u8> {
        match self.second.read(self.is_expired, self.update).await {
            Ok(contents) => contents,
            Err(error) => {
                // Keep serving the previously cached value; a slow-tier I/O
                // failure must not destroy it.
                tracing::warn!(%error, "slow storage tier read failed; keeping cached contents");
                orig
            }
        }
    }
}

#[async_trait]
impl<A: Updateable, B: Updateable> Updateable for Chained<A, B> {
    async fn read(
        &self,
        is_expired: &IsExpired,
        update: &dyn UpdateFn,
    ) -> Result<Vec<u8>, StorageError> {
        let second = SecondTier {
            second: &self.second,
            is_expired,
            update,
        };
        self.first.read(is_expired, &second).await
    }
}
