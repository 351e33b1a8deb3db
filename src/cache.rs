//! Bounded article cache
//!
//! Holds decoded payloads between the decoder and the assembler. Payloads stay
//! in memory while the byte reservation allows it and are spilled to
//! `<admin_dir>/<job>/<spill key>` otherwise. [`ArticleCache::load`] is
//! destructive: every saved payload comes back exactly once.
//!
//! The reservation counter and the in-memory map share one mutex, which is
//! never held across disk I/O. Spill files are guarded by a per-article lock.

use crate::types::{ArticleId, JobId};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Mean article size assumed when sizing the assembler write trigger
pub const ASSUMED_ARTICLE_SIZE: u64 = 750 * 1024;

/// Upper bound for the assembler write trigger
const MAX_WRITE_TRIGGER: usize = 1000;

/// Where a saved payload ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Saved {
    /// Kept in memory against the reservation
    Memory,
    /// Written to the job's admin directory
    Disk,
    /// Job was deleted; nothing kept
    Dropped,
}

#[derive(Default)]
struct CacheState {
    limit: u64,
    reserved: u64,
    memory: HashMap<ArticleId, Vec<u8>>,
    on_disk: HashSet<ArticleId>,
    deleted: HashSet<JobId>,
}

/// Bounded in-memory store of decoded payloads with disk spill-over
pub struct ArticleCache {
    state: Mutex<CacheState>,
    admin_dir: PathBuf,
    spill_locks: Mutex<HashMap<ArticleId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArticleCache {
    /// Create a cache with a byte `limit` spilling under `admin_dir`
    pub fn new(limit: u64, admin_dir: PathBuf) -> Self {
        Self {
            state: Mutex::new(CacheState {
                limit,
                ..Default::default()
            }),
            admin_dir,
            spill_locks: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spill_lock(&self, id: &ArticleId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.spill_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    fn drop_spill_lock(&self, id: &ArticleId) {
        let mut locks = self.spill_locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lock) = locks.get(id)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(id);
        }
    }

    /// Spill file for an article
    pub fn spill_path(&self, id: &ArticleId) -> PathBuf {
        self.admin_dir.join(id.job.as_str()).join(id.spill_key())
    }

    /// Reserve `nbytes` against the limit; false when it would be exceeded
    pub fn reserve(&self, nbytes: u64) -> bool {
        let mut state = self.state();
        if state.reserved.saturating_add(nbytes) > state.limit {
            return false;
        }
        state.reserved += nbytes;
        true
    }

    /// Return reserved bytes
    pub fn release(&self, nbytes: u64) {
        let mut state = self.state();
        state.reserved = state.reserved.saturating_sub(nbytes);
    }

    /// Store a payload. `force_disk` writes it out regardless of cache room.
    pub async fn save(
        &self,
        id: &ArticleId,
        data: Vec<u8>,
        force_disk: bool,
    ) -> std::io::Result<Saved> {
        let len = data.len() as u64;
        let (data, stale_spill) = {
            let mut state = self.state();
            if state.deleted.contains(&id.job) {
                return Ok(Saved::Dropped);
            }
            if let Some(old) = state.memory.remove(id) {
                state.reserved = state.reserved.saturating_sub(old.len() as u64);
            }
            let stale_spill = state.on_disk.remove(id);
            if !force_disk && state.reserved.saturating_add(len) <= state.limit {
                state.reserved += len;
                state.memory.insert(id.clone(), data);
                (None, stale_spill)
            } else {
                (Some(data), stale_spill)
            }
        };

        match data {
            Some(data) => {
                self.spill(id, &data).await?;
                Ok(Saved::Disk)
            }
            None => {
                if stale_spill {
                    remove_quietly(&self.spill_path(id)).await;
                }
                Ok(Saved::Memory)
            }
        }
    }

    async fn spill(&self, id: &ArticleId, data: &[u8]) -> std::io::Result<()> {
        let path = self.spill_path(id);
        let lock = self.spill_lock(id);
        let result = {
            let _guard = lock.lock().await;
            write_spill(&path, data).await
        };
        drop(lock);
        self.drop_spill_lock(id);
        result?;

        let deleted = {
            let mut state = self.state();
            let deleted = state.deleted.contains(&id.job);
            if !deleted {
                state.on_disk.insert(id.clone());
            }
            deleted
        };
        if deleted {
            remove_quietly(&path).await;
        }
        Ok(())
    }

    /// Take a payload out of the cache: from memory (releasing its reservation)
    /// or from disk (deleting the spill file). `None` when nothing is stored.
    pub async fn load(&self, id: &ArticleId) -> std::io::Result<Option<Vec<u8>>> {
        {
            let mut state = self.state();
            if let Some(data) = state.memory.remove(id) {
                state.reserved = state.reserved.saturating_sub(data.len() as u64);
                return Ok(Some(data));
            }
            if !state.on_disk.remove(id) {
                return Ok(None);
            }
        }

        let path = self.spill_path(id);
        let lock = self.spill_lock(id);
        let result = {
            let _guard = lock.lock().await;
            match tokio::fs::read(&path).await {
                Ok(data) => {
                    remove_quietly(&path).await;
                    Ok(Some(data))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => {
                    // Still on disk; keep it loadable.
                    self.state().on_disk.insert(id.clone());
                    Err(e)
                }
            }
        };
        drop(lock);
        self.drop_spill_lock(id);
        result
    }

    /// Re-register a spill file left by a previous run. False when it is gone.
    pub fn adopt_spilled(&self, id: &ArticleId) -> bool {
        if !self.spill_path(id).is_file() {
            return false;
        }
        self.state().on_disk.insert(id.clone());
        true
    }

    /// Is a payload stored for this article
    pub fn contains(&self, id: &ArticleId) -> bool {
        let state = self.state();
        state.memory.contains_key(id) || state.on_disk.contains(id)
    }

    /// Write every in-memory payload to disk and clear the reservations
    pub async fn flush_all(&self) -> std::io::Result<usize> {
        let entries: Vec<(ArticleId, Vec<u8>)> = {
            let mut state = self.state();
            state.reserved = 0;
            state.memory.drain().collect()
        };
        let count = entries.len();
        for (id, data) in entries {
            self.spill(&id, &data).await?;
        }
        if count > 0 {
            tracing::info!(articles = count, "flushed article cache to disk");
        }
        Ok(count)
    }

    /// Remove every trace of the given articles. Missing files are fine.
    pub async fn purge(&self, ids: &[ArticleId]) {
        for id in ids {
            let on_disk = {
                let mut state = self.state();
                if let Some(data) = state.memory.remove(id) {
                    state.reserved = state.reserved.saturating_sub(data.len() as u64);
                }
                state.on_disk.remove(id)
            };
            if on_disk {
                let lock = self.spill_lock(id);
                {
                    let _guard = lock.lock().await;
                    remove_quietly(&self.spill_path(id)).await;
                }
                drop(lock);
                self.drop_spill_lock(id);
            }
        }
    }

    /// Refuse further saves for `job`
    pub fn mark_deleted(&self, job: &JobId) {
        self.state().deleted.insert(job.clone());
    }

    /// Purge everything stored for a job
    pub async fn purge_job(&self, job: &JobId) {
        let ids: Vec<ArticleId> = {
            let state = self.state();
            state
                .memory
                .keys()
                .chain(state.on_disk.iter())
                .filter(|id| &id.job == job)
                .cloned()
                .collect()
        };
        self.purge(&ids).await;
    }

    /// Bytes held in memory for a job
    pub fn bytes_for_job(&self, job: &JobId) -> u64 {
        let state = self.state();
        state
            .memory
            .iter()
            .filter(|(id, _)| &id.job == job)
            .map(|(_, d)| d.len() as u64)
            .sum()
    }

    /// Payloads (memory or disk) stored for a job
    pub fn entries_for_job(&self, job: &JobId) -> usize {
        let state = self.state();
        state.memory.keys().filter(|id| &id.job == job).count()
            + state.on_disk.iter().filter(|id| &id.job == job).count()
    }

    /// Reserved bytes
    pub fn used(&self) -> u64 {
        self.state().reserved
    }

    /// Byte limit
    pub fn limit(&self) -> u64 {
        self.state().limit
    }

    /// Change the limit, spilling in-memory payloads until usage fits
    pub async fn set_limit(&self, limit: u64) -> std::io::Result<()> {
        let evicted: Vec<(ArticleId, Vec<u8>)> = {
            let mut state = self.state();
            state.limit = limit;
            let mut evicted = Vec::new();
            while state.reserved > state.limit {
                let Some(id) = state.memory.keys().next().cloned() else {
                    break;
                };
                if let Some(data) = state.memory.remove(&id) {
                    state.reserved = state.reserved.saturating_sub(data.len() as u64);
                    evicted.push((id, data));
                }
            }
            evicted
        };
        for (id, data) in evicted {
            self.spill(&id, &data).await?;
        }
        Ok(())
    }

    /// Assembler backlog at which the downloader should hold off
    pub fn write_trigger(&self) -> usize {
        let limit = self.limit();
        ((limit / ASSUMED_ARTICLE_SIZE / 2) as usize).clamp(1, MAX_WRITE_TRIGGER)
    }
}

async fn write_spill(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove spill file");
    }
}
