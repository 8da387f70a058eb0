//! Caching remote filesystem client (C9): a read-only façade over a
//! [`Session`], with sharded LRU caches, background prefetch, and
//! access-path tracking.

use crate::codec::{Decode, Encode};
use crate::error::{Error, Result};
use crate::remotefs::method_name;
use crate::session::Session;
use crate::wire::*;
use async_channel::{bounded, Sender};
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

const STAT_SHARDS: usize = 16;
const READDIR_SHARDS: usize = 16;
const STATFS_SHARDS: usize = 4;
const SHARD_CAPACITY: usize = 256;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

fn shard_of(path: &str, shards: usize) -> usize {
    (xxh64(path.as_bytes(), 0) as usize) % shards
}

struct ShardedCache<V: Clone> {
    shards: Vec<RwLock<LruCache<String, V>>>,
}

impl<V: Clone> ShardedCache<V> {
    fn new(shards: usize) -> Self {
        ShardedCache {
            shards: (0..shards)
                .map(|_| RwLock::new(LruCache::new(NonZeroUsize::new(SHARD_CAPACITY).unwrap())))
                .collect(),
        }
    }

    fn get(&self, key: &str) -> Option<V> {
        let idx = shard_of(key, self.shards.len());
        self.shards[idx].write().unwrap().get(key).cloned()
    }

    fn put(&self, key: String, value: V) {
        let idx = shard_of(&key, self.shards.len());
        self.shards[idx].write().unwrap().put(key, value);
    }

    fn invalidate(&self, key: &str) {
        let idx = shard_of(key, self.shards.len());
        self.shards[idx].write().unwrap().pop(key);
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessStats {
    pub files: usize,
    pub folders: usize,
    pub total: usize,
}

struct AccessTracker {
    files: RwLock<HashSet<u64>>,
    folders: RwLock<HashSet<u64>>,
}

impl AccessTracker {
    fn new() -> Self {
        AccessTracker {
            files: RwLock::new(HashSet::new()),
            folders: RwLock::new(HashSet::new()),
        }
    }

    fn track_file(&self, path: &str) {
        self.files.write().unwrap().insert(xxh64(path.as_bytes(), 0));
    }

    fn track_folder(&self, path: &str) {
        self.folders
            .write()
            .unwrap()
            .insert(xxh64(path.as_bytes(), 0));
    }

    fn stats(&self) -> AccessStats {
        let files = self.files.read().unwrap().len();
        let folders = self.folders.read().unwrap().len();
        AccessStats {
            files,
            folders,
            total: files + folders,
        }
    }
}

/// Read-only client façade for one job's remote filesystem.
pub struct RemoteFsClient {
    session: Arc<Session>,
    job_id: String,
    stat_cache: ShardedCache<VSSFileInfo>,
    readdir_cache: ShardedCache<Vec<VSSFileInfo>>,
    statfs_cache: ShardedCache<StatFS>,
    access: AccessTracker,
    prefetch_tx: Sender<String>,
    cancel: CancellationToken,
}

impl RemoteFsClient {
    pub fn new(session: Arc<Session>, job_id: impl Into<String>) -> Arc<Self> {
        Self::with_prefetch_workers(session, job_id, 4)
    }

    pub fn with_prefetch_workers(
        session: Arc<Session>,
        job_id: impl Into<String>,
        workers: usize,
    ) -> Arc<Self> {
        let job_id = job_id.into();
        let (tx, rx) = bounded::<String>(100);
        let cancel = CancellationToken::new();

        let client = Arc::new(RemoteFsClient {
            session,
            job_id,
            stat_cache: ShardedCache::new(STAT_SHARDS),
            readdir_cache: ShardedCache::new(READDIR_SHARDS),
            statfs_cache: ShardedCache::new(STATFS_SHARDS),
            access: AccessTracker::new(),
            prefetch_tx: tx,
            cancel,
        });

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let client = client.clone();
            let cancel = client.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        path = rx.recv() => {
                            match path {
                                Ok(path) => client.prefetch_one(&path).await,
                                Err(_) => break,
                            }
                        }
                    }
                }
            });
        }

        client
    }

    fn method(&self, op: &str) -> String {
        method_name(&self.job_id, op)
    }

    fn enqueue_prefetch(&self, path: &str) {
        let _ = self.prefetch_tx.try_send(path.to_string());
    }

    async fn prefetch_one(&self, path: &str) {
        if self.stat_cache.get(path).is_some() {
            return;
        }
        if let Ok(info) = self.raw_stat(path).await {
            let is_dir = info.is_dir;
            self.stat_cache.put(path.to_string(), info);
            if is_dir && self.readdir_cache.get(path).is_none() {
                if let Ok(children) = self.raw_read_dir(path).await {
                    for child in &children {
                        if child.is_dir {
                            let child_path = join_path(path, &child.name);
                            self.enqueue_prefetch(&child_path);
                        }
                    }
                    self.readdir_cache.put(path.to_string(), children);
                }
            }
        }
    }

    async fn raw_stat(&self, path: &str) -> Result<VSSFileInfo> {
        let req = PathReq { path: path.to_string() };
        let raw = self
            .session
            .call(&self.method("Stat"), req.encode_to_vec(), Some(DEFAULT_CALL_TIMEOUT))
            .await?;
        VSSFileInfo::decode_from_slice(&raw)
    }

    async fn raw_read_dir(&self, path: &str) -> Result<Vec<VSSFileInfo>> {
        let req = PathReq { path: path.to_string() };
        let raw = self
            .session
            .call(&self.method("ReadDir"), req.encode_to_vec(), Some(DEFAULT_CALL_TIMEOUT))
            .await?;
        let entries = ReadDirEntries::decode_from_slice(&raw)?;
        Ok(entries
            .entries
            .into_iter()
            .map(|e| VSSFileInfo {
                name: e.name,
                size: 0,
                mode: e.mode,
                mod_time_unix_nanos: 0,
                is_dir: e.mode & 0x8000_0000 != 0,
                blocks: 0,
            })
            .collect())
    }

    pub async fn stat(&self, path: &str) -> Result<VSSFileInfo> {
        if let Some(info) = self.stat_cache.get(path) {
            self.access.track_file(path);
            return Ok(info);
        }
        let info = self.raw_stat(path).await?;
        self.stat_cache.put(path.to_string(), info.clone());
        self.access.track_file(path);
        self.enqueue_prefetch(&parent_of(path));
        Ok(info)
    }

    pub async fn read_dir(&self, path: &str) -> Result<Vec<VSSFileInfo>> {
        if let Some(entries) = self.readdir_cache.get(path) {
            self.access.track_folder(path);
            return Ok(entries);
        }
        let entries = self.raw_read_dir(path).await?;
        for child in &entries {
            let child_path = join_path(path, &child.name);
            self.stat_cache.put(child_path.clone(), child.clone());
            if child.is_dir {
                self.enqueue_prefetch(&child_path);
            }
        }
        self.readdir_cache.put(path.to_string(), entries.clone());
        self.access.track_folder(path);
        Ok(entries)
    }

    pub async fn open(self: &Arc<Self>, path: &str, flag: u32) -> Result<RemoteFile> {
        if flag & crate::remotefs::open_flags::WRITE_MASK != 0 {
            return Err(Error::Invalid("read-only client".into()));
        }
        let req = OpenFileReq {
            path: path.to_string(),
            flag,
            perm: 0,
        };
        let raw = self
            .session
            .call(&self.method("OpenFile"), req.encode_to_vec(), Some(DEFAULT_CALL_TIMEOUT))
            .await?;
        let id = FileHandleId::decode_from_slice(&raw)?;
        Ok(RemoteFile {
            client: self.clone(),
            handle: id.id,
        })
    }

    pub async fn statfs(&self) -> Result<StatFS> {
        const KEY: &str = "statFS";
        if let Some(s) = self.statfs_cache.get(KEY) {
            return Ok(s);
        }
        let raw = self
            .session
            .call(&self.method("StatFS"), Vec::new(), Some(DEFAULT_CALL_TIMEOUT))
            .await?;
        let statfs = StatFS::decode_from_slice(&raw)?;
        self.statfs_cache.put(KEY.to_string(), statfs);
        Ok(statfs)
    }

    pub fn access_stats(&self) -> AccessStats {
        self.access.stats()
    }

    pub fn invalidate(&self, path: &str) {
        self.stat_cache.invalidate(path);
        self.readdir_cache.invalidate(path);
    }

    // Mutating operations are unconditionally rejected; the remote
    // filesystem is read-only by contract.
    pub async fn create(&self, _path: &str) -> Result<()> {
        Err(Error::Invalid("read-only client".into()))
    }
    pub async fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(Error::Invalid("read-only client".into()))
    }
    pub async fn remove(&self, _path: &str) -> Result<()> {
        Err(Error::Invalid("read-only client".into()))
    }
    pub async fn mkdir_all(&self, _path: &str) -> Result<()> {
        Err(Error::Invalid("read-only client".into()))
    }
    pub async fn symlink(&self, _old: &str, _new: &str) -> Result<()> {
        Err(Error::Invalid("read-only client".into()))
    }
    pub async fn chmod(&self, _path: &str, _mode: u32) -> Result<()> {
        Err(Error::Invalid("read-only client".into()))
    }
    pub async fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> Result<()> {
        Err(Error::Invalid("read-only client".into()))
    }
    pub async fn chtimes(&self, _path: &str, _atime: i64, _mtime: i64) -> Result<()> {
        Err(Error::Invalid("read-only client".into()))
    }
    pub async fn temp_file(&self, _dir: &str, _pattern: &str) -> Result<String> {
        Err(Error::Invalid("read-only client".into()))
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn read_at(&self, handle: u64, offset: i64, length: u32) -> Result<Vec<u8>> {
        let req = ReadAtReq { handle, offset, length };
        debug!(handle, offset, length, "remote fs read_at");
        self.session
            .call_binary(&self.method("ReadAt"), req.encode_to_vec(), Some(DEFAULT_CALL_TIMEOUT))
            .await
    }

    async fn lseek(&self, handle: u64, offset: i64, whence: u32) -> Result<i64> {
        let req = LseekReq { handle, offset, whence };
        let raw = self
            .session
            .call(&self.method("Lseek"), req.encode_to_vec(), Some(DEFAULT_CALL_TIMEOUT))
            .await?;
        Ok(LseekResp::decode_from_slice(&raw)?.new_offset)
    }

    async fn close_handle(&self, handle: u64) -> Result<()> {
        let req = CloseReq { handle };
        match self
            .session
            .call(&self.method("Close"), req.encode_to_vec(), Some(DEFAULT_CALL_TIMEOUT))
            .await
        {
            Ok(_) | Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => String::new(),
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// An open remote file. `total_bytes` tracks cumulative bytes read for
/// diagnostics.
pub struct RemoteFile {
    client: Arc<RemoteFsClient>,
    handle: u64,
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile").field("handle", &self.handle).finish()
    }
}

impl RemoteFile {
    pub async fn read_at(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let data = self.client.read_at(self.handle, offset, buf.len() as u32).await?;
        let n = data.len();
        buf[..n].copy_from_slice(&data);
        Ok(n)
    }

    pub async fn lseek(&self, offset: i64, whence: u32) -> Result<i64> {
        self.client.lseek(self.handle, offset, whence).await
    }

    pub async fn close(&self) -> Result<()> {
        self.client.close_handle(self.handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_selection_is_stable() {
        let a = shard_of("/some/path", STAT_SHARDS);
        let b = shard_of("/some/path", STAT_SHARDS);
        assert_eq!(a, b);
    }

    #[test]
    fn parent_of_handles_root() {
        assert_eq!(parent_of("a/b/c"), "a/b");
        assert_eq!(parent_of("a"), "");
        assert_eq!(parent_of(""), "");
    }

    #[test]
    fn sharded_cache_put_get_invalidate() {
        let cache: ShardedCache<i32> = ShardedCache::new(4);
        cache.put("/x".into(), 42);
        assert_eq!(cache.get("/x"), Some(42));
        cache.invalidate("/x");
        assert_eq!(cache.get("/x"), None);
    }
}
