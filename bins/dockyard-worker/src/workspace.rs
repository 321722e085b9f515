/// Workspace Cache - persistent local mirrors for external tooling
///
/// **Core Responsibility:**
/// Keep one long-lived, change-aware local directory per project so repeated
/// version-control invocations do not re-transfer the whole tree.
///
/// Each workspace carries a metadata file (fingerprint map, sync and access
/// timestamps) stored as a sibling of the workspace directory; the map is the
/// single source of truth for "what the cache currently believes is on disk
/// and matches the cloud". A background sweep bounds the total footprint by
/// evicting idle workspaces.
///
/// Concurrent operations on one project's workspace are not defined; callers
/// serialize per project. The API takes `&mut WorkspaceEntry`, which enforces
/// exclusive access within a single process.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockyard_common::blob::BlobStore;
use dockyard_common::error::SyncError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::staging::{self, RetryPolicy, SyncOutcome};

/// One project's cached workspace: where it lives and what the cache last
/// observed about its contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub owner_id: String,
    pub project_id: String,
    #[serde(skip)]
    pub dir: PathBuf,
    /// relative path -> content fingerprint, for every file believed to
    /// exist both locally and remotely at that fingerprint.
    pub fingerprints: HashMap<String, String>,
    /// Unix seconds of the last sync in either direction; 0 = never synced.
    pub last_sync: i64,
    /// Unix seconds of the last time any caller touched this workspace.
    pub last_access: i64,
}

#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Workspaces idle longer than this are deleted regardless of count.
    pub ttl: Duration,
    /// At most this many workspaces are kept, most recently used first.
    pub max_workspaces: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            max_workspaces: 50,
        }
    }
}

pub struct WorkspaceCache {
    store: Arc<dyn BlobStore>,
    root: PathBuf,
    retry: RetryPolicy,
    eviction: EvictionPolicy,
}

impl WorkspaceCache {
    pub fn new(
        store: Arc<dyn BlobStore>,
        root: PathBuf,
        retry: RetryPolicy,
        eviction: EvictionPolicy,
    ) -> Self {
        Self {
            store,
            root,
            retry,
            eviction,
        }
    }

    fn workspace_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    fn meta_path(&self, project_id: &str) -> PathBuf {
        self.root.join(format!("{}.meta.json", project_id))
    }

    /// Project ids become directory names under the cache root, so they must
    /// be single plain path components.
    fn validate_project_id(project_id: &str) -> Result<(), SyncError> {
        let ok = !project_id.is_empty()
            && project_id != "."
            && project_id != ".."
            && !project_id.contains('/')
            && !project_id.contains('\\');
        if ok {
            Ok(())
        } else {
            Err(SyncError::PathEscape(project_id.to_string()))
        }
    }

    /// Return the project's workspace, creating an empty one (empty
    /// fingerprint map, never synced) on first access. Bumps the access
    /// timestamp. This call performs no network I/O.
    pub async fn get_or_create(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> Result<WorkspaceEntry, SyncError> {
        Self::validate_project_id(project_id)?;
        let dir = self.workspace_dir(project_id);

        if let Some(mut entry) = self.load_meta(project_id).await? {
            entry.dir = dir;
            entry.last_access = Utc::now().timestamp();
            self.save_meta(&entry).await?;
            return Ok(entry);
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SyncError::io(dir.display().to_string(), e))?;
        let entry = WorkspaceEntry {
            owner_id: owner_id.to_string(),
            project_id: project_id.to_string(),
            dir,
            fingerprints: HashMap::new(),
            last_sync: 0,
            last_access: Utc::now().timestamp(),
        };
        self.save_meta(&entry).await?;
        info!(project_id, "created workspace");
        Ok(entry)
    }

    /// Bring the workspace up to date with the cloud (incremental staging).
    /// Short-circuits with no file I/O when the remote fingerprints already
    /// match the cache's map.
    pub async fn sync_from_cloud(
        &self,
        entry: &mut WorkspaceEntry,
    ) -> Result<SyncOutcome, SyncError> {
        let outcome = staging::stage_incremental(
            &self.store,
            &entry.owner_id,
            &entry.project_id,
            &entry.dir,
            &mut entry.fingerprints,
            &self.retry,
        )
        .await?;
        self.finish_sync(entry, &outcome).await?;
        Ok(outcome)
    }

    /// Push every local change back to the cloud (full reverse sync).
    pub async fn sync_to_cloud(&self, entry: &mut WorkspaceEntry) -> Result<SyncOutcome, SyncError> {
        let outcome = staging::sync_to_cloud(
            &self.store,
            &entry.owner_id,
            &entry.project_id,
            &entry.dir,
            &mut entry.fingerprints,
            None,
        )
        .await?;
        self.finish_sync(entry, &outcome).await?;
        Ok(outcome)
    }

    /// Push one subtree back to the cloud. Used after operations known to
    /// touch only the version-control metadata directory, where a full
    /// reverse sync would hash the whole tree for nothing.
    pub async fn sync_subtree_to_cloud(
        &self,
        entry: &mut WorkspaceEntry,
        subtree: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let outcome = staging::sync_to_cloud(
            &self.store,
            &entry.owner_id,
            &entry.project_id,
            &entry.dir,
            &mut entry.fingerprints,
            Some(subtree),
        )
        .await?;
        self.finish_sync(entry, &outcome).await?;
        Ok(outcome)
    }

    /// The fingerprint map must land on disk with the filesystem state it
    /// describes, or a later sync will silently skip files that need work.
    async fn finish_sync(
        &self,
        entry: &mut WorkspaceEntry,
        outcome: &SyncOutcome,
    ) -> Result<(), SyncError> {
        let now = Utc::now().timestamp();
        entry.last_access = now;
        if !outcome.unchanged {
            entry.last_sync = now;
        }
        self.save_meta(entry).await
    }

    /// Synchronously drop a workspace whose local state is no longer
    /// trustworthy (a failed operation, for example).
    pub async fn invalidate(&self, project_id: &str) -> Result<(), SyncError> {
        Self::validate_project_id(project_id)?;
        self.delete_workspace(project_id).await?;
        info!(project_id, "workspace invalidated");
        Ok(())
    }

    /// One eviction pass: load every workspace's metadata, oldest access
    /// first, and delete whatever is TTL-expired or ranked beyond the
    /// most-recently-used cap. Returns the evicted project ids.
    pub async fn run_eviction_sweep(&self) -> Result<Vec<String>, SyncError> {
        let mut known: Vec<(String, i64)> = Vec::new();
        let mut evicted = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::io(self.root.display().to_string(), e)),
        };
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| SyncError::io(self.root.display().to_string(), e))?
        {
            let name = item.file_name().to_string_lossy().into_owned();
            let Some(project_id) = name.strip_suffix(".meta.json") else {
                continue;
            };
            match self.load_meta(project_id).await {
                Ok(Some(entry)) => known.push((entry.project_id, entry.last_access)),
                Ok(None) => {}
                Err(e) => {
                    // Unreadable metadata would otherwise pin the directory
                    // forever: the workspace cannot be trusted, reclaim it.
                    warn!(project_id, error = %e, "corrupt workspace metadata, reclaiming");
                    self.delete_workspace(project_id).await?;
                    evicted.push(project_id.to_string());
                }
            }
        }

        known.sort_by_key(|(_, last_access)| *last_access);
        let now = Utc::now().timestamp();
        let total = known.len();
        let over_cap = total.saturating_sub(self.eviction.max_workspaces);
        for (rank, (project_id, last_access)) in known.into_iter().enumerate() {
            let expired = now - last_access > self.eviction.ttl.as_secs() as i64;
            let beyond_cap = rank < over_cap;
            if expired || beyond_cap {
                self.delete_workspace(&project_id).await?;
                debug!(project_id, expired, beyond_cap, "evicted workspace");
                evicted.push(project_id);
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "eviction sweep removed workspaces");
        }
        Ok(evicted)
    }

    /// Run the eviction sweep on a fixed interval until the task is aborted.
    pub fn spawn_eviction_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh boot does
            // not race workspace creation.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_eviction_sweep().await {
                    warn!(error = %e, "eviction sweep failed");
                }
            }
        })
    }

    async fn delete_workspace(&self, project_id: &str) -> Result<(), SyncError> {
        let dir = self.workspace_dir(project_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::io(dir.display().to_string(), e)),
        }
        let meta = self.meta_path(project_id);
        match tokio::fs::remove_file(&meta).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(meta.display().to_string(), e)),
        }
    }

    async fn load_meta(&self, project_id: &str) -> Result<Option<WorkspaceEntry>, SyncError> {
        let path = self.meta_path(project_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(path.display().to_string(), e)),
        };
        let mut entry: WorkspaceEntry = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::io(
                path.display().to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        entry.dir = self.workspace_dir(project_id);
        Ok(Some(entry))
    }

    async fn save_meta(&self, entry: &WorkspaceEntry) -> Result<(), SyncError> {
        let path = self.meta_path(&entry.project_id);
        let payload = serde_json::to_vec_pretty(entry).expect("workspace metadata serializes");
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| SyncError::io(path.display().to_string(), e))
    }
}
