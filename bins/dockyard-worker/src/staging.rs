/// Staging Service - remote tree to local directory, and back
///
/// **Core Responsibility:**
/// Move a project's file tree between the blob store and a local directory.
///
/// **Two staging policies:**
/// - Full: copy everything. Used by the execution orchestrator for ephemeral,
///   single-use staging directories.
/// - Incremental: copy only changed/added files, delete locally-removed ones,
///   driven by a fingerprint map. Used by the persistent workspace cache.
///
/// Reverse sync pushes local changes back, either the whole tree or one named
/// subtree (version-control metadata after a commit touches nothing else).
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dockyard_common::blob::{validate_relative_path, BlobStore};
use dockyard_common::error::SyncError;
use dockyard_common::hash;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

/// How many blob downloads a staging pass keeps in flight at once.
const DOWNLOAD_CONCURRENCY: usize = 10;

/// Bounded exponential backoff for local writes that hit a file an external
/// tool still holds open. Injectable so tests can shrink the delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// What one sync pass actually moved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub transferred: usize,
    pub deleted: usize,
    /// True when the remote listing matched the fingerprint map exactly and
    /// no file I/O happened.
    pub unchanged: bool,
}

/// Copy every file of a project into `target_dir` (full staging policy).
///
/// A single file's download failure is logged and skipped - except the file
/// the caller is about to execute. If `entry_path` never shows up in the
/// recursive listing (eventual-consistency edge), one direct point download
/// is attempted before giving up; its failure is a hard error because the
/// command cannot run without its entry point.
///
/// Returns the number of files staged.
pub async fn stage_full(
    store: &Arc<dyn BlobStore>,
    owner_id: &str,
    project_id: &str,
    target_dir: &Path,
    entry_path: &str,
) -> Result<usize, SyncError> {
    let listing = store
        .list(owner_id, project_id, "")
        .await
        .map_err(SyncError::store)?;

    let files: Vec<_> = listing.into_iter().filter(|e| !e.is_directory).collect();
    debug!(
        project_id,
        files = files.len(),
        "staging full project tree"
    );

    // Collected eagerly: a lazy `iter().map(..)` here trips rustc's
    // auto-trait leak check (#102211) and the caller's future stops being
    // `Send`. The async blocks themselves stay lazy.
    let downloads: Vec<_> = files
        .iter()
        .map(|entry| {
            let store = Arc::clone(store);
            let path = entry.path.clone();
            async move {
                let staged = download_to(&*store, owner_id, project_id, &path, target_dir).await;
                (path, staged)
            }
        })
        .collect();
    let results = stream::iter(downloads)
    .buffer_unordered(DOWNLOAD_CONCURRENCY)
    .collect::<Vec<_>>()
    .await;

    let mut staged = 0usize;
    let mut entry_staged = false;
    for (path, result) in results {
        match result {
            Ok(()) => {
                staged += 1;
                if path == entry_path {
                    entry_staged = true;
                }
            }
            Err(e) => {
                // Not fatal for the tree as a whole.
                warn!(path = %path, error = %e, "skipping file that failed to stage");
            }
        }
    }

    if !entry_staged {
        // Listing missed the entry point (or its download failed); try one
        // direct point download before declaring the stage unusable.
        debug!(entry_path, "entry file absent from staged tree, point download fallback");
        download_to(&**store, owner_id, project_id, entry_path, target_dir)
            .await
            .map_err(|_| SyncError::MissingTarget(entry_path.to_string()))?;
        staged += 1;
    }

    Ok(staged)
}

async fn download_to(
    store: &dyn BlobStore,
    owner_id: &str,
    project_id: &str,
    path: &str,
    target_dir: &Path,
) -> Result<(), SyncError> {
    validate_relative_path(path).map_err(|_| SyncError::PathEscape(path.to_string()))?;
    let bytes = store
        .download(owner_id, project_id, path)
        .await
        .map_err(SyncError::store)?;
    let local = target_dir.join(path);
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent.display().to_string(), e))?;
    }
    tokio::fs::write(&local, &bytes)
        .await
        .map_err(|e| SyncError::io(local.display().to_string(), e))
}

/// Bring `local_dir` up to date with the remote tree (incremental policy).
///
/// `fingerprints` is the map of what the caller last observed on disk; files
/// whose remote fingerprint matches it are skipped entirely, files missing
/// from the remote listing are deleted locally, and the map is replaced with
/// the newly observed remote state afterwards.
pub async fn stage_incremental(
    store: &Arc<dyn BlobStore>,
    owner_id: &str,
    project_id: &str,
    local_dir: &Path,
    fingerprints: &mut HashMap<String, String>,
    retry: &RetryPolicy,
) -> Result<SyncOutcome, SyncError> {
    let listing = store
        .list(owner_id, project_id, "")
        .await
        .map_err(SyncError::store)?;

    let remote: HashMap<String, String> = listing
        .into_iter()
        .filter(|e| !e.is_directory)
        .map(|e| (e.path, e.fingerprint))
        .collect();

    // A full listing is still the cheapest "has anything changed" probe the
    // store offers; identical fingerprint sets mean no file I/O at all.
    if remote == *fingerprints {
        debug!(project_id, "workspace already in sync");
        return Ok(SyncOutcome {
            unchanged: true,
            ..SyncOutcome::default()
        });
    }

    let mut outcome = SyncOutcome::default();

    for (path, remote_fp) in &remote {
        if fingerprints.get(path) == Some(remote_fp) {
            continue;
        }
        validate_relative_path(path).map_err(|_| SyncError::PathEscape(path.clone()))?;
        let bytes = store
            .download(owner_id, project_id, path)
            .await
            .map_err(SyncError::store)?;
        write_with_retry(local_dir, path, &bytes, remote_fp, retry).await?;
        outcome.transferred += 1;
    }

    // Present in the old map but gone remotely: removed on another client,
    // so remove locally. Missing-remote-but-cached-local is never an error.
    for path in fingerprints.keys() {
        if remote.contains_key(path) {
            continue;
        }
        let local = local_dir.join(path);
        match tokio::fs::remove_file(&local).await {
            Ok(()) => outcome.deleted += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::io(local.display().to_string(), e)),
        }
    }

    *fingerprints = remote;
    Ok(outcome)
}

/// Write a downloaded file, retrying around locks held by a concurrent
/// external-tool process. After the final attempt the existing local content
/// is accepted only if it already matches the expected remote fingerprint.
async fn write_with_retry(
    local_dir: &Path,
    path: &str,
    bytes: &[u8],
    expected_fp: &str,
    retry: &RetryPolicy,
) -> Result<(), SyncError> {
    let local = local_dir.join(path);
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent.display().to_string(), e))?;
    }

    let mut delay = retry.base_delay;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match tokio::fs::write(&local, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) if is_lock_error(&e) && attempt < retry.max_attempts => {
                warn!(path, attempt, error = %e, "file locked, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) if is_lock_error(&e) => {
                if let Ok(existing) = tokio::fs::read(&local).await {
                    if hash::fingerprint(&existing) == expected_fp {
                        debug!(path, "locked file already holds the expected content");
                        return Ok(());
                    }
                }
                return Err(SyncError::LockedFileRetryExhausted {
                    path: path.to_string(),
                    attempts: attempt,
                });
            }
            Err(e) => return Err(SyncError::io(local.display().to_string(), e)),
        }
    }
}

/// Lock-shaped write failures worth retrying: another process holding the
/// file open (Windows sharing violations surface as PermissionDenied or raw
/// os errors 32/33, Unix advisory locks as WouldBlock).
fn is_lock_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::WouldBlock
    ) || matches!(e.raw_os_error(), Some(32) | Some(33))
}

/// Push local changes back to the blob store.
///
/// Full mode (`scope = None`) walks every local file, uploads anything whose
/// hash differs from the cached fingerprint, and deletes remotely whatever
/// the old map still lists but the disk no longer has. Scoped mode restricts
/// both halves to one subtree: this deliberately includes the delete half,
/// so a metadata file the external tool pruned inside the scope does not
/// resurrect on the next incremental sync. Nothing outside the subtree is
/// ever uploaded, deleted or even hashed.
pub async fn sync_to_cloud(
    store: &Arc<dyn BlobStore>,
    owner_id: &str,
    project_id: &str,
    local_dir: &Path,
    fingerprints: &mut HashMap<String, String>,
    scope: Option<&str>,
) -> Result<SyncOutcome, SyncError> {
    let scope_prefix = scope.map(|s| {
        let trimmed = s.trim_matches('/');
        format!("{}/", trimmed)
    });
    let in_scope = |rel: &str| match &scope_prefix {
        Some(prefix) => rel.starts_with(prefix.as_str()),
        None => true,
    };

    let local_files = walk_local_files(local_dir).await?;

    let mut outcome = SyncOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();

    for (rel, full_path) in &local_files {
        if !in_scope(rel) {
            continue;
        }
        let bytes = tokio::fs::read(full_path)
            .await
            .map_err(|e| SyncError::io(full_path.display().to_string(), e))?;
        let fp = hash::fingerprint(&bytes);
        seen.insert(rel.clone());
        if fingerprints.get(rel) != Some(&fp) {
            store
                .upload(owner_id, project_id, rel, &bytes)
                .await
                .map_err(SyncError::store)?;
            outcome.transferred += 1;
        }
        fingerprints.insert(rel.clone(), fp);
    }

    let stale: Vec<String> = fingerprints
        .keys()
        .filter(|k| in_scope(k) && !seen.contains(*k))
        .cloned()
        .collect();
    for path in stale {
        store
            .delete(owner_id, project_id, &path)
            .await
            .map_err(SyncError::store)?;
        fingerprints.remove(&path);
        outcome.deleted += 1;
    }

    outcome.unchanged = outcome.transferred == 0 && outcome.deleted == 0;
    Ok(outcome)
}

/// Collect every regular file under `base`, as (relative slash path, full path).
async fn walk_local_files(base: &Path) -> Result<Vec<(String, PathBuf)>, SyncError> {
    let base = base.to_path_buf();
    let display = base.display().to_string();
    tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        walk_into(&base, &base, &mut out)?;
        Ok(out)
    })
    .await
    .map_err(|e| {
        SyncError::io(
            display,
            std::io::Error::new(std::io::ErrorKind::Other, e),
        )
    })?
}

fn walk_into(
    base: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), SyncError> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| SyncError::io(dir.display().to_string(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SyncError::io(dir.display().to_string(), e))?;
        let path = entry.path();
        let meta = entry
            .metadata()
            .map_err(|e| SyncError::io(path.display().to_string(), e))?;
        if meta.is_dir() {
            walk_into(base, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(base)
                .expect("walked path is under its base")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((rel, path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_common::blob::MemoryBlobStore;

    fn memory_store() -> Arc<dyn BlobStore> {
        Arc::new(MemoryBlobStore::new())
    }

    async fn seed(store: &Arc<dyn BlobStore>, files: &[(&str, &[u8])]) {
        for (path, bytes) in files {
            store.upload("u1", "p1", path, bytes).await.unwrap();
        }
    }

    fn read(dir: &Path, rel: &str) -> Vec<u8> {
        std::fs::read(dir.join(rel)).unwrap()
    }

    #[tokio::test]
    async fn full_stage_copies_whole_tree() {
        let store = memory_store();
        seed(
            &store,
            &[
                ("main.py", b"print('hi')"),
                ("lib/util.py", b"x = 1"),
                ("data/input.txt", b"42"),
            ],
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let staged = stage_full(&store, "u1", "p1", dir.path(), "main.py")
            .await
            .unwrap();

        assert_eq!(staged, 3);
        assert_eq!(read(dir.path(), "main.py"), b"print('hi')");
        assert_eq!(read(dir.path(), "lib/util.py"), b"x = 1");
    }

    #[tokio::test]
    async fn full_stage_is_idempotent_across_directories() {
        let store = memory_store();
        seed(&store, &[("main.py", b"a"), ("b/nested.txt", b"b")]).await;

        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        stage_full(&store, "u1", "p1", dir1.path(), "main.py").await.unwrap();
        stage_full(&store, "u1", "p1", dir2.path(), "main.py").await.unwrap();

        for rel in ["main.py", "b/nested.txt"] {
            assert_eq!(read(dir1.path(), rel), read(dir2.path(), rel));
        }
    }

    #[tokio::test]
    async fn full_stage_fails_hard_when_entry_file_is_missing() {
        let store = memory_store();
        seed(&store, &[("other.py", b"x")]).await;

        let dir = tempfile::tempdir().unwrap();
        let err = stage_full(&store, "u1", "p1", dir.path(), "main.py")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingTarget(p) if p == "main.py"));
    }

    #[tokio::test]
    async fn full_stage_of_empty_project_still_point_downloads_entry() {
        let store = memory_store();
        // Nothing listed at all; the point download has nothing to fetch.
        let dir = tempfile::tempdir().unwrap();
        let err = stage_full(&store, "u1", "p1", dir.path(), "main.py")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingTarget(_)));
    }

    #[tokio::test]
    async fn incremental_downloads_only_changed_files() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        seed(&store, &[("a.txt", b"alpha")]).await;

        let dir = tempfile::tempdir().unwrap();
        let mut fingerprints = HashMap::new();
        let retry = RetryPolicy::default();

        let first = stage_incremental(&store, "u1", "p1", dir.path(), &mut fingerprints, &retry)
            .await
            .unwrap();
        assert_eq!(first.transferred, 1);

        let a_mtime = std::fs::metadata(dir.path().join("a.txt"))
            .unwrap()
            .modified()
            .unwrap();

        // Add b.txt remotely; a.txt is untouched.
        seed(&store, &[("b.txt", b"beta")]).await;
        let second = stage_incremental(&store, "u1", "p1", dir.path(), &mut fingerprints, &retry)
            .await
            .unwrap();

        assert_eq!(second.transferred, 1);
        assert_eq!(read(dir.path(), "b.txt"), b"beta");
        let a_mtime_after = std::fs::metadata(dir.path().join("a.txt"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(a_mtime, a_mtime_after, "unchanged file must not be rewritten");
    }

    #[tokio::test]
    async fn incremental_short_circuits_when_nothing_changed() {
        let store = memory_store();
        seed(&store, &[("a.txt", b"alpha")]).await;

        let dir = tempfile::tempdir().unwrap();
        let mut fingerprints = HashMap::new();
        let retry = RetryPolicy::default();

        stage_incremental(&store, "u1", "p1", dir.path(), &mut fingerprints, &retry)
            .await
            .unwrap();
        let outcome =
            stage_incremental(&store, "u1", "p1", dir.path(), &mut fingerprints, &retry)
                .await
                .unwrap();

        assert!(outcome.unchanged);
        assert_eq!(outcome.transferred, 0);
    }

    #[tokio::test]
    async fn incremental_deletes_files_removed_remotely() {
        let store = memory_store();
        seed(&store, &[("keep.txt", b"k"), ("gone.txt", b"g")]).await;

        let dir = tempfile::tempdir().unwrap();
        let mut fingerprints = HashMap::new();
        let retry = RetryPolicy::default();

        stage_incremental(&store, "u1", "p1", dir.path(), &mut fingerprints, &retry)
            .await
            .unwrap();
        assert!(dir.path().join("gone.txt").exists());

        store.delete("u1", "p1", "gone.txt").await.unwrap();
        let outcome =
            stage_incremental(&store, "u1", "p1", dir.path(), &mut fingerprints, &retry)
                .await
                .unwrap();

        assert_eq!(outcome.deleted, 1);
        assert!(!dir.path().join("gone.txt").exists());
        assert!(!fingerprints.contains_key("gone.txt"));
        assert!(fingerprints.contains_key("keep.txt"));
    }

    #[tokio::test]
    async fn reverse_sync_uploads_new_and_changed_files() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/m.rs"), b"fn main() {}").unwrap();

        let mut fingerprints = HashMap::new();
        let outcome = sync_to_cloud(&store, "u1", "p1", dir.path(), &mut fingerprints, None)
            .await
            .unwrap();
        assert_eq!(outcome.transferred, 2);

        // Change one file; only it re-uploads.
        std::fs::write(dir.path().join("a.txt"), b"two").unwrap();
        let outcome = sync_to_cloud(&store, "u1", "p1", dir.path(), &mut fingerprints, None)
            .await
            .unwrap();
        assert_eq!(outcome.transferred, 1);
        assert_eq!(store.download("u1", "p1", "a.txt").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn reverse_sync_deletes_remote_orphans() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let mut fingerprints = HashMap::new();
        sync_to_cloud(&store, "u1", "p1", dir.path(), &mut fingerprints, None)
            .await
            .unwrap();

        std::fs::remove_file(dir.path().join("b.txt")).unwrap();
        let outcome = sync_to_cloud(&store, "u1", "p1", dir.path(), &mut fingerprints, None)
            .await
            .unwrap();

        assert_eq!(outcome.deleted, 1);
        assert!(store.download("u1", "p1", "b.txt").await.is_err());
        assert!(!fingerprints.contains_key("b.txt"));
    }

    #[tokio::test]
    async fn scoped_sync_touches_only_the_subtree() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), b"ref: main").unwrap();
        std::fs::write(dir.path().join("tracked.txt"), b"source").unwrap();

        let mut fingerprints = HashMap::new();
        let outcome = sync_to_cloud(
            &store,
            "u1",
            "p1",
            dir.path(),
            &mut fingerprints,
            Some(".git"),
        )
        .await
        .unwrap();

        assert_eq!(outcome.transferred, 1);
        assert_eq!(
            store.download("u1", "p1", ".git/HEAD").await.unwrap(),
            b"ref: main"
        );
        // The tracked file outside the scope was never uploaded.
        assert!(store.download("u1", "p1", "tracked.txt").await.is_err());
        assert!(!fingerprints.contains_key("tracked.txt"));
    }

    #[tokio::test]
    async fn scoped_sync_never_deletes_outside_the_subtree() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let mut fingerprints = HashMap::new();
        sync_to_cloud(&store, "u1", "p1", dir.path(), &mut fingerprints, None)
            .await
            .unwrap();

        // a.txt is still remote and still in the map even though the scoped
        // pass saw no files under .git at all.
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let outcome = sync_to_cloud(
            &store,
            "u1",
            "p1",
            dir.path(),
            &mut fingerprints,
            Some(".git"),
        )
        .await
        .unwrap();

        assert_eq!(outcome.deleted, 0);
        assert!(fingerprints.contains_key("a.txt"));
        assert_eq!(store.download("u1", "p1", "a.txt").await.unwrap(), b"a");
    }

    /// Make `rel` unwritable under `dir` and report whether the platform
    /// actually enforces it (root bypasses permission bits entirely, which
    /// makes the lock impossible to simulate this way).
    fn lock_file(dir: &Path, rel: &str, content: &[u8]) -> bool {
        let target = dir.join(rel);
        std::fs::write(&target, content).unwrap();
        let mut perms = std::fs::metadata(&target).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&target, perms).unwrap();
        std::fs::write(&target, content).is_err()
    }

    fn unlock_file(dir: &Path, rel: &str) {
        let target = dir.join(rel);
        let mut perms = std::fs::metadata(&target).unwrap().permissions();
        perms.set_readonly(false);
        std::fs::set_permissions(&target, perms).unwrap();
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn locked_file_with_expected_content_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        if !lock_file(dir.path(), "held.txt", b"same bytes") {
            return;
        }

        let fp = hash::fingerprint(b"same bytes");
        let result =
            write_with_retry(dir.path(), "held.txt", b"same bytes", &fp, &fast_retry()).await;
        unlock_file(dir.path(), "held.txt");

        result.unwrap();
        assert_eq!(read(dir.path(), "held.txt"), b"same bytes");
    }

    #[tokio::test]
    async fn locked_file_with_stale_content_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        if !lock_file(dir.path(), "held.txt", b"stale") {
            return;
        }

        let fp = hash::fingerprint(b"fresh");
        let result =
            write_with_retry(dir.path(), "held.txt", b"fresh", &fp, &fast_retry()).await;
        unlock_file(dir.path(), "held.txt");

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            SyncError::LockedFileRetryExhausted { attempts: 3, ref path } if path.as_str() == "held.txt"
        ));
        // The stale local content was never clobbered mid-lock.
        assert_eq!(read(dir.path(), "held.txt"), b"stale");
    }

    #[test]
    fn lock_error_classification() {
        use std::io::{Error, ErrorKind};
        assert!(is_lock_error(&Error::from(ErrorKind::PermissionDenied)));
        assert!(is_lock_error(&Error::from(ErrorKind::WouldBlock)));
        assert!(is_lock_error(&Error::from_raw_os_error(32)));
        assert!(!is_lock_error(&Error::from(ErrorKind::NotFound)));
    }
}

