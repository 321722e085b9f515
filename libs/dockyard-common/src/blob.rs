/// Blob store abstraction.
///
/// Project files live in remote object storage keyed by
/// (owner id, project id, relative path). The worker only ever talks to this
/// trait; production deployments plug a cloud-backed client in behind it,
/// local deployments and tests use the implementations below.
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::hash;
use crate::types::RemoteEntry;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List every entry under a project prefix, recursively. Entries carry
    /// size, file-vs-directory classification and a content fingerprint.
    async fn list(&self, owner_id: &str, project_id: &str, prefix: &str)
        -> Result<Vec<RemoteEntry>>;

    async fn download(&self, owner_id: &str, project_id: &str, path: &str) -> Result<Vec<u8>>;

    async fn upload(&self, owner_id: &str, project_id: &str, path: &str, bytes: &[u8])
        -> Result<()>;

    async fn delete(&self, owner_id: &str, project_id: &str, path: &str) -> Result<()>;

    async fn rename(
        &self,
        owner_id: &str,
        project_id: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<()>;
}

/// Reject relative paths that could escape a project root when joined onto
/// a local directory. Blob keys are opaque to the store but not to us.
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("empty blob path");
    }
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("blob path '{}' is not a plain relative path", path),
        }
    }
    Ok(())
}

/// In-memory blob store. Used by tests and as a scratch backend; tracks the
/// number of listings and downloads served so sync tests can assert exactly
/// how much remote I/O an operation performed.
#[derive(Default)]
pub struct MemoryBlobStore {
    projects: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    downloads: AtomicUsize,
    lists: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    fn project_key(owner_id: &str, project_id: &str) -> String {
        format!("{}/{}", owner_id, project_id)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(
        &self,
        owner_id: &str,
        project_id: &str,
        prefix: &str,
    ) -> Result<Vec<RemoteEntry>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let projects = self.projects.lock().unwrap();
        let Some(files) = projects.get(&Self::project_key(owner_id, project_id)) else {
            return Ok(Vec::new());
        };
        Ok(files
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, bytes)| RemoteEntry {
                path: path.clone(),
                is_directory: false,
                size: bytes.len() as u64,
                fingerprint: hash::fingerprint(bytes),
            })
            .collect())
    }

    async fn download(&self, owner_id: &str, project_id: &str, path: &str) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let projects = self.projects.lock().unwrap();
        projects
            .get(&Self::project_key(owner_id, project_id))
            .and_then(|files| files.get(path))
            .cloned()
            .with_context(|| format!("no blob at {}/{}/{}", owner_id, project_id, path))
    }

    async fn upload(
        &self,
        owner_id: &str,
        project_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<()> {
        validate_relative_path(path)?;
        let mut projects = self.projects.lock().unwrap();
        projects
            .entry(Self::project_key(owner_id, project_id))
            .or_default()
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, owner_id: &str, project_id: &str, path: &str) -> Result<()> {
        let mut projects = self.projects.lock().unwrap();
        if let Some(files) = projects.get_mut(&Self::project_key(owner_id, project_id)) {
            files.remove(path);
        }
        Ok(())
    }

    async fn rename(
        &self,
        owner_id: &str,
        project_id: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<()> {
        validate_relative_path(new_path)?;
        let mut projects = self.projects.lock().unwrap();
        let files = projects
            .get_mut(&Self::project_key(owner_id, project_id))
            .with_context(|| format!("no project {}/{}", owner_id, project_id))?;
        let bytes = files
            .remove(old_path)
            .with_context(|| format!("no blob at {}", old_path))?;
        files.insert(new_path.to_string(), bytes);
        Ok(())
    }
}

/// Directory-backed blob store for single-node deployments. Objects live at
/// `<root>/<owner>/<project>/<path>`; fingerprints are computed from content
/// at listing time, which keeps the layout plain files with no sidecar index.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn project_dir(&self, owner_id: &str, project_id: &str) -> PathBuf {
        self.root.join(owner_id).join(project_id)
    }

    fn object_path(&self, owner_id: &str, project_id: &str, path: &str) -> Result<PathBuf> {
        validate_relative_path(path)?;
        Ok(self.project_dir(owner_id, project_id).join(path))
    }

    fn collect_entries(
        dir: &Path,
        base: &Path,
        out: &mut Vec<RemoteEntry>,
    ) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let relative = path
                .strip_prefix(base)
                .expect("walked path is under its base")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let meta = entry.metadata()?;
            if meta.is_dir() {
                out.push(RemoteEntry {
                    path: relative,
                    is_directory: true,
                    size: 0,
                    fingerprint: String::new(),
                });
                Self::collect_entries(&path, base, out)?;
            } else {
                let bytes = std::fs::read(&path)?;
                out.push(RemoteEntry {
                    path: relative,
                    is_directory: false,
                    size: meta.len(),
                    fingerprint: hash::fingerprint(&bytes),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(
        &self,
        owner_id: &str,
        project_id: &str,
        prefix: &str,
    ) -> Result<Vec<RemoteEntry>> {
        let base = self.project_dir(owner_id, project_id);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let prefix = prefix.to_string();
        let entries = tokio::task::spawn_blocking(move || -> Result<Vec<RemoteEntry>> {
            let mut out = Vec::new();
            Self::collect_entries(&base, &base, &mut out).context("listing project directory")?;
            out.retain(|e| e.path.starts_with(&prefix));
            Ok(out)
        })
        .await
        .context("listing task panicked")??;
        Ok(entries)
    }

    async fn download(&self, owner_id: &str, project_id: &str, path: &str) -> Result<Vec<u8>> {
        let object = self.object_path(owner_id, project_id, path)?;
        tokio::fs::read(&object)
            .await
            .with_context(|| format!("reading blob {}", object.display()))
    }

    async fn upload(
        &self,
        owner_id: &str,
        project_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let object = self.object_path(owner_id, project_id, path)?;
        if let Some(parent) = object.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&object, bytes)
            .await
            .with_context(|| format!("writing blob {}", object.display()))
    }

    async fn delete(&self, owner_id: &str, project_id: &str, path: &str) -> Result<()> {
        let object = self.object_path(owner_id, project_id, path)?;
        match tokio::fs::remove_file(&object).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting blob {}", object.display())),
        }
    }

    async fn rename(
        &self,
        owner_id: &str,
        project_id: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<()> {
        let from = self.object_path(owner_id, project_id, old_path)?;
        let to = self.object_path(owner_id, project_id, new_path)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("renaming {} to {}", from.display(), to.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths() {
        assert!(validate_relative_path("src/main.py").is_ok());
        assert!(validate_relative_path("../outside").is_err());
        assert!(validate_relative_path("a/../../b").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("").is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        store.upload("u1", "p1", "a.txt", b"alpha").await.unwrap();
        store.upload("u1", "p1", "dir/b.txt", b"beta").await.unwrap();

        let listing = store.list("u1", "p1", "").await.unwrap();
        assert_eq!(listing.len(), 2);
        assert!(listing.iter().all(|e| !e.is_directory));

        let bytes = store.download("u1", "p1", "dir/b.txt").await.unwrap();
        assert_eq!(bytes, b"beta");
        assert_eq!(store.download_count(), 1);
    }

    #[tokio::test]
    async fn memory_store_list_respects_prefix() {
        let store = MemoryBlobStore::new();
        store.upload("u1", "p1", ".git/HEAD", b"ref").await.unwrap();
        store.upload("u1", "p1", "main.py", b"print()").await.unwrap();

        let scoped = store.list("u1", "p1", ".git/").await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].path, ".git/HEAD");
    }

    #[tokio::test]
    async fn memory_store_rename_moves_content() {
        let store = MemoryBlobStore::new();
        store.upload("u1", "p1", "old.txt", b"x").await.unwrap();
        store.rename("u1", "p1", "old.txt", "new.txt").await.unwrap();
        assert!(store.download("u1", "p1", "old.txt").await.is_err());
        assert_eq!(store.download("u1", "p1", "new.txt").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn fs_store_lists_files_and_directories() {
        let root = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path());
        store.upload("u1", "p1", "src/main.rs", b"fn main() {}").await.unwrap();
        store.upload("u1", "p1", "README.md", b"# hi").await.unwrap();

        let mut listing = store.list("u1", "p1", "").await.unwrap();
        listing.sort_by(|a, b| a.path.cmp(&b.path));

        let paths: Vec<_> = listing.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src", "src/main.rs"]);
        assert!(listing[1].is_directory);
        assert!(!listing[2].fingerprint.is_empty());
    }

    #[tokio::test]
    async fn fs_store_delete_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path());
        store.upload("u1", "p1", "a.txt", b"x").await.unwrap();
        store.delete("u1", "p1", "a.txt").await.unwrap();
        store.delete("u1", "p1", "a.txt").await.unwrap();
        assert!(store.list("u1", "p1", "").await.unwrap().is_empty());
    }
}
