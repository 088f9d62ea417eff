//! Folder indexer
//!
//! Walks a managed folder breadth-first, hashes file contents, and writes
//! a versioned delta against the prior snapshot: unchanged entries are
//! reused untouched, modified and added files become new rows at the new
//! version (the segmentation staging set), vanished paths get their
//! `version_last_seen` closed out. Per-file IO errors are recorded on the
//! entry and never abort the run.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::config::IndexSection;
use crate::store::Store;
use crate::types::{new_entity_id, FileChange, FileEntry, FileKind, Folder};
use crate::{Error, Result};

/// Hashing buffer; a fraction of the segment size keeps at most one
/// segment's worth of plaintext in flight.
const HASH_BUF: usize = 256 * 1024;

/// Summary of one indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexOutcome {
    /// Version the snapshot was written at (unchanged when nothing moved).
    pub version: u64,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub total_bytes: u64,
    pub file_count: u64,
}

impl IndexOutcome {
    pub fn changed(&self) -> bool {
        self.added + self.modified + self.removed + self.errors > 0
    }
}

/// One observation from the filesystem walk.
#[derive(Debug)]
struct Observation {
    relative_path: String,
    kind: FileKind,
    size: u64,
    modified_at: DateTime<Utc>,
    content_hash: String,
    error: Option<String>,
}

pub struct Indexer {
    store: Store,
    config: IndexSection,
}

impl Indexer {
    pub fn new(store: Store, config: IndexSection) -> Self {
        Self { store, config }
    }

    /// Index one folder. Returns the outcome; the version is bumped only
    /// when the delta is non-empty, so re-indexing an unchanged tree is a
    /// true no-op (no rows written, no version movement).
    pub async fn index_folder(&self, folder: &Folder) -> Result<IndexOutcome> {
        let root = PathBuf::from(&folder.path);
        let exclude = self.config.exclude.clone();
        let batch_size = self.config.batch_size.max(1);

        // The walk and hashing are blocking filesystem work.
        let observations = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || scan_tree(&root, &exclude, batch_size))
                .await
                .map_err(|e| Error::storage(format!("index task failed: {}", e)))??
        };

        let mut tx = self.store.begin().await?;
        let prior = tx.current_files(&folder.folder_id).await?;
        let prior_by_path: HashMap<&str, &FileEntry> = prior
            .iter()
            .map(|entry| (entry.relative_path.as_str(), entry))
            .collect();

        let mut outcome = IndexOutcome::default();
        let mut staged: Vec<(Observation, FileChange)> = Vec::new();
        let mut closed: Vec<String> = Vec::new();
        let walked: std::collections::HashSet<String> = observations
            .iter()
            .map(|obs| obs.relative_path.clone())
            .collect();

        for obs in observations {
            match prior_by_path.get(obs.relative_path.as_str()) {
                Some(prev)
                    if prev.content_hash == obs.content_hash
                        && prev.size == obs.size
                        && prev.error.is_none()
                        && obs.error.is_none() =>
                {
                    outcome.unchanged += 1;
                }
                Some(prev) => {
                    closed.push(prev.file_id.clone());
                    staged.push((obs, FileChange::Modified));
                }
                None => {
                    staged.push((obs, FileChange::Added));
                }
            }
        }

        // Paths present in the prior snapshot that the walk never produced.
        for prev in &prior {
            if !walked.contains(&prev.relative_path) {
                closed.push(prev.file_id.clone());
                outcome.removed += 1;
            }
        }

        outcome.added = staged
            .iter()
            .filter(|(_, change)| *change == FileChange::Added)
            .count();
        outcome.modified = staged
            .iter()
            .filter(|(_, change)| *change == FileChange::Modified)
            .count();
        outcome.errors = staged.iter().filter(|(obs, _)| obs.error.is_some()).count();

        if staged.is_empty() && outcome.removed == 0 {
            // Nothing changed: no rows, no version bump.
            outcome.version = folder.version;
            outcome.unchanged = prior.len();
            outcome.file_count = prior.iter().filter(|f| f.kind == FileKind::File).count() as u64;
            outcome.total_bytes = prior.iter().map(|f| f.size).sum();
            tx.rollback().await?;
            return Ok(outcome);
        }

        let new_version = if prior.is_empty() && folder.version == 1 {
            // First index run populates version 1 without a bump.
            1
        } else {
            tx.bump_folder_version(&folder.folder_id).await?
        };
        outcome.version = new_version;

        tx.mark_files_removed(&closed, new_version - 1).await?;

        let entries: Vec<FileEntry> = staged
            .into_iter()
            .map(|(obs, _)| FileEntry {
                file_id: new_entity_id(),
                folder_id: folder.folder_id.clone(),
                relative_path: obs.relative_path,
                kind: obs.kind,
                size: obs.size,
                content_hash: obs.content_hash,
                version_first_seen: new_version,
                version_last_seen: None,
                modified_at: obs.modified_at,
                error: obs.error,
            })
            .collect();
        tx.insert_file_entries(&entries).await?;

        // Refresh aggregate statistics from the live snapshot.
        let live = tx.current_files(&folder.folder_id).await?;
        outcome.file_count = live.iter().filter(|f| f.kind == FileKind::File).count() as u64;
        outcome.total_bytes = live
            .iter()
            .filter(|f| f.kind == FileKind::File)
            .map(|f| f.size)
            .sum();
        outcome.unchanged = live.len() - entries.len();
        let mut stats = folder.stats;
        stats.file_count = outcome.file_count;
        stats.total_bytes = outcome.total_bytes;
        tx.update_folder_stats(&folder.folder_id, stats).await?;

        tx.commit().await?;

        tracing::info!(
            folder = %folder.folder_id,
            version = new_version,
            added = outcome.added,
            modified = outcome.modified,
            removed = outcome.removed,
            unchanged = outcome.unchanged,
            errors = outcome.errors,
            "indexed folder"
        );
        Ok(outcome)
    }
}

/// Walk the tree breadth-first and hash every regular file. Directories
/// are emitted only when empty, so reconstruction can recreate them.
fn scan_tree(
    root: &Path,
    exclude: &[String],
    batch_size: usize,
) -> Result<Vec<Observation>> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{}: {}", root.display(), e))))?;

    let mut observations = Vec::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(canonical_root.clone());
    let mut batch: Vec<PathBuf> = Vec::new();

    while let Some(dir) = queue.pop_front() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if dir == canonical_root => return Err(e.into()),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "unreadable directory: {}", e);
                continue;
            }
        };

        let mut child_count = 0usize;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), "unreadable entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            let relative = relative_path(&canonical_root, &path)?;
            if is_excluded(&relative, exclude) {
                continue;
            }
            child_count += 1;

            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    observations.push(error_observation(relative, e.to_string()));
                    continue;
                }
            };

            if file_type.is_symlink() {
                // Follow only links that stay inside the root.
                match path.canonicalize() {
                    Ok(target) if target.starts_with(&canonical_root) => {
                        if target.is_dir() {
                            queue.push_back(path);
                        } else {
                            batch.push(path);
                        }
                    }
                    _ => {
                        tracing::debug!(path = %path.display(), "skipping escaping symlink");
                    }
                }
            } else if file_type.is_dir() {
                queue.push_back(path);
            } else {
                batch.push(path);
            }

            if batch.len() >= batch_size {
                drain_batch(&canonical_root, &mut batch, &mut observations);
            }
        }

        if child_count == 0 && dir != canonical_root {
            let relative = relative_path(&canonical_root, &dir)?;
            observations.push(Observation {
                relative_path: relative,
                kind: FileKind::Directory,
                size: 0,
                modified_at: Utc::now(),
                content_hash: empty_hash(),
                error: None,
            });
        }
    }
    drain_batch(&canonical_root, &mut batch, &mut observations);

    // Deterministic emission order regardless of directory iteration order.
    observations.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(observations)
}

fn drain_batch(root: &Path, batch: &mut Vec<PathBuf>, out: &mut Vec<Observation>) {
    for path in batch.drain(..) {
        let relative = match relative_path(root, &path) {
            Ok(rel) => rel,
            Err(e) => {
                tracing::warn!(path = %path.display(), "unrelatable path: {}", e);
                continue;
            }
        };
        out.push(observe_file(&path, relative));
    }
}

fn observe_file(path: &Path, relative: String) -> Observation {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) => return error_observation(relative, e.to_string()),
    };
    let modified_at = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    match hash_file(path) {
        Ok(content_hash) => Observation {
            relative_path: relative,
            kind: FileKind::File,
            size: metadata.len(),
            modified_at,
            content_hash,
            error: None,
        },
        Err(e) => error_observation(relative, e.to_string()),
    }
}

fn error_observation(relative: String, message: String) -> Observation {
    Observation {
        relative_path: relative,
        kind: FileKind::File,
        size: 0,
        modified_at: Utc::now(),
        content_hash: empty_hash(),
        error: Some(message),
    }
}

/// Streaming SHA-256 of a file's bytes.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn empty_hash() -> String {
    hash_bytes(b"")
}

/// Forward-slash relative path, no leading slash.
fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::storage(format!("path escapes root: {}", path.display())))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Glob-lite exclusion: `*` matches within one path component; a pattern
/// without `*` matches a whole component or path prefix.
fn is_excluded(relative: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.contains('*') {
            relative
                .split('/')
                .any(|component| wildcard_match(component, pattern))
        } else {
            relative == pattern
                || relative.starts_with(&format!("{}/", pattern))
                || relative.split('/').any(|component| component == pattern)
        }
    })
}

fn wildcard_match(text: &str, pattern: &str) -> bool {
    let mut segments = pattern.split('*').peekable();
    let mut rest = text;
    let mut first = true;
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            first = false;
            continue;
        }
        match rest.find(segment) {
            Some(pos) => {
                if first && pos != 0 {
                    return false;
                }
                rest = &rest[pos + segment.len()..];
            }
            None => return false,
        }
        if segments.peek().is_none() && !pattern.ends_with('*') && !rest.is_empty() {
            return false;
        }
        first = false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::open_temp;
    use crate::types::{Folder, FolderStats, FolderStatus};

    fn folder_for(dir: &Path) -> Folder {
        Folder {
            folder_id: "f1".to_string(),
            path: dir.to_string_lossy().into_owned(),
            version: 1,
            status: FolderStatus::Added,
            public_key: vec![1; 32],
            private_key_enc: vec![2; 60],
            stats: FolderStats::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn setup() -> (tempfile::TempDir, tempfile::TempDir, Store, Folder) {
        let (store_dir, store) = open_temp().await;
        let data_dir = tempfile::TempDir::new().unwrap();
        let folder = folder_for(data_dir.path());
        let mut tx = store.begin().await.unwrap();
        tx.insert_folder(&folder).await.unwrap();
        tx.commit().await.unwrap();
        (store_dir, data_dir, store, folder)
    }

    use crate::store::Store;

    #[tokio::test]
    async fn test_first_index_classifies_all_as_added() {
        let (_sd, data, store, folder) = setup().await;
        fs::write(data.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(data.path().join("sub")).unwrap();
        fs::write(data.path().join("sub/b.bin"), vec![0x41; 1000]).unwrap();

        let indexer = Indexer::new(store.clone(), IndexSection::default());
        let outcome = indexer.index_folder(&folder).await.unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.modified, 0);
        assert_eq!(outcome.file_count, 2);
        assert_eq!(outcome.total_bytes, 1005);

        let mut tx = store.begin().await.unwrap();
        let files = tx.current_files("f1").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].relative_path, "a.txt");
        assert_eq!(files[1].relative_path, "sub/b.bin");
        assert_eq!(files[0].content_hash, hash_bytes(b"hello"));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_reindex_unchanged_is_noop() {
        let (_sd, data, store, folder) = setup().await;
        fs::write(data.path().join("a.txt"), b"hello").unwrap();

        let indexer = Indexer::new(store.clone(), IndexSection::default());
        indexer.index_folder(&folder).await.unwrap();
        let outcome = indexer.index_folder(&folder).await.unwrap();
        assert_eq!(outcome.version, 1);
        assert!(!outcome.changed());
        assert_eq!(outcome.unchanged, 1);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_folder("f1").await.unwrap().unwrap().version, 1);
        assert_eq!(tx.current_files("f1").await.unwrap().len(), 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_modify_and_remove_bump_version() {
        let (_sd, data, store, folder) = setup().await;
        fs::write(data.path().join("a.txt"), b"hello").unwrap();
        fs::write(data.path().join("b.txt"), b"world").unwrap();

        let indexer = Indexer::new(store.clone(), IndexSection::default());
        indexer.index_folder(&folder).await.unwrap();

        fs::write(data.path().join("a.txt"), b"hello again").unwrap();
        fs::remove_file(data.path().join("b.txt")).unwrap();
        let mut tx = store.begin().await.unwrap();
        let folder = tx.get_folder("f1").await.unwrap().unwrap();
        tx.commit().await.unwrap();

        let outcome = indexer.index_folder(&folder).await.unwrap();
        assert_eq!(outcome.version, 2);
        assert_eq!(outcome.modified, 1);
        assert_eq!(outcome.removed, 1);

        let mut tx = store.begin().await.unwrap();
        let current = tx.current_files("f1").await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].relative_path, "a.txt");
        assert_eq!(current[0].version_first_seen, 2);

        // Version 1 still reconstructs the old view.
        let at_v1 = tx.files_at_version("f1", 1).await.unwrap();
        assert_eq!(at_v1.len(), 2);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_directory_tracked() {
        let (_sd, data, store, folder) = setup().await;
        fs::create_dir(data.path().join("empty")).unwrap();

        let indexer = Indexer::new(store.clone(), IndexSection::default());
        indexer.index_folder(&folder).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let files = tx.current_files("f1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, FileKind::Directory);
        assert_eq!(files[0].relative_path, "empty");
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_exclusions() {
        let (_sd, data, store, folder) = setup().await;
        fs::write(data.path().join("keep.txt"), b"keep").unwrap();
        fs::write(data.path().join("skip.tmp"), b"skip").unwrap();
        fs::create_dir(data.path().join(".git")).unwrap();
        fs::write(data.path().join(".git/config"), b"x").unwrap();

        let config = IndexSection {
            batch_size: 1000,
            exclude: vec!["*.tmp".to_string(), ".git".to_string()],
        };
        let indexer = Indexer::new(store.clone(), config);
        let outcome = indexer.index_folder(&folder).await.unwrap();
        assert_eq!(outcome.added, 1);

        let mut tx = store.begin().await.unwrap();
        let files = tx.current_files("f1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "keep.txt");
        tx.commit().await.unwrap();
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("foo.tmp", "*.tmp"));
        assert!(wildcard_match("x", "*"));
        assert!(!wildcard_match("foo.tmpx", "*.tmp"));
        assert!(wildcard_match("node_modules", "node_*"));
        assert!(!wildcard_match("foo", "bar*"));
    }
}
