//! Durable document store.
//!
//! Each document's compressed vectors live in one blob file under `docs/`,
//! written with a temp-file + rename commit so a crash leaves either the
//! whole document visible or none of it. Document ids are unique;
//! [`DocStore::len`] counts committed documents only.

use crate::codec::CompressedVector;
use crate::error::{LateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One committed document: compressed token vectors plus optional provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub doc_id: u32,
    pub vectors: Vec<CompressedVector>,
    /// Original text, kept only for result display.
    pub text: Option<String>,
}

/// Write `data` to `path` atomically: temp file in the same directory, fsync,
/// rename over the target.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        LateError::InvalidParameter(format!("path {} has no parent", path.display()))
    })?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("blob")
    ));

    let mut file = fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}

/// On-disk store of compressed documents.
#[derive(Debug)]
pub struct DocStore {
    root: PathBuf,
    /// doc id -> committed vector count.
    docs: BTreeMap<u32, usize>,
}

impl DocStore {
    fn docs_dir(root: &Path) -> PathBuf {
        root.join("docs")
    }

    fn doc_path(&self, doc_id: u32) -> PathBuf {
        Self::docs_dir(&self.root).join(format!("{doc_id}.bin"))
    }

    /// Create an empty store rooted at `root`, creating directories as needed.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(Self::docs_dir(root))?;
        Ok(Self {
            root: root.to_path_buf(),
            docs: BTreeMap::new(),
        })
    }

    /// Open an existing store, scanning the committed blobs.
    ///
    /// Stray temp files from interrupted commits are ignored (and removed);
    /// an unreadable committed blob surfaces as [`LateError::IndexCorrupt`].
    pub fn open(root: &Path) -> Result<Self> {
        let dir = Self::docs_dir(root);
        if !dir.is_dir() {
            return Err(LateError::IndexCorrupt(format!(
                "missing docs directory under {}",
                root.display()
            )));
        }

        let mut docs = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(".tmp") {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            let id: u32 = name
                .strip_suffix(".bin")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    LateError::IndexCorrupt(format!("unexpected file in docs dir: {name}"))
                })?;
            let doc: StoredDocument = bincode::deserialize(&fs::read(entry.path())?)
                .map_err(|e| LateError::IndexCorrupt(format!("document {id}: {e}")))?;
            if doc.doc_id != id {
                return Err(LateError::IndexCorrupt(format!(
                    "document blob {name} claims id {}",
                    doc.doc_id
                )));
            }
            docs.insert(id, doc.vectors.len());
        }

        Ok(Self {
            root: root.to_path_buf(),
            docs,
        })
    }

    /// Commit a document. Overwrites any previous blob for the same id.
    pub fn put(&mut self, doc: &StoredDocument) -> Result<()> {
        let data = bincode::serialize(doc)?;
        atomic_write(&self.doc_path(doc.doc_id), &data)?;
        self.docs.insert(doc.doc_id, doc.vectors.len());
        Ok(())
    }

    /// Read a committed document, `None` if the id is unknown.
    pub fn get(&self, doc_id: u32) -> Result<Option<StoredDocument>> {
        if !self.docs.contains_key(&doc_id) {
            return Ok(None);
        }
        let data = fs::read(self.doc_path(doc_id))?;
        let doc = bincode::deserialize(&data)
            .map_err(|e| LateError::IndexCorrupt(format!("document {doc_id}: {e}")))?;
        Ok(Some(doc))
    }

    /// Remove a document. Unknown ids are a local no-op.
    pub fn delete(&mut self, doc_id: u32) -> Result<()> {
        if self.docs.remove(&doc_id).is_some() {
            fs::remove_file(self.doc_path(doc_id))?;
        }
        Ok(())
    }

    /// Number of committed documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Committed vector count for a document, if present.
    pub fn vector_count(&self, doc_id: u32) -> Option<usize> {
        self.docs.get(&doc_id).copied()
    }

    /// Total committed vectors across all documents.
    pub fn total_vectors(&self) -> usize {
        self.docs.values().sum()
    }

    /// Committed document ids, ascending.
    pub fn doc_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.docs.keys().copied()
    }

    /// Highest committed id, if any. New documents are assigned ids above it.
    pub fn max_doc_id(&self) -> Option<u32> {
        self.docs.keys().next_back().copied()
    }
}
