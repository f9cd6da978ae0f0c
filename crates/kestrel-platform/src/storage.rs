//! Persistence backends for the kernel state document.
//!
//! The kernel serializes its whole state to one JSON document; a backend
//! only has to hand that document back at the next boot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kestrel_types::error::{KernelError, Result};

/// Where the kernel state document lives between boots.
pub trait StorageBackend: Send {
    /// Read the stored document, or `None` on a fresh install.
    fn load(&self) -> Result<Option<String>>;

    /// Replace the stored document.
    fn save(&mut self, document: &str) -> Result<()>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Host file
// ---------------------------------------------------------------------------

/// Stores the document in a single host file.
///
/// Writes go to a sibling temp file that is then renamed over the target,
/// so a crash mid-save leaves the previous document intact.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StorageBackend for FileStorage {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(None),
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KernelError::Storage(format!(
                "cannot read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&mut self, document: &str) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        std::fs::write(&tmp, document)?;
        std::fs::rename(&tmp, &self.path)?;
        log::debug!("Saved {} bytes to {}", document.len(), self.path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Keeps the document in memory.
///
/// Clones share the same slot, so a test can keep a handle and inspect or
/// pre-seed what the kernel sees.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with a document.
    pub fn with_document(document: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(document.into()))),
        }
    }

    /// The last saved document.
    pub fn document(&self) -> Option<String> {
        self.slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl StorageBackend for MemoryStorage {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.document())
    }

    fn save(&mut self, document: &str) -> Result<()> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(document.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
