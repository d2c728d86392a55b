//! Editor-side collaborators consulted before a reload.

use std::{path::PathBuf, time::SystemTime};

use async_trait::async_trait;

/// A saved source document that may trigger a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    /// Modification time of the file on disk.
    pub saved_at: SystemTime,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, saved_at: SystemTime) -> Self {
        Self {
            path: path.into(),
            saved_at,
        }
    }
}

#[async_trait]
pub trait DocumentSaver: Send + Sync {
    /// Flush every modified document to disk.
    async fn save_all(&self);
}

/// Static analysis consulted before a reload is attempted.
#[async_trait]
pub trait AnalysisOracle: Send + Sync {
    /// `true` when `document` itself has syntax or structural errors. Errors
    /// in other files are left to the runtime to report.
    async fn has_structural_errors(&self, document: &Document) -> bool;
}
