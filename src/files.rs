use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

/// Workspace-local file storage. Deletion is best-effort: a missing file
/// is a no-op and IO failures are logged, never surfaced to the caller,
/// so entity deletion cannot be blocked by storage hiccups.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            root: workspace.join("files"),
        }
    }

    pub fn store(&self, bytes: &[u8], path_hint: &str) -> anyhow::Result<String> {
        std::fs::create_dir_all(&self.root)?;
        let safe_hint: String = path_hint
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let file_ref = format!("{}-{}", Uuid::new_v4(), safe_hint);
        std::fs::write(self.root.join(&file_ref), bytes)?;
        Ok(file_ref)
    }

    pub fn path_of(&self, file_ref: &str) -> PathBuf {
        self.root.join(file_ref)
    }

    pub fn delete(&self, file_ref: &str) {
        let path = self.root.join(file_ref);
        if !path.exists() {
            return;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => info!(file_ref, "deleted backing file"),
            Err(e) => warn!(file_ref, error = %e, "failed to delete backing file"),
        }
    }
}
