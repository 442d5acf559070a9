//! On-disk layout for the delta store.

use crate::entity::sanitize_entity_key;
use std::path::{Path, PathBuf};

pub const DELTA_REPO_DIR: &str = ".delta_repo";
pub const DELTA_ID_FILE: &str = "delta_id_file.json";

pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entity_folder(key: &str) -> String {
        sanitize_entity_key(key)
    }

    /// `<data>/<category>/<sanitizedEntityKey>/<term>.json` — current snapshot.
    pub fn current_snapshot(&self, category: &str, entity_key: &str, term: &str) -> PathBuf {
        self.root
            .join(category)
            .join(Self::entity_folder(entity_key))
            .join(format!("{term}.json"))
    }

    /// `<data>/.delta_repo/<category>/<sanitizedEntityKey>/<term>.json` — last-sent snapshot.
    pub fn last_sent_snapshot(&self, category: &str, entity_key: &str, term: &str) -> PathBuf {
        self.root
            .join(DELTA_REPO_DIR)
            .join(category)
            .join(Self::entity_folder(entity_key))
            .join(format!("{term}.json"))
    }

    /// `<data>/.delta_repo/<sanitizedEntityKey>/<term>.pending` — unsent delta blocks.
    pub fn pending_deltas(&self, entity_key: &str, term: &str) -> PathBuf {
        self.root
            .join(DELTA_REPO_DIR)
            .join(Self::entity_folder(entity_key))
            .join(format!("{term}.pending"))
    }

    pub fn delta_id_file(&self) -> PathBuf {
        self.root.join(DELTA_REPO_DIR).join(DELTA_ID_FILE)
    }

    pub fn entity_dir(&self, category: &str, entity_key: &str) -> PathBuf {
        self.root.join(category).join(Self::entity_folder(entity_key))
    }

    /// The per-entity folder used for submission/id bookkeeping files. Not
    /// tied to any one plugin category.
    pub fn entity_state_dir(&self, entity_key: &str) -> PathBuf {
        self.root.join(DELTA_REPO_DIR).join(Self::entity_folder(entity_key))
    }

    pub fn last_submission(&self, entity_key: &str) -> PathBuf {
        self.entity_state_dir(entity_key).join("last_submission")
    }

    pub fn last_entity_id(&self, entity_key: &str) -> PathBuf {
        self.entity_state_dir(entity_key).join("last_entity_id")
    }
}

/// Write a file atomically: write to a sibling temp file then rename over
/// the destination.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
