use chrono::Utc;
use gpustack_common::{validate_stack_name, DeploymentState, ModelError};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    InvalidName(#[from] ModelError),
}

/// Deployment state persisted as one JSON file per stack.
///
/// Writes go to a temp file that is renamed over the target, so a crash never
/// leaves a half-written state behind.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Only names that pass `validate_stack_name` map to a path, so nothing
    /// outside the state directory is ever read, written or moved.
    pub fn path_for(&self, stack_name: &str) -> Result<PathBuf, StoreError> {
        validate_stack_name(stack_name)?;
        Ok(self.dir.join(format!("{}.json", stack_name)))
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn save(&self, state: &DeploymentState) -> Result<(), StoreError> {
        let path = self.path_for(&state.stack_name)?;
        std::fs::create_dir_all(&self.dir).map_err(Self::io(&self.dir))?;
        let tmp = self.dir.join(format!(".{}.json.tmp", state.stack_name));
        let body = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, body).map_err(Self::io(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(Self::io(&path))?;
        Ok(())
    }

    pub fn load(&self, stack_name: &str) -> Result<Option<DeploymentState>, StoreError> {
        let path = self.path_for(stack_name)?;
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io(&path)(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { path, source })
    }

    /// Move the state file to `archive/<stack>-<timestamp>.json`.
    /// Returns the archive path, or `None` when there was nothing to archive.
    pub fn archive(&self, stack_name: &str) -> Result<Option<PathBuf>, StoreError> {
        let path = self.path_for(stack_name)?;
        if !path.exists() {
            return Ok(None);
        }
        let archive_dir = self.dir.join("archive");
        std::fs::create_dir_all(&archive_dir).map_err(Self::io(&archive_dir))?;
        let target = archive_dir.join(format!(
            "{}-{}.json",
            stack_name,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        std::fs::rename(&path, &target).map_err(Self::io(&target))?;
        Ok(Some(target))
    }
}
