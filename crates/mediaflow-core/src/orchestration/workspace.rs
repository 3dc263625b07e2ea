use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::models::{TaskId, UserId};

/// Task-scoped working directory at `<root>/<user_id>/<task_id>`.
///
/// Removed exactly once: by [`release`](Self::release) on the normal path,
/// or synchronously on drop if the owner never got that far.
#[derive(Debug)]
pub struct TaskWorkspace {
    path: PathBuf,
    released: bool,
}

impl TaskWorkspace {
    pub fn path_for(root: &Path, user_id: UserId, task_id: TaskId) -> PathBuf {
        root.join(user_id.to_string()).join(task_id.to_string())
    }

    pub async fn create(root: &Path, user_id: UserId, task_id: TaskId) -> std::io::Result<Self> {
        let path = Self::path_for(root, user_id, task_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the directory tree. Returns `false` if it was already released.
    pub async fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "task workspace removed"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => tracing::warn!(
                path = %self.path.display(),
                error = %error,
                "failed to remove task workspace"
            ),
        }
        true
    }
}

impl Drop for TaskWorkspace {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
