use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::fs;
use uuid::Uuid;

/// Directory exclusive to one run, holding the materialized script.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    script: PathBuf,
}

impl WorkDir {
    pub async fn create(
        root: &Path,
        run_id: Uuid,
        file_name: &str,
        source: &str,
    ) -> io::Result<Self> {
        let path = root.join(run_id.to_string());

        fs::create_dir_all(root).await?;
        // Not create_dir_all: an existing directory means a collision.
        fs::create_dir(&path).await?;

        let script = path.join(file_name);
        if let Err(e) = fs::write(&script, source).await {
            let _ = fs::remove_dir_all(&path).await;
            return Err(e);
        }

        Ok(Self { path, script })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub async fn remove(self) {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed working directory"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove working directory"
            ),
        }
    }
}
