use crate::upload::UploadedFile;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const INPUTS_DIR: &str = "inputs";
pub const OUTPUT_FILE: &str = "merged_video.mp4";

/// Scratch directory owned by exactly one merge job.
#[derive(Clone, Debug)]
pub struct JobWorkspace {
    id: Uuid,
    dir: PathBuf,
}

impl JobWorkspace {
    /// Creates `<jobs_dir>/<id>/inputs`.
    pub async fn create(jobs_dir: &Path, id: Uuid) -> std::io::Result<Self> {
        let dir = jobs_dir.join(id.to_string());
        tokio::fs::create_dir_all(dir.join(INPUTS_DIR)).await?;
        debug!(job_id = %id, dir = %dir.display(), "Job workspace created");
        Ok(Self { id, dir })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.dir.join(INPUTS_DIR)
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    /// Staged name of the upload in `slot`; the slot prefix keeps two
    /// uploads with the same original name apart.
    pub fn staged_name(slot: usize, original: &str) -> String {
        let sanitized = sanitize_filename::sanitize(original);
        let sanitized = if sanitized.is_empty() {
            "upload".to_string()
        } else {
            sanitized
        };
        format!("{slot:02}-{sanitized}")
    }

    /// Writes every upload verbatim and returns the staged paths in slot order.
    pub async fn materialize(&self, files: &[UploadedFile]) -> std::io::Result<Vec<PathBuf>> {
        let inputs_dir = self.inputs_dir();
        let mut paths = Vec::with_capacity(files.len());

        for (slot, upload) in files.iter().enumerate() {
            let path = inputs_dir.join(Self::staged_name(slot, &upload.name));
            let mut file = tokio::fs::File::create(&path).await?;
            file.write_all(&upload.content).await?;
            file.flush().await?;
            debug!(job_id = %self.id, slot, bytes = upload.len(), path = %path.display(), "Upload staged");
            paths.push(path);
        }

        info!(job_id = %self.id, files = paths.len(), "Uploads materialized");
        Ok(paths)
    }

    pub async fn remove_inputs(&self) {
        if let Err(error) = tokio::fs::remove_dir_all(self.inputs_dir()).await {
            warn!(job_id = %self.id, ?error, "Failed to remove staged inputs");
        }
    }

    pub async fn remove(&self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!(job_id = %self.id, "Job workspace removed"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(job_id = %self.id, ?error, "Failed to remove job workspace"),
        }
    }
}

/// Removes job directories left behind by a previous process.
pub async fn sweep_jobs_dir(jobs_dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(jobs_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(error) => warn!(?error, path = %path.display(), "Failed to remove stale job entry"),
        }
    }
    Ok(removed)
}
