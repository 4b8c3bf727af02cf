use crate::config::Config;
use crate::job::JobManager;
use crate::workspace::sweep_jobs_dir;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const JOBS_DIR: &str = "jobs";

async fn init_workspace(workspace: &Path) -> std::io::Result<PathBuf> {
    let jobs_dir = workspace.join(JOBS_DIR);
    tokio::fs::create_dir_all(&jobs_dir).await?;
    Ok(jobs_dir)
}

#[derive(Clone)]
pub struct AppState {
    pub jobs_manager: JobManager,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let jobs_dir = init_workspace(&config.workspace_path()).await?;

        // nothing survives a restart, the job table lives in memory
        match sweep_jobs_dir(&jobs_dir).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed stale job directories"),
            Err(error) => warn!(?error, jobs_dir = %jobs_dir.display(), "Failed to sweep stale jobs"),
        }

        let jobs_manager = JobManager::new(&jobs_dir, config.permits, config.retention());
        jobs_manager.spawn_sweeper();

        Ok(Self {
            jobs_manager,
            max_upload_bytes: config.max_upload_bytes(),
        })
    }

    pub fn jobs_dir(&self) -> &Path {
        self.jobs_manager.jobs_dir()
    }
}
