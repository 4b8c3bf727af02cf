use crate::error::MergeError;
use crate::job::{JobStatus, JobView};
use crate::media::{MergeSummary, merge_clips};
use crate::upload::UploadedFile;
use crate::workspace::JobWorkspace;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as TokioMutex, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct JobEntry {
    clips: usize,
    created_at: DateTime<Utc>,
    status: watch::Receiver<JobStatus>,
    cancel: CancellationToken,
    workspace: JobWorkspace,
    finished_at: Option<Instant>,
}

/// Owns every merge job of the process: runs them in the background,
/// publishes their status and forgets them once retention expires.
#[derive(Clone)]
pub struct JobManager {
    jobs_dir: PathBuf,
    retention: Duration,
    semaphore: Arc<Semaphore>,
    jobs: Arc<TokioMutex<HashMap<Uuid, JobEntry>>>,
}

impl JobManager {
    pub fn new(jobs_dir: &Path, permits: usize, retention: Duration) -> Self {
        info!(permits, retention_secs = retention.as_secs(), jobs_dir = %jobs_dir.display(), "Initialize job manager");
        Self {
            jobs_dir: jobs_dir.to_path_buf(),
            retention,
            semaphore: Arc::new(Semaphore::new(permits)),
            jobs: Arc::new(TokioMutex::new(HashMap::new())),
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Creates the job's workspace and starts merging `files` in the background.
    pub async fn submit(&self, files: Vec<UploadedFile>) -> Result<Uuid, MergeError> {
        let id = Uuid::new_v4();
        let workspace = JobWorkspace::create(&self.jobs_dir, id).await?;
        let (tx, rx) = watch::channel(JobStatus::Queued);
        let cancel = CancellationToken::new();

        let entry = JobEntry {
            clips: files.len(),
            created_at: Utc::now(),
            status: rx,
            cancel: cancel.clone(),
            workspace: workspace.clone(),
            finished_at: None,
        };
        self.jobs.lock().await.insert(id, entry);
        info!(job_id = %id, clips = files.len(), "Job added to processing queue");

        let this = self.clone();
        tokio::spawn(async move {
            this.run_job(workspace, files, tx, cancel).await;
        });
        Ok(id)
    }

    pub async fn status(&self, id: &Uuid) -> Option<JobView> {
        let jobs = self.jobs.lock().await;
        let entry = jobs.get(id)?;
        Some(JobView {
            job_id: *id,
            clips: entry.clips,
            created_at: entry.created_at,
            status: entry.status.borrow().clone(),
        })
    }

    pub async fn subscribe(&self, id: &Uuid) -> Option<watch::Receiver<JobStatus>> {
        let jobs = self.jobs.lock().await;
        jobs.get(id).map(|entry| entry.status.clone())
    }

    /// Current status and output location of a job.
    pub async fn output(&self, id: &Uuid) -> Option<(JobStatus, PathBuf)> {
        let jobs = self.jobs.lock().await;
        let entry = jobs.get(id)?;
        Some((entry.status.borrow().clone(), entry.workspace.output_path()))
    }

    /// Cancels a running job or discards a finished one. Returns false for
    /// unknown ids.
    pub async fn cancel(&self, id: &Uuid) -> bool {
        let Some(entry) = self.jobs.lock().await.remove(id) else {
            return false;
        };

        entry.cancel.cancel();
        if entry.status.borrow().is_terminal() {
            entry.workspace.remove().await;
            info!(job_id = %id, "Finished job removed");
        } else {
            info!(job_id = %id, "Job cancellation requested");
        }
        true
    }

    /// Forgets finished jobs older than the retention period and deletes
    /// their directories.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut jobs = self.jobs.lock().await;
            let ids = jobs
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .finished_at
                        .is_some_and(|finished| now.duration_since(finished) >= self.retention)
                })
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| jobs.remove(&id))
                .collect::<Vec<_>>()
        };

        for entry in expired.iter() {
            debug!(job_id = %entry.workspace.id(), "Job retention expired");
            entry.workspace.remove().await;
        }
        expired.len()
    }

    /// Runs `sweep_expired` periodically for the lifetime of the process.
    pub fn spawn_sweeper(&self) {
        let this = self.clone();
        let period = self.retention.clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let removed = this.sweep_expired().await;
                if removed > 0 {
                    info!(removed, "Expired jobs removed");
                }
            }
        });
    }

    async fn run_job(
        self,
        workspace: JobWorkspace,
        files: Vec<UploadedFile>,
        tx: watch::Sender<JobStatus>,
        cancel: CancellationToken,
    ) {
        let job_id = workspace.id();
        let result = self.process(&workspace, files, &tx, &cancel).await;

        let status = match result {
            // a cancel that races the last packet still discards the output
            _ if cancel.is_cancelled() => {
                workspace.remove().await;
                info!(%job_id, "Job cancelled");
                JobStatus::Cancelled
            }
            Ok(summary) => {
                workspace.remove_inputs().await;
                match tokio::fs::metadata(workspace.output_path()).await {
                    Ok(metadata) => {
                        info!(%job_id, size = metadata.len(), duration = summary.duration_secs, "Job completed successfully");
                        JobStatus::Done {
                            size_bytes: metadata.len(),
                            duration_secs: summary.duration_secs,
                        }
                    }
                    Err(e) => {
                        let error = MergeError::Io(e);
                        error!(%job_id, ?error, "Merged output is missing");
                        workspace.remove().await;
                        JobStatus::failed(&error)
                    }
                }
            }
            Err(error) => {
                error!(%job_id, kind = ?error.kind(), %error, "Job final failure");
                workspace.remove().await;
                JobStatus::failed(&error)
            }
        };

        self.publish(&workspace, &tx, status).await;
    }

    /// Publishes the final status under the job table lock, so `cancel`
    /// either sees it or has already dropped the entry. A dropped entry
    /// means nobody can reach the job again: its files go too.
    async fn publish(
        &self,
        workspace: &JobWorkspace,
        tx: &watch::Sender<JobStatus>,
        status: JobStatus,
    ) {
        let job_id = workspace.id();
        let discarded = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(&job_id) {
                Some(entry) => {
                    tx.send_replace(status);
                    entry.finished_at = Some(Instant::now());
                    false
                }
                None => true,
            }
        };

        if discarded {
            workspace.remove().await;
            info!(%job_id, "Job removed while finishing, output discarded");
            tx.send_replace(JobStatus::Cancelled);
        }
    }

    async fn process(
        &self,
        workspace: &JobWorkspace,
        files: Vec<UploadedFile>,
        tx: &watch::Sender<JobStatus>,
        cancel: &CancellationToken,
    ) -> Result<MergeSummary, MergeError> {
        let job_id = workspace.id();
        debug!(%job_id, "job wait for permit");
        let _permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit.map_err(|_| MergeError::Cancelled)?,
            _ = cancel.cancelled() => return Err(MergeError::Cancelled),
        };
        info!(%job_id, "job started");

        tx.send_replace(JobStatus::Staging);
        let inputs = workspace.materialize(&files).await?;
        drop(files);
        if cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }

        let clips = inputs.len();
        tx.send_replace(JobStatus::Merging {
            clip: 1,
            clips,
            percent: 0,
        });

        let output = workspace.output_path();
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            merge_clips(&job_id.to_string(), &inputs, &output, &cancel, |progress| {
                tx.send_replace(JobStatus::Merging {
                    clip: progress.clip,
                    clips: progress.clips,
                    percent: progress.percent,
                });
            })
        })
        .await
        .map_err(|e| {
            warn!(%job_id, "Merge task panicked: {e}");
            MergeError::Media(format!("Merge task failed: {e}"))
        })?
    }
}
