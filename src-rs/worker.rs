use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::{sync::watch, task::JoinHandle, time::timeout};

use crate::{
    analytics::{AnalyticsSink, ConversionStatus},
    artifacts::{package_result, remove_file_if_exists, sanitize_base_name},
    dispatch::{Dispatcher, OutboundEvent},
    error::ConversionError,
    pdf::{with_extension, DocumentEngine},
    queue::{ConversionJob, FailureDisposition, JobOutcome, JobQueue},
};

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub poll_interval: Duration,
    pub reaper_interval: Duration,
    pub log_task_queue_timings: bool,
}

/// Scratch files one attempt may create. Removed after every attempt; only
/// the packaged archive survives a successful one.
struct AttemptPaths {
    decrypted: PathBuf,
    docx: PathBuf,
}

impl AttemptPaths {
    fn for_job(result_dir: &Path, job: &ConversionJob) -> Self {
        let base = format!(
            "{}_{}_{}",
            job.user_id,
            job.id,
            sanitize_base_name(&job.file_name)
        );
        Self {
            decrypted: result_dir.join(format!("{}.decrypted.pdf", base)),
            docx: result_dir.join(format!("{}.docx", base)),
        }
    }

    async fn cleanup(&self) {
        remove_file_if_exists(&self.decrypted).await;
        remove_file_if_exists(&self.docx).await;
    }
}

pub fn result_caption(file_name: &str) -> String {
    let docx_name = with_extension(Path::new(file_name), "docx");
    format!(
        "Your DOCX file ({}) is ready (zipped for faster delivery)!",
        docx_name.display()
    )
}

pub fn failure_text(error: Option<&ConversionError>, file_name: &str) -> String {
    match error {
        Some(ConversionError::PasswordRequired) => format!(
            "{} is encrypted. Send it again together with its password.",
            file_name
        ),
        Some(ConversionError::PasswordIncorrect) => format!(
            "The password you supplied does not open {}. Check it and send the file again.",
            file_name
        ),
        Some(ConversionError::InvalidInput(_)) => format!(
            "{} could not be read as a PDF. Please upload a valid PDF file.",
            file_name
        ),
        _ => format!(
            "Something went wrong converting {}. Please try again or contact support.",
            file_name
        ),
    }
}

/// Shared state of every worker task and the queue reaper.
pub struct ConversionWorker {
    queue: JobQueue,
    engine: Arc<dyn DocumentEngine>,
    analytics: Arc<dyn AnalyticsSink>,
    dispatcher: Dispatcher,
    result_dir: PathBuf,
    settings: WorkerSettings,
    running: AtomicUsize,
}

impl ConversionWorker {
    pub fn new(
        queue: JobQueue,
        engine: Arc<dyn DocumentEngine>,
        analytics: Arc<dyn AnalyticsSink>,
        dispatcher: Dispatcher,
        result_dir: PathBuf,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            engine,
            analytics,
            dispatcher,
            result_dir,
            settings,
            running: AtomicUsize::new(0),
        }
    }

    /// Runs one leased job to a terminal state or back onto the queue.
    pub async fn process(&self, job: ConversionJob) {
        let started_at = Instant::now();
        let wait_ms = (Utc::now() - job.visible_at).num_milliseconds().max(0);
        let attempt = job.attempts + 1;
        self.running.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            user_id = job.user_id,
            job_id = %job.id,
            attempt,
            "conversion started"
        );

        let paths = AttemptPaths::for_job(&self.result_dir, &job);
        let soft_limit = self.settings.soft_time_limit;
        let result = match timeout(soft_limit, self.convert(&job, &paths)).await {
            Ok(result) => result,
            Err(_) => Err(ConversionError::TimedOut(soft_limit)),
        };
        paths.cleanup().await;

        match result {
            Ok(archive) => self.finish_success(&job, archive).await,
            Err(error) => self.finish_failure(&job, error).await,
        }

        let running = self.running.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if self.settings.log_task_queue_timings {
            tracing::info!(
                queue = "conversion",
                task = "pdf-to-docx",
                job_id = %job.id,
                wait_ms,
                run_ms = started_at.elapsed().as_millis(),
                running,
                "queue timing"
            );
        }
    }

    async fn convert(
        &self,
        job: &ConversionJob,
        paths: &AttemptPaths,
    ) -> Result<PathBuf, ConversionError> {
        let inspection = self.engine.inspect(&job.input_path).await?;

        let source = if inspection.encrypted {
            let secret = job
                .secret
                .as_ref()
                .ok_or(ConversionError::PasswordRequired)?;
            self.engine
                .decrypt(&job.input_path, &paths.decrypted, secret.expose())
                .await?;
            paths.decrypted.as_path()
        } else {
            job.input_path.as_path()
        };

        self.engine.convert(source, &paths.docx).await?;

        package_result(&paths.docx)
            .await
            .map_err(|error| ConversionError::Transient(format!("packaging failed: {:#}", error)))
    }

    /// Commits `succeeded` under the job's lease before anything reaches the
    /// user, so a job reclaimed meanwhile is never delivered twice.
    async fn finish_success(&self, job: &ConversionJob, archive: PathBuf) {
        match self.queue.complete(job, &JobOutcome::Succeeded, false).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "job lease lost before completion; discarding result");
                remove_file_if_exists(&archive).await;
                return;
            }
            Err(error) => {
                // Still running under our lease; the reaper will retry it.
                tracing::error!(job_id = %job.id, error = %error, "failed to mark job succeeded");
                remove_file_if_exists(&archive).await;
                return;
            }
        }

        tracing::info!(
            user_id = job.user_id,
            job_id = %job.id,
            attempt = job.attempts + 1,
            outcome = "succeeded",
            "conversion finished"
        );
        self.record(job, ConversionStatus::Success, None).await;

        let event = OutboundEvent::ResultReady {
            user_id: job.user_id,
            job_id: job.id.clone(),
            artifact: archive.clone(),
            caption: result_caption(&job.file_name),
        };
        if let Err(error) = self.dispatcher.emit(event).await {
            tracing::error!(job_id = %job.id, error = %error, "failed to emit result");
            remove_file_if_exists(&archive).await;
        }
        remove_file_if_exists(&job.input_path).await;
    }

    async fn finish_failure(&self, job: &ConversionJob, error: ConversionError) {
        let diagnostic = error.diagnostic();
        let attempt = job.attempts + 1;

        if !error.is_retryable() {
            let outcome = JobOutcome::FailedTerminal {
                reason: diagnostic.clone(),
            };
            match self.queue.complete(job, &outcome, false).await {
                Ok(true) => self.terminalize(job, Some(&error), &diagnostic).await,
                Ok(false) => tracing::warn!(job_id = %job.id, "job lease lost before failure"),
                Err(store_error) => {
                    tracing::error!(job_id = %job.id, error = %store_error, "failed to mark job failed")
                }
            }
            return;
        }

        match self.queue.fail_attempt(job, &diagnostic).await {
            Ok(FailureDisposition::Requeued { attempts, .. }) => {
                tracing::warn!(
                    user_id = job.user_id,
                    job_id = %job.id,
                    attempt,
                    outcome = "retry_scheduled",
                    diagnostic = %diagnostic,
                    retry_in_secs = self.queue.policy().backoff.as_secs(),
                    failed_attempts = attempts,
                    "conversion attempt failed"
                );
                self.record(job, ConversionStatus::Failed, Some(&diagnostic))
                    .await;
            }
            Ok(FailureDisposition::Terminal { .. }) => {
                self.terminalize(job, Some(&error), &diagnostic).await;
            }
            Ok(FailureDisposition::LeaseLost) => {
                tracing::warn!(job_id = %job.id, "job lease lost before retry");
            }
            Err(store_error) => {
                tracing::error!(job_id = %job.id, error = %store_error, "failed to record attempt failure")
            }
        }
    }

    /// Side effects of a job reaching `failed_terminal`. Called once per job,
    /// by whichever path won the terminal transition.
    async fn terminalize(
        &self,
        job: &ConversionJob,
        error: Option<&ConversionError>,
        diagnostic: &str,
    ) {
        tracing::error!(
            user_id = job.user_id,
            job_id = %job.id,
            attempt = job.attempts + 1,
            outcome = "failed_terminal",
            diagnostic = %diagnostic,
            "conversion failed"
        );
        self.record(job, ConversionStatus::FailedTerminal, Some(diagnostic))
            .await;

        let event = OutboundEvent::JobFailed {
            user_id: job.user_id,
            job_id: job.id.clone(),
            text: failure_text(error, &job.file_name),
        };
        if let Err(dispatch_error) = self.dispatcher.emit(event).await {
            tracing::error!(job_id = %job.id, error = %dispatch_error, "failed to emit failure message");
        }
        remove_file_if_exists(&job.input_path).await;
    }

    async fn record(&self, job: &ConversionJob, status: ConversionStatus, details: Option<&str>) {
        if let Err(error) = self
            .analytics
            .record(job.user_id, Some(&job.id), status, details)
            .await
        {
            tracing::error!(
                job_id = %job.id,
                status = status.as_str(),
                error = %error,
                "failed to record conversion outcome"
            );
        }
    }

    /// One reaper pass: reclaims jobs held past the hard limit.
    pub async fn reap_once(&self) -> usize {
        let reaped = match self.queue.reap_expired(self.settings.hard_time_limit).await {
            Ok(reaped) => reaped,
            Err(error) => {
                tracing::error!(error = %error, "queue reaper failed");
                return 0;
            }
        };

        for entry in &reaped {
            let job = &entry.job;
            let diagnostic = format!(
                "timed_out: exceeded hard time limit of {}s",
                self.settings.hard_time_limit.as_secs()
            );
            match entry.disposition {
                FailureDisposition::Requeued { attempts, .. } => {
                    tracing::warn!(
                        user_id = job.user_id,
                        job_id = %job.id,
                        failed_attempts = attempts,
                        outcome = "reclaimed",
                        "reclaimed job past hard time limit"
                    );
                    self.record(job, ConversionStatus::Failed, Some(&diagnostic))
                        .await;
                }
                FailureDisposition::Terminal { .. } => {
                    self.terminalize(job, None, &diagnostic).await;
                }
                FailureDisposition::LeaseLost => {}
            }
        }
        reaped.len()
    }
}

/// Fixed-size pool of workers pulling from the shared queue.
pub struct WorkerPool {
    worker: Arc<ConversionWorker>,
}

impl WorkerPool {
    pub fn new(worker: Arc<ConversionWorker>) -> Self {
        Self { worker }
    }

    pub fn worker(&self) -> Arc<ConversionWorker> {
        Arc::clone(&self.worker)
    }

    /// Spawns the workers and the reaper. All tasks stop once `shutdown`
    /// flips to `true` or its sender is dropped; a worker finishes its
    /// current job first.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let concurrency = self.worker.settings.concurrency.max(1);
        let mut handles = Vec::with_capacity(concurrency + 1);
        for worker_index in 0..concurrency {
            handles.push(tokio::spawn(run_worker(
                self.worker(),
                worker_index,
                shutdown.clone(),
            )));
        }
        handles.push(tokio::spawn(run_reaper(self.worker(), shutdown)));
        tracing::info!(concurrency, "conversion worker pool started");
        handles
    }
}

async fn run_worker(
    worker: Arc<ConversionWorker>,
    worker_index: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let poll_interval = worker.settings.poll_interval;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = worker.queue.dequeue(poll_interval) => next,
        };

        match next {
            Ok(job) => worker.process(job).await,
            Err(error) => {
                tracing::error!(worker_index, error = %error, "failed to dequeue job");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
    tracing::info!(worker_index, "conversion worker stopped");
}

async fn run_reaper(worker: Arc<ConversionWorker>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(worker.settings.reaper_interval);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                worker.reap_once().await;
            }
        }
    }
}
