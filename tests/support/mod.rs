#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use doc_convert::{
    analytics::SqliteAnalytics,
    dispatch::{Dispatcher, OutboundEvent},
    entitlement::UserRecord,
    error::ConversionError,
    ledger::{UsageLedger, UserId},
    pdf::{check_pdf_header_bytes, DocumentEngine, PdfInspection},
    pipeline::{Pipeline, SubmitOutcome, SubmitRequest},
    queue::{JobQueue, RetryPolicy},
    quota::QuotaGate,
    store::Store,
    users::UserDirectory,
    worker::{ConversionWorker, WorkerSettings},
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const PLAIN_PDF: &[u8] = b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n%%EOF\n";
pub const ENCRYPTED_PDF: &[u8] = b"%PDF-1.4\ntrailer << /Root 1 0 R /Encrypt 5 0 R >>\n%%EOF\n";
pub const CORRECT_PASSWORD: &str = "open-sesame";

#[derive(Default)]
pub struct FakeUsers {
    records: Mutex<HashMap<UserId, UserRecord>>,
}

impl FakeUsers {
    pub fn set(&self, record: UserRecord) {
        self.records.lock().insert(record.user_id, record);
    }
}

#[async_trait]
impl UserDirectory for FakeUsers {
    async fn get_or_create(&self, user_id: UserId) -> anyhow::Result<UserRecord> {
        Ok(self
            .records
            .lock()
            .entry(user_id)
            .or_insert_with(|| UserRecord::free(user_id))
            .clone())
    }
}

/// Conversion engine that fails transiently a configured number of times
/// before producing a small DOCX placeholder.
#[derive(Default)]
pub struct FakeEngine {
    pub transient_failures: AtomicU32,
    pub convert_calls: AtomicU32,
    pub decrypt_calls: AtomicU32,
    pub delay: Mutex<Option<Duration>>,
}

impl FakeEngine {
    pub fn failing(times: u32) -> Self {
        Self {
            transient_failures: AtomicU32::new(times),
            ..Self::default()
        }
    }
}

#[async_trait]
impl DocumentEngine for FakeEngine {
    /// Fixtures mark password protection with an `/Encrypt` trailer entry.
    async fn inspect(&self, input: &Path) -> Result<PdfInspection, ConversionError> {
        let bytes = tokio::fs::read(input)
            .await
            .map_err(|error| ConversionError::InvalidInput(error.to_string()))?;
        check_pdf_header_bytes(&bytes)?;
        Ok(PdfInspection {
            encrypted: bytes.windows(8).any(|window| window == b"/Encrypt"),
        })
    }

    async fn decrypt(
        &self,
        input: &Path,
        output: &Path,
        password: &str,
    ) -> Result<(), ConversionError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        if password != CORRECT_PASSWORD {
            return Err(ConversionError::PasswordIncorrect);
        }
        tokio::fs::copy(input, output)
            .await
            .map_err(|error| ConversionError::Transient(error.to_string()))?;
        Ok(())
    }

    async fn convert(&self, _input: &Path, output: &Path) -> Result<(), ConversionError> {
        self.convert_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ConversionError::Transient("engine crashed".to_string()));
        }
        tokio::fs::write(output, b"PK docx placeholder")
            .await
            .map_err(|error| ConversionError::Transient(error.to_string()))
    }
}

pub struct Harness {
    pub store: Store,
    pub users: Arc<FakeUsers>,
    pub engine: Arc<FakeEngine>,
    pub analytics: SqliteAnalytics,
    pub queue: JobQueue,
    pub pipeline: Pipeline,
    pub worker: Arc<ConversionWorker>,
    pub events: mpsc::Receiver<OutboundEvent>,
    pub upload_dir: tempfile::TempDir,
    pub result_dir: tempfile::TempDir,
}

pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        concurrency: 2,
        soft_time_limit: Duration::from_secs(5),
        hard_time_limit: Duration::from_secs(10),
        poll_interval: Duration::from_millis(10),
        reaper_interval: Duration::from_millis(50),
        log_task_queue_timings: true,
    }
}

pub fn harness(engine: FakeEngine) -> Harness {
    harness_with(engine, worker_settings())
}

pub fn harness_with(engine: FakeEngine, settings: WorkerSettings) -> Harness {
    let store = Store::open_in_memory().unwrap();
    let users = Arc::new(FakeUsers::default());
    let engine = Arc::new(engine);
    let analytics = SqliteAnalytics::new(store.clone());
    let (dispatcher, events) = Dispatcher::channel(64);
    let queue = JobQueue::new(
        store.clone(),
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::ZERO,
        },
    );
    let pipeline = Pipeline::new(
        users.clone(),
        QuotaGate::new(UsageLedger::new(store.clone()), 3),
        queue.clone(),
        engine.clone(),
        dispatcher.clone(),
    );
    let result_dir = tempfile::tempdir().unwrap();
    let worker = Arc::new(ConversionWorker::new(
        queue.clone(),
        engine.clone(),
        Arc::new(analytics.clone()),
        dispatcher,
        result_dir.path().to_path_buf(),
        settings,
    ));

    Harness {
        store,
        users,
        engine,
        analytics,
        queue,
        pipeline,
        worker,
        events,
        upload_dir: tempfile::tempdir().unwrap(),
        result_dir,
    }
}

impl Harness {
    pub fn stage(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self
            .upload_dir
            .path()
            .join(format!("{}_{}", uuid::Uuid::new_v4(), name));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub async fn submit(
        &self,
        user_id: UserId,
        name: &str,
        bytes: &[u8],
        password: Option<&str>,
    ) -> SubmitOutcome {
        let artifact = self.stage(name, bytes);
        self.pipeline
            .submit(SubmitRequest {
                user_id,
                artifact,
                file_name: name.to_string(),
                password: password.map(ToString::to_string),
            })
            .await
            .unwrap()
    }

    /// Dequeues and processes one visible job. Returns false if none was
    /// visible.
    pub async fn run_one(&self) -> bool {
        match self.queue.try_dequeue().await.unwrap() {
            Some(job) => {
                self.worker.process(job).await;
                true
            }
            None => false,
        }
    }

    pub fn drain_events(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn job_id(outcome: &SubmitOutcome) -> String {
    match outcome {
        SubmitOutcome::Accepted { job_id, .. } => job_id.clone(),
        other => panic!("expected acceptance, got {:?}", other),
    }
}
