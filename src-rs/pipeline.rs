use std::{io, path::PathBuf, sync::Arc};

use chrono::Utc;
use serde::Serialize;

use crate::{
    artifacts::remove_file_if_exists,
    dispatch::{Dispatcher, OutboundEvent},
    entitlement::Tier,
    error::{ConversionError, PipelineError},
    ledger::UserId,
    pdf::DocumentEngine,
    queue::{DecryptionSecret, JobQueue, NewJob},
    quota::{Admission, QuotaGate},
    users::UserDirectory,
};

/// A staged upload handed over by the intake surface. The pipeline owns
/// `artifact` from here on: rejected submissions delete it.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub user_id: UserId,
    pub artifact: PathBuf,
    pub file_name: String,
    pub password: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DailyLimitExceeded,
    RequiresPassword,
    InvalidFormat,
    PremiumRequired,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::DailyLimitExceeded => "daily_limit_exceeded",
            RejectReason::RequiresPassword => "requires_password",
            RejectReason::InvalidFormat => "invalid_format",
            RejectReason::PremiumRequired => "premium_required",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { job_id: String, tier: Tier },
    Rejected(RejectReason),
}

#[derive(Clone)]
pub struct Pipeline {
    users: Arc<dyn UserDirectory>,
    gate: QuotaGate,
    queue: JobQueue,
    engine: Arc<dyn DocumentEngine>,
    dispatcher: Dispatcher,
}

impl Pipeline {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        gate: QuotaGate,
        queue: JobQueue,
        engine: Arc<dyn DocumentEngine>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            users,
            gate,
            queue,
            engine,
            dispatcher,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Single entry point for new conversions.
    ///
    /// Admission runs first, then the artifact is validated, and only a
    /// submission that passes both is charged (once) and enqueued, in a
    /// single transaction. Any storage failure aborts the submission without
    /// charging or admitting it.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, PipelineError> {
        let outcome = self.admit_and_enqueue(&request).await;
        match &outcome {
            Ok(SubmitOutcome::Accepted { job_id, tier }) => {
                tracing::info!(
                    user_id = request.user_id,
                    job_id = %job_id,
                    tier = tier.as_str(),
                    "submission accepted"
                );
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                tracing::info!(
                    user_id = request.user_id,
                    reason = reason.as_str(),
                    "submission rejected"
                );
                remove_file_if_exists(&request.artifact).await;
            }
            Err(error) => {
                tracing::error!(user_id = request.user_id, error = %error, "submission failed");
                remove_file_if_exists(&request.artifact).await;
            }
        }
        outcome
    }

    async fn admit_and_enqueue(
        &self,
        request: &SubmitRequest,
    ) -> Result<SubmitOutcome, PipelineError> {
        let now = Utc::now();
        let user = self
            .users
            .get_or_create(request.user_id)
            .await
            .map_err(PipelineError::UserLookup)?;

        let tier = match self
            .gate
            .admit(&user, now)
            .await
            .map_err(PipelineError::Ledger)?
        {
            Admission::Admitted { tier } => tier,
            Admission::Rejected { notify, .. } => {
                if notify {
                    self.emit_limit_reached(request.user_id).await;
                }
                return Ok(SubmitOutcome::Rejected(RejectReason::DailyLimitExceeded));
            }
        };

        if !request.file_name.to_ascii_lowercase().ends_with(".pdf") {
            return Ok(SubmitOutcome::Rejected(RejectReason::InvalidFormat));
        }

        let inspection = match self.engine.inspect(&request.artifact).await {
            Ok(inspection) => inspection,
            Err(ConversionError::InvalidInput(detail)) => {
                tracing::debug!(user_id = request.user_id, detail = %detail, "artifact failed validation");
                return Ok(SubmitOutcome::Rejected(RejectReason::InvalidFormat));
            }
            Err(other) => {
                return Err(PipelineError::Artifact(io::Error::other(other.to_string())));
            }
        };

        let secret = if inspection.encrypted {
            let Some(password) = request.password.as_deref().filter(|value| !value.is_empty())
            else {
                return Ok(SubmitOutcome::Rejected(RejectReason::RequiresPassword));
            };
            if !tier.is_unlimited() {
                return Ok(SubmitOutcome::Rejected(RejectReason::PremiumRequired));
            }
            Some(DecryptionSecret::new(password))
        } else {
            None
        };

        let job = NewJob {
            user_id: request.user_id,
            input_path: request.artifact.clone(),
            file_name: request.file_name.clone(),
            secret,
        };
        let charge = self.gate.charge_for(&user, now);
        match self
            .queue
            .enqueue_charged(job, charge)
            .await
            .map_err(PipelineError::Queue)?
        {
            Some(job) => Ok(SubmitOutcome::Accepted {
                job_id: job.id,
                tier,
            }),
            // A concurrent submission took the last slot after admission.
            None => {
                let notify = self
                    .gate
                    .record_rejection(request.user_id, now)
                    .await
                    .map_err(PipelineError::Ledger)?;
                if notify {
                    self.emit_limit_reached(request.user_id).await;
                }
                Ok(SubmitOutcome::Rejected(RejectReason::DailyLimitExceeded))
            }
        }
    }

    async fn emit_limit_reached(&self, user_id: UserId) {
        let event = OutboundEvent::LimitReached {
            user_id,
            daily_limit: self.gate.daily_limit(),
        };
        if let Err(error) = self.dispatcher.emit(event).await {
            tracing::error!(user_id, error = %error, "failed to emit limit notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        entitlement::UserRecord,
        ledger::UsageLedger,
        pdf::{check_pdf_header_bytes, PdfInspection},
        queue::RetryPolicy,
        store::Store,
    };

    /// Treats an `/Encrypt` marker in the fixture bytes as password
    /// protection.
    struct MarkerEngine;

    #[async_trait]
    impl DocumentEngine for MarkerEngine {
        async fn inspect(&self, input: &std::path::Path) -> Result<PdfInspection, ConversionError> {
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
            _input: &std::path::Path,
            _output: &std::path::Path,
            _password: &str,
        ) -> Result<(), ConversionError> {
            Ok(())
        }

        async fn convert(
            &self,
            _input: &std::path::Path,
            _output: &std::path::Path,
        ) -> Result<(), ConversionError> {
            Ok(())
        }
    }

    struct StaticUsers(UserRecord);

    #[async_trait]
    impl UserDirectory for StaticUsers {
        async fn get_or_create(&self, user_id: UserId) -> anyhow::Result<UserRecord> {
            Ok(UserRecord {
                user_id,
                ..self.0.clone()
            })
        }
    }

    struct Harness {
        store: Store,
        pipeline: Pipeline,
        events: tokio::sync::mpsc::Receiver<OutboundEvent>,
        dir: tempfile::TempDir,
    }

    fn harness(user: UserRecord) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let (dispatcher, events) = Dispatcher::channel(16);
        let pipeline = Pipeline::new(
            Arc::new(StaticUsers(user)),
            QuotaGate::new(UsageLedger::new(store.clone()), 3),
            JobQueue::new(
                store.clone(),
                RetryPolicy {
                    max_attempts: 3,
                    backoff: std::time::Duration::from_secs(60),
                },
            ),
            Arc::new(MarkerEngine),
            dispatcher,
        );
        Harness {
            store,
            pipeline,
            events,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn stage(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn request(artifact: PathBuf, file_name: &str, password: Option<&str>) -> SubmitRequest {
        SubmitRequest {
            user_id: 42,
            artifact,
            file_name: file_name.to_string(),
            password: password.map(ToString::to_string),
        }
    }

    const PLAIN_PDF: &[u8] = b"%PDF-1.7\n%%EOF\n";
    const ENCRYPTED_PDF: &[u8] = b"%PDF-1.4\ntrailer << /Encrypt 3 0 R >>\n%%EOF\n";

    #[tokio::test]
    async fn non_pdf_name_is_rejected_and_staged_file_removed() {
        let h = harness(UserRecord::free(42));
        let artifact = stage(&h.dir, "a.docx", PLAIN_PDF);
        let outcome = h
            .pipeline
            .submit(request(artifact.clone(), "a.docx", None))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected(RejectReason::InvalidFormat));
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn bytes_without_pdf_header_are_invalid_format_and_not_charged() {
        let h = harness(UserRecord::free(42));
        let artifact = stage(&h.dir, "fake.pdf", b"hello");
        let outcome = h
            .pipeline
            .submit(request(artifact, "fake.pdf", None))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected(RejectReason::InvalidFormat));

        let counter = h
            .pipeline
            .gate
            .ledger()
            .get_or_create(42, crate::ledger::usage_day(Utc::now()))
            .await
            .unwrap();
        assert_eq!(counter.conversion_count, 0);
    }

    #[tokio::test]
    async fn encrypted_without_password_requires_password() {
        let h = harness(UserRecord {
            is_premium: true,
            ..UserRecord::free(42)
        });
        let artifact = stage(&h.dir, "locked.pdf", ENCRYPTED_PDF);
        let outcome = h
            .pipeline
            .submit(request(artifact, "locked.pdf", None))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected(RejectReason::RequiresPassword));
        assert_eq!(h.pipeline.queue().depth().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn encrypted_input_from_free_user_requires_premium() {
        let h = harness(UserRecord::free(42));
        let artifact = stage(&h.dir, "locked.pdf", ENCRYPTED_PDF);
        let outcome = h
            .pipeline
            .submit(request(artifact, "locked.pdf", Some("secret")))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected(RejectReason::PremiumRequired));
    }

    #[tokio::test]
    async fn accepted_submission_is_charged_once_and_enqueued() {
        let mut h = harness(UserRecord {
            is_premium: true,
            ..UserRecord::free(42)
        });
        let artifact = stage(&h.dir, "locked.pdf", ENCRYPTED_PDF);
        let outcome = h
            .pipeline
            .submit(request(artifact.clone(), "locked.pdf", Some("secret")))
            .await
            .unwrap();
        let SubmitOutcome::Accepted { job_id, tier } = outcome else {
            panic!("expected acceptance, got {:?}", outcome);
        };
        assert_eq!(tier, Tier::Premium);
        assert!(artifact.exists());

        let job = h.pipeline.queue().get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.user_id, 42);
        assert_eq!(job.secret.as_ref().map(|s| s.expose()), Some("secret"));
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn password_for_plain_pdf_is_not_stored() {
        let h = harness(UserRecord::free(42));
        let artifact = stage(&h.dir, "plain.pdf", PLAIN_PDF);
        let SubmitOutcome::Accepted { job_id, .. } = h
            .pipeline
            .submit(request(artifact, "plain.pdf", Some("unused")))
            .await
            .unwrap()
        else {
            panic!("expected acceptance");
        };
        let job = h.pipeline.queue().get(&job_id).await.unwrap().unwrap();
        assert!(job.secret.is_none());
    }

    #[tokio::test]
    async fn queue_failure_fails_closed_without_charging() {
        let h = harness(UserRecord::free(42));
        h.store
            .call(|conn| conn.execute_batch("DROP TABLE jobs"))
            .await
            .unwrap();
        let artifact = stage(&h.dir, "plain.pdf", PLAIN_PDF);

        let result = h
            .pipeline
            .submit(request(artifact.clone(), "plain.pdf", None))
            .await;
        assert!(matches!(result, Err(PipelineError::Queue(_))));
        assert!(!artifact.exists());

        let counter = h
            .pipeline
            .gate
            .ledger()
            .get_or_create(42, crate::ledger::usage_day(Utc::now()))
            .await
            .unwrap();
        assert_eq!(counter.conversion_count, 0);
    }
}
