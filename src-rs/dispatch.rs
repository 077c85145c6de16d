use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{artifacts::remove_file_if_exists, ledger::UserId};

/// Delivery requests emitted by the pipeline. The pipeline never talks to
/// the chat channel directly; an adapter task drains these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    LimitReached {
        user_id: UserId,
        daily_limit: i64,
    },
    ResultReady {
        user_id: UserId,
        job_id: String,
        artifact: PathBuf,
        caption: String,
    },
    JobFailed {
        user_id: UserId,
        job_id: String,
        text: String,
    },
}

impl OutboundEvent {
    pub fn user_id(&self) -> UserId {
        match self {
            OutboundEvent::LimitReached { user_id, .. }
            | OutboundEvent::ResultReady { user_id, .. }
            | OutboundEvent::JobFailed { user_id, .. } => *user_id,
        }
    }
}

#[derive(Debug, Error)]
#[error("outbound channel is closed")]
pub struct DispatchClosed;

#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<OutboundEvent>,
}

impl Dispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: OutboundEvent) -> Result<(), DispatchClosed> {
        self.tx.send(event).await.map_err(|_| DispatchClosed)
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn deliver_text(&self, user_id: UserId, text: &str) -> anyhow::Result<()>;
    async fn deliver_file(&self, user_id: UserId, artifact: &Path, caption: &str)
        -> anyhow::Result<()>;
}

/// Adapter used when no chat channel is configured.
pub struct LogChannel;

#[async_trait]
impl ChannelAdapter for LogChannel {
    async fn deliver_text(&self, user_id: UserId, text: &str) -> anyhow::Result<()> {
        tracing::info!(user_id, text, "outbound text (no channel configured)");
        Ok(())
    }

    async fn deliver_file(
        &self,
        user_id: UserId,
        artifact: &Path,
        caption: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(
            user_id,
            artifact = %artifact.display(),
            caption,
            "outbound file (no channel configured)"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct TelegramChannel {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl TelegramChannel {
    pub fn new(api_base: String, token: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to create Telegram HTTP client")?;
        Ok(Self {
            http,
            api_base,
            token,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.token,
            method
        )
    }

    async fn check_response(method: &str, response: reqwest::Response) -> anyhow::Result<()> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("failed to parse Telegram {} response", method))?;
        if status.is_success() && body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Err(anyhow!(
            "Telegram {} failed with status {}: {}",
            method,
            status,
            description
        ))
    }
}

#[async_trait]
impl ChannelAdapter for TelegramChannel {
    async fn deliver_text(&self, user_id: UserId, text: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": user_id, "text": text }))
            .send()
            .await
            .context("Telegram sendMessage request failed")?;
        Self::check_response("sendMessage", response).await
    }

    async fn deliver_file(
        &self,
        user_id: UserId,
        artifact: &Path,
        caption: &str,
    ) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(artifact)
            .await
            .with_context(|| format!("failed to read {}", artifact.display()))?;
        let file_name = artifact
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_else(|| "result.zip".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/zip")?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", user_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        let response = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .context("Telegram sendDocument request failed")?;
        Self::check_response("sendDocument", response).await
    }
}

pub fn limit_reached_text(daily_limit: i64, upgrade_url: Option<&str>) -> String {
    let mut text = format!(
        "You've used all {} free conversions today. Premium removes the daily limit and unlocks encrypted PDF conversion.",
        daily_limit
    );
    if let Some(url) = upgrade_url {
        text.push_str(&format!("\nUpgrade now: {}", url));
    }
    text.push_str("\nOr start a 1-day Premium trial with /trial.");
    text
}

/// Drains outbound events into a channel adapter. Runs independently of the
/// worker pool and exits once every [`Dispatcher`] clone is dropped.
pub struct ChannelRunner {
    pub adapter: Arc<dyn ChannelAdapter>,
    pub upgrade_url: Option<String>,
    pub delivery_attempts: u32,
    pub retry_delay: Duration,
}

impl ChannelRunner {
    pub fn new(adapter: Arc<dyn ChannelAdapter>, upgrade_url: Option<String>) -> Self {
        Self {
            adapter,
            upgrade_url,
            delivery_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<OutboundEvent>) {
        while let Some(event) = rx.recv().await {
            self.deliver(event).await;
        }
        tracing::info!("outbound channel closed; channel adapter stopping");
    }

    async fn deliver(&self, event: OutboundEvent) {
        let user_id = event.user_id();
        match event {
            OutboundEvent::LimitReached { daily_limit, .. } => {
                let text = limit_reached_text(daily_limit, self.upgrade_url.as_deref());
                if let Err(error) = self
                    .with_retry(|| self.adapter.deliver_text(user_id, &text))
                    .await
                {
                    tracing::error!(user_id, error = %error, "failed to deliver limit notification");
                }
            }
            OutboundEvent::JobFailed { job_id, text, .. } => {
                if let Err(error) = self
                    .with_retry(|| self.adapter.deliver_text(user_id, &text))
                    .await
                {
                    tracing::error!(user_id, job_id = %job_id, error = %error, "failed to deliver failure message");
                }
            }
            OutboundEvent::ResultReady {
                job_id,
                artifact,
                caption,
                ..
            } => {
                match self
                    .with_retry(|| self.adapter.deliver_file(user_id, &artifact, &caption))
                    .await
                {
                    Ok(()) => tracing::info!(user_id, job_id = %job_id, "result delivered"),
                    Err(error) => {
                        tracing::error!(user_id, job_id = %job_id, error = %error, "failed to deliver result")
                    }
                }
                remove_file_if_exists(&artifact).await;
            }
        }
    }

    async fn with_retry<F, Fut>(&self, mut send: F) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let attempts = self.delivery_attempts.max(1);
        let mut attempt = 1;
        loop {
            match send().await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < attempts => {
                    tracing::warn!(attempt, error = %error, "delivery attempt failed; retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
