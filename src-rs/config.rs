use std::{env, path::PathBuf, time::Duration};

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
    pub result_dir: PathBuf,
    pub convex_url: String,
    pub intake_api_key: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    pub premium_upgrade_url: Option<String>,
    pub converter_bin: String,
    pub qpdf_bin: String,
    pub max_upload_bytes: usize,
    pub log_task_queue_timings: bool,
    pub pipeline: PipelineSettings,
}

/// Tunables for admission, retry and worker scheduling.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub daily_free_limit: i64,
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub artifact_retention: Duration,
    pub sweep_interval: Duration,
    pub reaper_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            daily_free_limit: 3,
            worker_concurrency: 2,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(60),
            soft_time_limit: Duration::from_secs(540),
            hard_time_limit: Duration::from_secs(600),
            artifact_retention: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            reaper_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1_000),
        }
    }
}

impl PipelineSettings {
    fn from_env() -> Self {
        let defaults = Self::default();

        let soft_time_limit = parse_secs(
            env::var("SOFT_TIME_LIMIT_SECS").ok(),
            defaults.soft_time_limit,
        );
        let mut hard_time_limit = parse_secs(
            env::var("HARD_TIME_LIMIT_SECS").ok(),
            defaults.hard_time_limit,
        );
        if hard_time_limit <= soft_time_limit {
            let raised = soft_time_limit + Duration::from_secs(60);
            tracing::warn!(
                soft_secs = soft_time_limit.as_secs(),
                hard_secs = hard_time_limit.as_secs(),
                raised_secs = raised.as_secs(),
                "HARD_TIME_LIMIT_SECS must exceed SOFT_TIME_LIMIT_SECS; raising hard limit"
            );
            hard_time_limit = raised;
        }

        let retention_days = parse_u64(env::var("ARTIFACT_RETENTION_DAYS").ok(), 7);

        Self {
            daily_free_limit: parse_u64(env::var("DAILY_FREE_LIMIT").ok(), 3) as i64,
            worker_concurrency: parse_usize(
                env::var("WORKER_CONCURRENCY").ok(),
                defaults.worker_concurrency,
            ),
            max_attempts: parse_u64(env::var("RETRY_MAX_ATTEMPTS").ok(), 3) as u32,
            retry_backoff: parse_secs(env::var("RETRY_BACKOFF_SECS").ok(), defaults.retry_backoff),
            soft_time_limit,
            hard_time_limit,
            artifact_retention: Duration::from_secs(retention_days * 24 * 60 * 60),
            sweep_interval: parse_secs(env::var("SWEEP_INTERVAL_SECS").ok(), defaults.sweep_interval),
            reaper_interval: parse_secs(
                env::var("REAPER_INTERVAL_SECS").ok(),
                defaults.reaper_interval,
            ),
            poll_interval: Duration::from_millis(parse_u64(
                env::var("QUEUE_POLL_INTERVAL_MS").ok(),
                defaults.poll_interval.as_millis() as u64,
            )),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parse_u16(env::var("PORT").ok(), 9001);

        let convex_url = env::var("CONVEX_URL")
            .map_err(|_| anyhow::anyhow!("CONVEX_URL environment variable is not set"))?;
        let convex_url = normalize_convex_url(&convex_url);

        Ok(Self {
            port,
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("storage/pipeline.db")),
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("storage/uploads")),
            result_dir: env::var("RESULT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("storage/results")),
            convex_url,
            intake_api_key: non_empty(env::var("INTAKE_API_KEY").ok()),
            telegram_bot_token: non_empty(env::var("TELEGRAM_BOT_TOKEN").ok()),
            telegram_api_base: env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            premium_upgrade_url: non_empty(env::var("PREMIUM_UPGRADE_URL").ok()),
            converter_bin: env::var("CONVERTER_BIN").unwrap_or_else(|_| "pdf2docx".to_string()),
            qpdf_bin: env::var("QPDF_BIN").unwrap_or_else(|_| "qpdf".to_string()),
            max_upload_bytes: parse_usize(env::var("MAX_UPLOAD_BYTES").ok(), 20 * 1024 * 1024),
            log_task_queue_timings: env::var("LOG_TASK_QUEUE_TIMINGS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            pipeline: PipelineSettings::from_env(),
        })
    }
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_u64(value: Option<String>, fallback: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_secs(value: Option<String>, fallback: Duration) -> Duration {
    Duration::from_secs(parse_u64(value, fallback.as_secs()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_convex_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(stripped) = trimmed.strip_prefix("wss://") {
        return format!("https://{}", stripped);
    }
    if let Some(stripped) = trimmed.strip_prefix("ws://") {
        return format!("http://{}", stripped);
    }
    trimmed.to_string()
}
