use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
    time::timeout,
};

use crate::{artifacts::remove_file_if_exists, error::ConversionError};

/// Header checks look this far into the file; PDF readers accept leading junk.
const HEADER_WINDOW: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdfInspection {
    /// Opening the document needs a password.
    pub encrypted: bool,
}

/// Rejects staged files that are not PDFs at all, before any tool runs.
pub async fn check_pdf_header(path: &Path) -> Result<(), ConversionError> {
    let file = tokio::fs::File::open(path).await.map_err(|error| {
        if error.kind() == io::ErrorKind::NotFound {
            ConversionError::InvalidInput("staged document is missing".to_string())
        } else {
            ConversionError::Transient(format!("failed to read staged document: {}", error))
        }
    })?;

    let mut header = Vec::with_capacity(HEADER_WINDOW as usize);
    file.take(HEADER_WINDOW)
        .read_to_end(&mut header)
        .await
        .map_err(|error| {
            ConversionError::Transient(format!("failed to read staged document: {}", error))
        })?;
    check_pdf_header_bytes(&header)
}

pub fn check_pdf_header_bytes(bytes: &[u8]) -> Result<(), ConversionError> {
    if bytes.is_empty() {
        return Err(ConversionError::InvalidInput("document is empty".to_string()));
    }
    let window = &bytes[..bytes.len().min(HEADER_WINDOW as usize)];
    if !window.windows(5).any(|candidate| candidate == b"%PDF-") {
        return Err(ConversionError::InvalidInput(
            "document does not carry a PDF header".to_string(),
        ));
    }
    Ok(())
}

/// External operations a worker needs to turn a staged PDF into a DOCX.
#[async_trait]
pub trait DocumentEngine: Send + Sync {
    /// Checks that `input` is a readable PDF and whether it needs a
    /// password. Unreadable documents are `InvalidInput`.
    async fn inspect(&self, input: &Path) -> Result<PdfInspection, ConversionError>;

    /// Writes a decrypted copy of `input` to `output`.
    async fn decrypt(
        &self,
        input: &Path,
        output: &Path,
        password: &str,
    ) -> Result<(), ConversionError>;

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConversionError>;
}

/// Engine backed by the `qpdf` and `pdf2docx` command line tools.
#[derive(Clone, Debug)]
pub struct CommandEngine {
    pub converter_bin: String,
    pub qpdf_bin: String,
    pub command_timeout: Duration,
}

#[derive(Debug)]
pub enum CommandFailure {
    NotFound(String),
    Spawn(io::Error),
    TimedOut(Duration),
    Exited { code: Option<i32>, reason: String },
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandFailure::NotFound(program) => write!(f, "{} not found", program),
            CommandFailure::Spawn(error) => write!(f, "failed to execute: {}", error),
            CommandFailure::TimedOut(limit) => {
                write!(f, "timed out after {} ms", limit.as_millis())
            }
            CommandFailure::Exited { reason, .. } => f.write_str(reason),
        }
    }
}

pub async fn run_command(
    program: &str,
    args: &[String],
    limit: Duration,
) -> Result<(String, String, Option<i32>), CommandFailure> {
    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| {
            if error.kind() == io::ErrorKind::NotFound {
                return CommandFailure::NotFound(program.to_string());
            }
            CommandFailure::Spawn(error)
        })?;
    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| CommandFailure::TimedOut(limit))?
        .map_err(CommandFailure::Spawn)?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code();

    if !output.status.success() {
        let message = stderr.trim();
        let fallback = stdout.trim();
        let reason = if message.is_empty() {
            if fallback.is_empty() {
                format!("{} failed with status {}", program, output.status)
            } else {
                fallback.to_string()
            }
        } else {
            message.to_string()
        };

        return Err(CommandFailure::Exited { code, reason });
    }

    Ok((stdout, stderr, code))
}

/// qpdf exits with 3 when it succeeded with warnings.
const QPDF_EXIT_WARNINGS: i32 = 3;

fn classify_qpdf_failure(failure: CommandFailure) -> Result<(), ConversionError> {
    match failure {
        CommandFailure::Exited {
            code: Some(QPDF_EXIT_WARNINGS),
            ..
        } => Ok(()),
        CommandFailure::Exited { reason, .. } => {
            if reason.to_ascii_lowercase().contains("invalid password") {
                Err(ConversionError::PasswordIncorrect)
            } else {
                Err(ConversionError::InvalidInput(format!(
                    "qpdf could not read the document: {}",
                    reason
                )))
            }
        }
        other => Err(ConversionError::Transient(format!("qpdf {}", other))),
    }
}

/// Writes `secret` to a file only the service user can read.
async fn write_secret_file(path: &Path, secret: &str) -> io::Result<()> {
    remove_file_if_exists(path).await;
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(secret.as_bytes()).await?;
    file.flush().await
}

#[async_trait]
impl DocumentEngine for CommandEngine {
    async fn inspect(&self, input: &Path) -> Result<PdfInspection, ConversionError> {
        check_pdf_header(input).await?;
        let path = input.to_string_lossy().to_string();

        // Exit 0 means a password is needed to open the file; any other exit
        // leaves the verdict to the structural check below.
        let requires_password = vec!["--requires-password".to_string(), path.clone()];
        match run_command(&self.qpdf_bin, &requires_password, self.command_timeout).await {
            Ok(_) => return Ok(PdfInspection { encrypted: true }),
            Err(CommandFailure::Exited { .. }) => {}
            Err(other) => return Err(ConversionError::Transient(format!("qpdf {}", other))),
        }

        let check = vec!["--check".to_string(), path];
        match run_command(&self.qpdf_bin, &check, self.command_timeout).await {
            Ok(_) => {}
            Err(failure) => classify_qpdf_failure(failure)?,
        }
        Ok(PdfInspection { encrypted: false })
    }

    async fn decrypt(
        &self,
        input: &Path,
        output: &Path,
        password: &str,
    ) -> Result<(), ConversionError> {
        let password_file = with_extension(output, "key");
        write_secret_file(&password_file, password)
            .await
            .map_err(|error| {
                ConversionError::Transient(format!("failed to stage password: {}", error))
            })?;

        let args = vec![
            format!("--password-file={}", password_file.to_string_lossy()),
            "--decrypt".to_string(),
            input.to_string_lossy().to_string(),
            output.to_string_lossy().to_string(),
        ];
        let result = run_command(&self.qpdf_bin, &args, self.command_timeout).await;
        remove_file_if_exists(&password_file).await;

        match result {
            Ok(_) => Ok(()),
            Err(failure) => classify_qpdf_failure(failure),
        }
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        let args = vec![
            "convert".to_string(),
            input.to_string_lossy().to_string(),
            output.to_string_lossy().to_string(),
        ];

        run_command(&self.converter_bin, &args, self.command_timeout)
            .await
            .map_err(|failure| {
                ConversionError::Transient(format!("{} {}", self.converter_bin, failure))
            })?;

        match tokio::fs::metadata(output).await {
            Ok(metadata) if metadata.len() > 0 => Ok(()),
            Ok(_) => Err(ConversionError::Transient(
                "converter produced an empty document".to_string(),
            )),
            Err(error) => Err(ConversionError::Transient(format!(
                "converter produced no output: {}",
                error
            ))),
        }
    }
}

pub fn with_extension(path: &Path, extension: &str) -> PathBuf {
    let mut path = path.to_path_buf();
    path.set_extension(extension);
    path
}
