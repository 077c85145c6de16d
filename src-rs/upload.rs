use std::path::{Path, PathBuf};

use axum::extract::{multipart::Field, Multipart};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{
    artifacts::{remove_file_if_exists, sanitize_base_name},
    ledger::UserId,
};

/// Multipart submission after the file part has been staged to disk.
#[derive(Debug, Clone)]
pub struct StagedSubmission {
    pub user_id: UserId,
    pub staged_path: PathBuf,
    pub original_name: String,
    pub password: Option<String>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("File not found")]
    MissingFile,
    #[error("user_id is required")]
    MissingUserId,
    #[error("user_id must be an integer")]
    InvalidUserId,
    #[error("File is too large")]
    FileTooLarge,
    #[error("Failed to parse upload")]
    MultipartError,
    #[error("Failed to persist upload")]
    IoError,
}

fn staged_file_name(user_id: UserId, original_name: &str) -> String {
    format!(
        "{}_{}_{}.pdf",
        user_id,
        Uuid::new_v4(),
        sanitize_base_name(original_name)
    )
}

/// Where the file part streams to before the owning user is known.
fn incoming_file_name() -> String {
    format!("incoming_{}.part", Uuid::new_v4())
}

async fn write_field_to(
    mut field: Field<'_>,
    path: &Path,
    max_size_bytes: usize,
) -> Result<(), UploadError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|_| UploadError::IoError)?;

    let mut total_size = 0usize;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|_| UploadError::MultipartError)?
    {
        total_size += chunk.len();
        if total_size > max_size_bytes {
            return Err(UploadError::FileTooLarge);
        }
        file.write_all(&chunk)
            .await
            .map_err(|_| UploadError::IoError)?;
    }

    file.flush().await.map_err(|_| UploadError::IoError)
}

/// Reads `file`, `user_id` and optional `password` parts in any order. The
/// file streams into `upload_dir` under a temporary name and is renamed to
/// `<user>_<uuid>_<name>.pdf` once the submission is complete. Staged bytes
/// are removed on any error.
pub async fn stage_submission(
    mut multipart: Multipart,
    upload_dir: &Path,
    max_size_bytes: usize,
) -> Result<StagedSubmission, UploadError> {
    let mut incoming: Option<(PathBuf, String)> = None;
    let mut user_id: Option<String> = None;
    let mut password: Option<String> = None;

    let result = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|_| UploadError::MultipartError)?
        {
            match field.name() {
                Some("file") => {
                    if incoming.is_some() {
                        continue;
                    }
                    let original_name = field
                        .file_name()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "document.pdf".to_string());
                    let path = upload_dir.join(incoming_file_name());
                    incoming = Some((path.clone(), original_name));
                    write_field_to(field, &path, max_size_bytes).await?;
                }
                Some("user_id") => {
                    user_id = Some(field.text().await.map_err(|_| UploadError::MultipartError)?);
                }
                Some("password") => {
                    let value = field.text().await.map_err(|_| UploadError::MultipartError)?;
                    if !value.is_empty() {
                        password = Some(value);
                    }
                }
                _ => {}
            }
        }

        let user_id = user_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(UploadError::MissingUserId)?
            .parse::<UserId>()
            .map_err(|_| UploadError::InvalidUserId)?;
        let (incoming_path, original_name) = incoming.clone().ok_or(UploadError::MissingFile)?;

        let staged_path = upload_dir.join(staged_file_name(user_id, &original_name));
        tokio::fs::rename(&incoming_path, &staged_path)
            .await
            .map_err(|_| UploadError::IoError)?;

        Ok::<_, UploadError>(StagedSubmission {
            user_id,
            staged_path,
            original_name,
            password: password.clone(),
        })
    }
    .await;

    if result.is_err() {
        if let Some((path, _)) = &incoming {
            remove_file_if_exists(path).await;
        }
    }
    result
}
