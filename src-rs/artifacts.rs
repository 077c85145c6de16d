use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::Context;
use regex::Regex;

pub fn sanitize_base_name(value: &str) -> String {
    static NON_SAFE_RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]+").expect("valid regex"));
    static EDGE_UNDERSCORE_RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^_+|_+$").expect("valid regex"));

    let stem = Path::new(value)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let replaced = NON_SAFE_RE.replace_all(&stem, "_");
    let trimmed = EDGE_UNDERSCORE_RE.replace_all(&replaced, "");
    let output = trimmed.to_string();
    if output.is_empty() {
        "document".to_string()
    } else {
        output.chars().take(80).collect()
    }
}

pub async fn remove_file_if_exists(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != io::ErrorKind::NotFound {
            tracing::error!(path = %path.display(), error = %error, "failed to delete artifact");
        }
    }
}

/// Wraps `source` into a single deflate-compressed zip next to it and
/// returns the archive path (`<source>.zip`).
pub async fn package_result(source: &Path) -> anyhow::Result<PathBuf> {
    let source = source.to_path_buf();
    let mut archive_name = source.as_os_str().to_owned();
    archive_name.push(".zip");
    let archive = PathBuf::from(archive_name);

    let target = archive.clone();
    tokio::task::spawn_blocking(move || write_zip(&source, &target))
        .await
        .context("packaging task panicked")??;

    Ok(archive)
}

fn write_zip(source: &Path, archive: &Path) -> anyhow::Result<()> {
    let entry_name = source
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "result.docx".to_string());

    let file = std::fs::File::create(archive)
        .with_context(|| format!("failed to create {}", archive.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer
        .start_file(entry_name, options)
        .context("failed to start zip entry")?;
    let mut input = std::fs::File::open(source)
        .with_context(|| format!("failed to open {}", source.display()))?;
    io::copy(&mut input, &mut writer).context("failed to write zip entry")?;
    writer.finish().context("failed to finalize zip archive")?;
    Ok(())
}

/// Deletes regular files in `dir` whose modification time is older than
/// `retention`. Returns how many files were removed.
///
/// Only age is consulted: retention must stay far above the longest time a
/// live job can hold an artifact (hard limit plus every retry backoff).
pub async fn sweep_expired(dir: &Path, retention: Duration) -> io::Result<usize> {
    let threshold = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(error) => return Err(error),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                tracing::warn!(path = %entry.path().display(), error = %error, "failed to stat artifact");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if modified >= threshold {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                tracing::info!(path = %path.display(), "deleted expired artifact");
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::error!(path = %path.display(), error = %error, "failed to delete expired artifact");
            }
        }
    }

    Ok(removed)
}

pub async fn run_artifact_sweeper(dirs: Vec<PathBuf>, retention: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for dir in &dirs {
            match sweep_expired(dir, retention).await {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::info!(dir = %dir.display(), removed, "artifact sweep finished")
                }
                Err(error) => {
                    tracing::error!(dir = %dir.display(), error = %error, "artifact sweep failed")
                }
            }
        }
    }
}
