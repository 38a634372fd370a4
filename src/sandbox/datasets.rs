//! Dataset materialization into a paper workspace.
//!
//! HuggingFace-hosted files are downloaded into `<workspace>/data/` with
//! resumable transfers: a completed file is recorded by a sha256 sidecar
//! and never re-fetched, and a partial `.part` file resumes from its
//! current length via an HTTP Range request on retry.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::dataset::DatasetDescriptor;
use crate::error::EnvironmentSetupError;

/// Materializes one dataset descriptor into `data_dir`.
///
/// Idempotent: files already recorded as complete are skipped.
pub async fn materialize(
    client: &reqwest::Client,
    descriptor: &DatasetDescriptor,
    data_dir: &Path,
) -> Result<(), EnvironmentSetupError> {
    let target_dir = data_dir.join(&descriptor.dataset_name);
    fs::create_dir_all(&target_dir)?;

    for url in &descriptor.hf_link {
        let Some(file_name) = file_name_from_url(url) else {
            return Err(EnvironmentSetupError::DatasetDownload {
                dataset: descriptor.dataset_name.clone(),
                detail: format!("cannot derive a file name from '{url}'"),
            });
        };
        let target = target_dir.join(&file_name);

        if is_complete(&target) {
            debug!("Dataset file {} already complete, skipping", file_name);
            continue;
        }

        info!(
            "Downloading {} for dataset '{}'",
            file_name, descriptor.dataset_name
        );
        download_resumable(client, url, &target)
            .await
            .map_err(|detail| EnvironmentSetupError::DatasetDownload {
                dataset: descriptor.dataset_name.clone(),
                detail,
            })?;
    }

    Ok(())
}

/// Whether a target file is fully downloaded (sidecar digest present).
pub fn is_complete(target: &Path) -> bool {
    target.exists() && sidecar_path(target).exists()
}

fn sidecar_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".sha256");
    target.with_file_name(name)
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

/// Last path segment of a URL, without query string.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query.rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Downloads `url` to `target`, resuming a partial `.part` file.
async fn download_resumable(
    client: &reqwest::Client,
    url: &str,
    target: &Path,
) -> Result<(), String> {
    let part = part_path(target);
    let resume_from = fs::metadata(&part).map(|m| m.len()).unwrap_or(0);

    let mut request = client.get(url);
    if resume_from > 0 {
        debug!("Resuming {} from byte {}", url, resume_from);
        request = request.header(RANGE, format!("bytes={resume_from}-"));
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    match response.status() {
        StatusCode::OK => {
            // Server ignored the range; restart from scratch.
            let mut file = fs::File::create(&part).map_err(|e| e.to_string())?;
            stream_to(&mut file, response).await?;
        }
        StatusCode::PARTIAL_CONTENT => {
            let mut file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&part)
                .map_err(|e| e.to_string())?;
            stream_to(&mut file, response).await?;
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            // The part file already holds the full content.
            warn!("Range past end for {}, treating partial as complete", url);
        }
        status => {
            return Err(format!("HTTP {status} fetching '{url}'"));
        }
    }

    finalize(target)
}

async fn stream_to(file: &mut fs::File, response: reqwest::Response) -> Result<(), String> {
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        file.write_all(&chunk).map_err(|e| e.to_string())?;
    }
    file.flush().map_err(|e| e.to_string())
}

/// Promotes the `.part` file and records its digest in the sidecar.
fn finalize(target: &Path) -> Result<(), String> {
    let part = part_path(target);
    fs::rename(&part, target).map_err(|e| e.to_string())?;

    let digest = sha256_of(target).map_err(|e| e.to_string())?;
    fs::write(sidecar_path(target), &digest).map_err(|e| e.to_string())?;
    debug!("Recorded digest {} for {}", digest, target.display());
    Ok(())
}

/// Hex sha256 of a file's contents.
pub fn sha256_of(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
