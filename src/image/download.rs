use log::{debug, info};
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

const CONNECT_TIMEOUT: u64 = 30;
const PROGRESS_STEP: u64 = 64 * 1024 * 1024;

/// Copy the image behind `source` (http, https or file URL) into `dest`.
/// Returns the number of bytes written. A transfer shorter than the
/// advertised length is an error.
pub async fn fetch(source: &str, dest: &Path) -> Result<u64, String> {
    let url = Url::parse(source).map_err(|e| format!("invalid URL: {}", e))?;

    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| format!("{} is not a local path", url))?;
            debug!("Copying local image {:?} to {:?}", path, dest);
            tokio::fs::copy(&path, dest)
                .await
                .map_err(|e| format!("cannot copy {}: {}", path.display(), e))
        }
        "http" | "https" => download(url, dest).await,
        other => Err(format!("unsupported URL scheme '{}'", other)),
    }
}

async fn download(url: Url, dest: &Path) -> Result<u64, String> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| format!("cannot build HTTP client: {}", e))?;

    let mut response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| format!("request failed: {}", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("server answered {}", status));
    }

    let expected = response.content_length();
    match expected {
        Some(len) => info!("Downloading {} ({:.1} MiB)", url, len as f64 / 1024.0 / 1024.0),
        None => info!("Downloading {} (size unknown)", url),
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| format!("cannot create {}: {}", dest.display(), e))?;

    let mut written: u64 = 0;
    let mut next_report = PROGRESS_STEP;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| format!("transfer interrupted after {} bytes: {}", written, e))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("cannot write {}: {}", dest.display(), e))?;
        written += chunk.len() as u64;

        if written >= next_report {
            info!("... {} MiB received", written / 1024 / 1024);
            next_report += PROGRESS_STEP;
        }
    }

    file.flush()
        .await
        .and(file.sync_all().await)
        .map_err(|e| format!("cannot flush {}: {}", dest.display(), e))?;

    if let Some(expected) = expected {
        if written != expected {
            return Err(format!(
                "incomplete transfer: received {} of {} bytes",
                written, expected
            ));
        }
    }

    Ok(written)
}
