//! Download-once datasets persisted to an on-disk cache.

use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{with_failover, RetryPolicy};
use crate::error::SourceError;

/// Return the cached file at `cache_path`, or download it from the first
/// mirror in `urls` that answers and persist it for the next run.
///
/// `validate` is applied to the cached file and to every downloaded body.
/// A cached file that fails it is removed and downloaded again; a body that
/// fails it counts as a failed mirror and is never written to the cache.
/// A failed cache write is logged and otherwise ignored.
pub async fn cached_download<V>(
    client: &Client,
    cache_path: &Path,
    urls: &[String],
    policy: &RetryPolicy,
    timeout: Duration,
    validate: V,
) -> Result<String, SourceError>
where
    V: Fn(&str) -> Result<(), String>,
{
    if cache_path.exists() {
        match tokio::fs::read_to_string(cache_path).await {
            Ok(content) if content.trim().is_empty() => {
                warn!("Cached dataset {} is empty, refetching", cache_path.display())
            }
            Ok(content) => match validate(&content) {
                Ok(()) => {
                    debug!("Using cached dataset {}", cache_path.display());
                    return Ok(content);
                }
                Err(reason) => {
                    warn!("Cached dataset {} is unusable ({}), refetching", cache_path.display(), reason);
                    if let Err(e) = tokio::fs::remove_file(cache_path).await {
                        warn!("Could not remove cache {}: {}", cache_path.display(), e);
                    }
                }
            },
            Err(e) => warn!("Could not read cache {}: {}", cache_path.display(), e),
        }
    }

    let validate = &validate;
    let body = with_failover(
        urls,
        policy,
        "dataset download",
        SourceError::is_transient,
        move |url| async move {
            let body = fetch_text(client, &url, timeout).await?;
            validate(&body)
                .map_err(|reason| SourceError::Decode(format!("unusable dataset from {}: {}", url, reason)))?;
            Ok::<_, SourceError>(body)
        },
    )
    .await
    .map_err(|e| {
        e.into_last()
            .unwrap_or_else(|| SourceError::Service("no download URLs configured".to_string()))
    })?;

    if let Some(parent) = cache_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!("Could not create cache directory {}: {}", parent.display(), e);
        }
    }
    match tokio::fs::write(cache_path, &body).await {
        Ok(()) => info!("Cached dataset to {}", cache_path.display()),
        Err(e) => warn!("Could not write cache {}: {}", cache_path.display(), e),
    }

    Ok(body)
}

async fn fetch_text(client: &Client, url: &str, timeout: Duration) -> Result<String, SourceError> {
    let response = client.get(url).timeout(timeout).send().await?;
    if !response.status().is_success() {
        return Err(SourceError::Http(response.status().as_u16()));
    }
    Ok(response.text().await?)
}

/// Test helper: a local HTTP server answering every request with `body`.
///
/// Returns the URL and a counter of served requests.
#[cfg(test)]
pub(crate) async fn serve_body(body: &'static str) -> (String, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    (format!("http://{}/dataset", addr), hits)
}
