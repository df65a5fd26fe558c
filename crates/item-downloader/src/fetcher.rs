//! # Streaming fetcher
//!
//! Performs a single HTTP transfer in-process, streaming the response body into
//! a local file in fixed-size chunks. Progress and the terminal outcome are
//! pushed to a callback; the caller never polls.
//!
//! Exactly one terminal event ([`FetchEvent::Completed`] or
//! [`FetchEvent::Failed`]) is delivered per fetch, unless the fetch is
//! cancelled through its [`FetchHandle`], in which case the request is aborted,
//! the file is closed and no further events are delivered.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use futures::TryStreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT_ENCODING, HeaderValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FetcherConfig;
use crate::fs;
use crate::model::percent_of;
use crate::{Error, Result};

/// Events delivered by a running fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Sent after every chunk written.
    Progress {
        bytes_written: u64,
        /// 0 when the total length is unknown.
        percent: u8,
        /// 0 when the server did not announce a length.
        total: u64,
    },
    /// The body was fully written.
    Completed { bytes_written: u64 },
    /// The transfer failed.
    Failed { message: String },
}

impl FetchEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Callback receiving fetch events. Invoked from the fetch task.
pub type FetchCallback = Arc<dyn Fn(FetchEvent) + Send + Sync>;

/// Handle to a running fetch.
#[derive(Debug, Clone)]
pub struct FetchHandle {
    id: i64,
    token: CancellationToken,
}

impl FetchHandle {
    /// Opaque, non-null identifier of this fetch.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Abort the request and close the output file. No further events follow.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// In-process HTTP fetcher writing straight to disk.
pub struct StreamingFetcher {
    client: Client,
    config: FetcherConfig,
    next_id: AtomicI64,
}

impl StreamingFetcher {
    /// Create a new fetcher with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(FetcherConfig::default())
    }

    /// Create a new fetcher with custom configuration.
    pub fn with_config(config: FetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            config,
            next_id: AtomicI64::new(1),
        })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Start fetching `url` into `destination`.
    ///
    /// Returns immediately; the transfer runs on a spawned task. The callback is
    /// never invoked before this function returns.
    pub fn fetch(&self, url: &str, destination: &Path, callback: FetchCallback) -> FetchHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let handle = FetchHandle {
            id,
            token: token.clone(),
        };

        let client = self.client.clone();
        let url = url.to_string();
        let destination = destination.to_path_buf();
        let chunk_size = self.config.chunk_size.max(1);

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    debug!(fetch_id = id, url = %url, "Fetch cancelled");
                    return;
                }
                res = stream_to_file(&client, &url, &destination, chunk_size, &callback) => res,
            };

            if token.is_cancelled() {
                return;
            }

            match outcome {
                Ok(bytes_written) => {
                    info!(fetch_id = id, url = %url, bytes = bytes_written, "Fetch completed");
                    callback(FetchEvent::Completed { bytes_written });
                }
                Err(e) => {
                    warn!(fetch_id = id, url = %url, error = %e, "Fetch failed");
                    callback(FetchEvent::Failed {
                        message: e.to_string(),
                    });
                }
            }
        });

        handle
    }
}

async fn stream_to_file(
    client: &Client,
    url: &str,
    destination: &Path,
    chunk_size: usize,
    callback: &FetchCallback,
) -> Result<u64> {
    fs::ensure_parent_dir_with_op("creating output directory", destination).await?;
    let mut file = tokio::fs::File::create(destination)
        .await
        .map_err(|e| Error::io_path("creating output file", destination, e))?;

    debug!(url = %url, path = %destination.display(), "Sending fetch request");
    let response = client
        .get(url)
        .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"))
        .send()
        .await?;

    // A non-success response has no usable body.
    if !response.status().is_success() {
        return Err(Error::TransferFailed(format!(
            "empty response body (HTTP {})",
            response.status()
        )));
    }

    let total = response.content_length().unwrap_or(0);
    let body = response.bytes_stream().map_err(std::io::Error::other);
    let mut reader = StreamReader::new(body);
    let mut buf = vec![0u8; chunk_size];
    let mut written = 0u64;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::TransferFailed(e.to_string()))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| Error::io_path("writing output file", destination, e))?;
        written += n as u64;
        callback(FetchEvent::Progress {
            bytes_written: written,
            percent: percent_of(written, total),
            total,
        });
    }

    file.flush()
        .await
        .map_err(|e| Error::io_path("flushing output file", destination, e))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn serve() -> String {
        let app = Router::new()
            .route("/sized", get(|| async { vec![7u8; 20_000] }))
            .route(
                "/unsized",
                get(|| async {
                    let chunks = (0..3).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![1u8; 5000])));
                    Body::from_stream(futures::stream::iter(chunks))
                }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/slow",
                get(|| async {
                    let stream = futures::stream::unfold(0u32, |n| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Some((Ok::<_, std::io::Error>(Bytes::from(vec![2u8; 1024])), n + 1))
                    });
                    Body::from_stream(stream)
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn channel_callback() -> (FetchCallback, mpsc::UnboundedReceiver<FetchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: FetchCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (callback, rx)
    }

    async fn collect_until_terminal(rx: &mut mpsc::UnboundedReceiver<FetchEvent>) -> Vec<FetchEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_fetch_writes_file_and_reports_progress() {
        let base = serve().await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("nested").join("track.mp3");

        let fetcher = StreamingFetcher::new().unwrap();
        let (callback, mut rx) = channel_callback();
        let handle = fetcher.fetch(&format!("{base}/sized"), &dest, callback);
        assert!(handle.id() > 0);

        let events = collect_until_terminal(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&FetchEvent::Completed {
                bytes_written: 20_000
            })
        );

        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                FetchEvent::Progress {
                    bytes_written,
                    percent,
                    total,
                } => Some((*bytes_written, *percent, *total)),
                _ => None,
            })
            .collect();
        assert!(progress.len() >= 3, "20000 bytes need at least 3 chunks of 8 KiB");
        assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(progress.last(), Some(&(20_000, 100, 20_000)));

        let written = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(written.len(), 20_000);
    }

    #[tokio::test]
    async fn test_unknown_length_reports_zero_percent() {
        let base = serve().await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("cover.jpg");

        let fetcher = StreamingFetcher::new().unwrap();
        let (callback, mut rx) = channel_callback();
        fetcher.fetch(&format!("{base}/unsized"), &dest, callback);

        let events = collect_until_terminal(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&FetchEvent::Completed {
                bytes_written: 15_000
            })
        );
        for event in &events[..events.len() - 1] {
            match event {
                FetchEvent::Progress { percent, total, .. } => {
                    assert_eq!(*percent, 0);
                    assert_eq!(*total, 0);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_error_status_fails_once() {
        let base = serve().await;
        let temp = TempDir::new().unwrap();

        let fetcher = StreamingFetcher::new().unwrap();
        let (callback, mut rx) = channel_callback();
        fetcher.fetch(&format!("{base}/missing"), &temp.path().join("x"), callback);

        let events = collect_until_terminal(&mut rx).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            FetchEvent::Failed { message } => assert!(message.contains("404")),
            other => panic!("expected failure, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_refused_fails() {
        let temp = TempDir::new().unwrap();
        let fetcher = StreamingFetcher::new().unwrap();
        let (callback, mut rx) = channel_callback();
        fetcher.fetch("http://127.0.0.1:1/file", &temp.path().join("x"), callback);

        let events = collect_until_terminal(&mut rx).await;
        assert!(matches!(events.as_slice(), [FetchEvent::Failed { .. }]));
    }

    #[tokio::test]
    async fn test_cancel_stops_callbacks() {
        let base = serve().await;
        let temp = TempDir::new().unwrap();

        let fetcher = StreamingFetcher::new().unwrap();
        let (callback, mut rx) = channel_callback();
        let handle = fetcher.fetch(&format!("{base}/slow"), &temp.path().join("slow"), callback);

        let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, FetchEvent::Progress { .. }));

        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_millis(200)).await;

        while let Ok(event) = rx.try_recv() {
            assert!(!event.is_terminal(), "no terminal event after cancel");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "no events after cancel settled");
    }
}
