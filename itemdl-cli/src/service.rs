//! Background transfer service.
//!
//! Stands in for an OS-level download manager: transfers run on their own
//! tokio tasks, detached from the queue, and are only observable through
//! [`ExternalTransferService::query`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use futures::StreamExt;
use item_downloader::{
    Error, ExternalTransferService, Result, TransferQuery, TransferRequest, TransferStatus,
};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Failure codes reported by this service.
pub mod codes {
    pub const FILE_ERROR: i32 = 1001;
    pub const UNHANDLED_HTTP_RESPONSE: i32 = 1002;
    pub const HTTP_DATA_ERROR: i32 = 1004;
    pub const DESTINATION_NOT_FOUND: i32 = 1007;
}

struct Transfer {
    query: TransferQuery,
    token: CancellationToken,
}

type Transfers = Arc<Mutex<HashMap<i64, Transfer>>>;

pub struct BackgroundTransferService {
    client: Client,
    runtime: Handle,
    next_id: AtomicI64,
    transfers: Transfers,
}

impl BackgroundTransferService {
    /// Must be called from within a tokio runtime.
    pub fn new(user_agent: &str) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Other(format!("transfer service needs a tokio runtime: {e}")))?;
        let client = Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            client,
            runtime,
            next_id: AtomicI64::new(1),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl ExternalTransferService for BackgroundTransferService {
    fn submit(&self, request: &TransferRequest) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.transfers.lock().insert(
            id,
            Transfer {
                query: TransferQuery {
                    status: TransferStatus::Pending,
                    bytes_so_far: 0,
                    total_bytes: 0,
                    failure_reason: None,
                },
                token: token.clone(),
            },
        );

        let client = self.client.clone();
        let transfers = self.transfers.clone();
        let request = request.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(download_id = id, "Background transfer cancelled");
                }
                outcome = run_transfer(&client, &request, id, &transfers) => {
                    update(&transfers, id, |query| match outcome {
                        Ok(()) => {
                            query.status = TransferStatus::Successful;
                        }
                        Err(code) => {
                            warn!(download_id = id, url = %request.url, code, "Background transfer failed");
                            query.status = TransferStatus::Failed;
                            query.failure_reason = Some(code);
                        }
                    });
                }
            }
        });

        Ok(id)
    }

    fn query(&self, download_id: i64) -> Option<TransferQuery> {
        self.transfers
            .lock()
            .get(&download_id)
            .map(|t| t.query.clone())
    }

    fn cancel(&self, download_id: i64) {
        if let Some(transfer) = self.transfers.lock().remove(&download_id) {
            transfer.token.cancel();
        }
    }
}

fn update<F: FnOnce(&mut TransferQuery)>(transfers: &Transfers, id: i64, f: F) {
    if let Some(transfer) = transfers.lock().get_mut(&id) {
        f(&mut transfer.query);
    }
}

async fn run_transfer(
    client: &Client,
    request: &TransferRequest,
    id: i64,
    transfers: &Transfers,
) -> std::result::Result<(), i32> {
    if let Some(parent) = request.destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|_| codes::DESTINATION_NOT_FOUND)?;
    }
    let mut file = tokio::fs::File::create(&request.destination)
        .await
        .map_err(|_| codes::FILE_ERROR)?;

    let response = client
        .get(&request.url)
        .send()
        .await
        .map_err(|_| codes::HTTP_DATA_ERROR)?;
    if !response.status().is_success() {
        return Err(codes::UNHANDLED_HTTP_RESPONSE);
    }

    let total = response.content_length().unwrap_or(0);
    update(transfers, id, |q| {
        q.status = TransferStatus::Running;
        q.total_bytes = total;
    });

    let mut body = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|_| codes::HTTP_DATA_ERROR)?;
        file.write_all(&chunk).await.map_err(|_| codes::FILE_ERROR)?;
        written += chunk.len() as u64;
        update(transfers, id, |q| q.bytes_so_far = written);
    }
    file.flush().await.map_err(|_| codes::FILE_ERROR)?;
    update(transfers, id, |q| {
        if q.total_bytes == 0 {
            q.total_bytes = written;
        }
    });
    Ok(())
}
