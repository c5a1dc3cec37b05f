//! Downloads and persists the photos of one result page, one at a time.
//!
//! Each descriptor is resolved to its medium-size URL, downloaded, then
//! inserted and committed in one background transaction before the next one
//! starts. The commit runs on the blocking pool. Per-photo problems (no URL,
//! failed download, empty body) are skipped. A failed save stops the batch. The cancellation flag is checked between photos, never
//! in the middle of a download.

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{SyncError, SyncResult};
use crate::model::{PhotoId, PinId};
use crate::persistence::{ContextKind, PersistenceCoordinator};
use crate::search::PhotoDescriptor;

/// Fetches raw image bytes
#[async_trait]
pub trait PhotoDownloader: Send + Sync {
    async fn download(&self, url: &str) -> SyncResult<Vec<u8>>;
}

/// Downloads over HTTP with the shared client
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PhotoDownloader for HttpDownloader {
    async fn download(&self, url: &str) -> SyncResult<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::TransportError(format!(
                "GET {url} returned status {status}"
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Cooperative stop signal shared between a fetch cycle and whoever may cancel it
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a batch ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Photos persisted, in order
    pub saved: Vec<PhotoId>,
    /// Descriptors skipped for per-photo problems
    pub skipped: usize,
    /// Stopped early by the cancellation flag or a vanished pin
    pub cancelled: bool,
}

pub struct PhotoMaterializer {
    downloader: Arc<dyn PhotoDownloader>,
    coordinator: Arc<PersistenceCoordinator>,
}

impl PhotoMaterializer {
    pub fn new(downloader: Arc<dyn PhotoDownloader>, coordinator: Arc<PersistenceCoordinator>) -> Self {
        Self {
            downloader,
            coordinator,
        }
    }

    /// Materializes `descriptors` for `pin`, calling `on_saved(index, photo)`
    /// after each successful save. On a persistence failure the error is
    /// returned along with whatever was saved so far in `partial`.
    pub async fn materialize<F>(
        &self,
        pin: PinId,
        descriptors: Vec<PhotoDescriptor>,
        cancel: &CancellationFlag,
        mut on_saved: F,
    ) -> Result<MaterializeReport, (SyncError, MaterializeReport)>
    where
        F: FnMut(usize, PhotoId),
    {
        let mut report = MaterializeReport::default();
        let total = descriptors.len();

        for (position, descriptor) in descriptors.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    "Fetch for pin {} cancelled after {} of {} photos",
                    pin, position, total
                );
                report.cancelled = true;
                break;
            }

            let Some(url) = descriptor.url_m.as_deref() else {
                debug!("Skipping '{}': no medium URL", descriptor.title);
                report.skipped += 1;
                continue;
            };

            let bytes = match self.downloader.download(url).await {
                Ok(bytes) if bytes.is_empty() => {
                    warn!("Skipping {url}: empty image");
                    report.skipped += 1;
                    continue;
                }
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping {url}: {e}");
                    report.skipped += 1;
                    continue;
                }
            };

            let coordinator = Arc::clone(&self.coordinator);
            let title = descriptor.title.clone();
            let source_url = url.to_string();
            let inserted = tokio::task::spawn_blocking(move || {
                coordinator.transact(ContextKind::Background, |ctx| {
                    let owner = ctx.pin(&pin)?;
                    Ok(ctx.insert_photo(&owner, bytes, &title, &source_url).id)
                })
            })
            .await
            .unwrap_or_else(|e| Err(SyncError::PersistenceFailure(format!("save task failed: {e}"))));

            let photo_id = match inserted {
                Ok(id) => id,
                Err(SyncError::NotFound(what)) => {
                    info!("Stopping fetch: {what} no longer exists");
                    report.cancelled = true;
                    break;
                }
                Err(e) => return Err((e, report)),
            };

            let index = report.saved.len();
            report.saved.push(photo_id);
            on_saved(index, photo_id);
        }

        Ok(report)
    }
}
