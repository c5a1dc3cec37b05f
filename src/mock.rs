//! In-process stand-ins for the remote service and image hosts.
//!
//! Used by tests and by anyone who wants to drive the collection cache
//! without a network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::search::{PhotoDescriptor, PhotoSearch, SearchParams, SearchResultPage};

/// Serves canned images by URL; unknown URLs fail as a transport error
#[derive(Debug, Default)]
pub struct MockDownloader {
    images: HashMap<String, Vec<u8>>,
    delay: Option<Duration>,
}

impl MockDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.images.insert(url.to_string(), bytes);
        self
    }

    /// Sleeps before each download, to keep a cycle in flight
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl crate::materializer::PhotoDownloader for MockDownloader {
    async fn download(&self, url: &str) -> SyncResult<Vec<u8>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| SyncError::TransportError(format!("no such image {url}")))
    }
}

/// Returns queued responses in order, repeating the last one
#[derive(Debug)]
pub struct MockSearch {
    responses: Mutex<Vec<SyncResult<SearchResultPage>>>,
    calls: AtomicUsize,
}

impl MockSearch {
    pub fn new(responses: Vec<SyncResult<SearchResultPage>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        }
    }

    /// A single page of descriptors with the given URLs
    pub fn with_urls(urls: &[&str]) -> Self {
        Self::new(vec![Ok(page_of(urls))])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Builds a one-page result whose photos point at `urls`
pub fn page_of(urls: &[&str]) -> SearchResultPage {
    SearchResultPage {
        photos: urls
            .iter()
            .enumerate()
            .map(|(i, url)| PhotoDescriptor {
                url_m: Some(url.to_string()),
                title: format!("Mock Photo {}", i + 1),
            })
            .collect(),
        page_count: 1,
        page: 1,
    }
}

#[async_trait]
impl PhotoSearch for MockSearch {
    fn target(&self) -> &str {
        "https://mock.example/services/rest"
    }

    async fn search(&self, _params: &SearchParams) -> SyncResult<SearchResultPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self
            .responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match responses.len() {
            0 => Err(SyncError::EmptyResult),
            1 => responses[0].clone(),
            _ => responses.remove(0),
        }
    }
}
