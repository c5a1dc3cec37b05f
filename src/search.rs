//! Remote photo search against a Flickr-compatible REST endpoint.
//!
//! The service cannot sample randomly, so a search is two requests:
//! 1. the bounding-box query, read only for its total page count
//! 2. the same query for one page chosen uniformly at random
//!
//! Both share the base parameters (api key, method, safe search, response
//! shape, bbox, upload-date floor, page size); the second adds `page`.

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::geo::BoundingBox;

pub const SEARCH_METHOD: &str = "flickr.photos.search";
pub const MEDIUM_URL_EXTRA: &str = "url_m";
pub const OK_STATUS: &str = "ok";
/// The service never returns results past this position
pub const MAX_SEARCHABLE_RESULTS: u32 = 4000;

/// Query settings that do not depend on the pin
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub endpoint: String,
    pub api_key: String,
    pub safe_search: bool,
    pub per_page: u32,
    /// Upload date floor, `YYYY/MM/DD`. Without one the service only
    /// searches the last twelve hours.
    pub min_upload_date: String,
    pub timeout: Duration,
}

/// Per-search parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub bbox: BoundingBox,
}

/// A candidate photo on a result page
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PhotoDescriptor {
    /// Medium-size image URL; absent when the owner disallows it
    #[serde(default)]
    pub url_m: Option<String>,
    #[serde(default)]
    pub title: String,
}

/// One page of search results. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResultPage {
    pub photos: Vec<PhotoDescriptor>,
    pub page_count: u32,
    /// 1-based page that was fetched
    pub page: u32,
}

/// The seam between the collection cache and the remote service
#[async_trait]
pub trait PhotoSearch: Send + Sync {
    /// Endpoint checked for reachability before searching
    fn target(&self) -> &str;

    /// Runs the two-phase search. Zero pages or an empty page is `EmptyResult`.
    async fn search(&self, params: &SearchParams) -> SyncResult<SearchResultPage>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(alias = "status")]
    stat: String,
    #[serde(default)]
    photos: Option<PhotosBody>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotosBody {
    pages: u32,
    #[serde(default)]
    photo: Option<Vec<PhotoDescriptor>>,
}

/// Decodes a response body into its photos section
fn decode_envelope(body: &[u8]) -> SyncResult<PhotosBody> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| SyncError::MalformedResponse(format!("cannot decode envelope: {e}")))?;

    if envelope.stat != OK_STATUS {
        return Err(SyncError::ServiceError {
            code: envelope.code.unwrap_or_default(),
            message: envelope
                .message
                .unwrap_or_else(|| format!("status '{}'", envelope.stat)),
        });
    }

    envelope
        .photos
        .ok_or_else(|| SyncError::MalformedResponse("missing key 'photos'".to_string()))
}

/// HTTP client for the search service
#[derive(Debug, Clone)]
pub struct FlickrClient {
    client: Client,
    options: SearchOptions,
}

impl FlickrClient {
    pub fn new(options: SearchOptions) -> SyncResult<Self> {
        let client = Client::builder().timeout(options.timeout).build()?;
        Ok(Self { client, options })
    }

    /// Shared HTTP client, reused for image downloads
    pub fn http_client(&self) -> Client {
        self.client.clone()
    }

    /// Builds the request URL; `page` is only set on the second request
    pub fn search_url(&self, params: &SearchParams, page: Option<u32>) -> SyncResult<Url> {
        let mut url = Url::parse(&self.options.endpoint).map_err(|e| {
            SyncError::TransportError(format!("invalid endpoint {}: {e}", self.options.endpoint))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("method", SEARCH_METHOD)
                .append_pair("api_key", &self.options.api_key)
                .append_pair("safe_search", if self.options.safe_search { "1" } else { "0" })
                .append_pair("extras", MEDIUM_URL_EXTRA)
                .append_pair("format", "json")
                .append_pair("nojsoncallback", "1")
                .append_pair("bbox", &params.bbox.to_query_value())
                .append_pair("min_date_uploaded", &self.options.min_upload_date)
                .append_pair("per_page", &self.options.per_page.to_string());
            if let Some(page) = page {
                query.append_pair("page", &page.to_string());
            }
        }

        Ok(url)
    }

    async fn request(&self, url: Url) -> SyncResult<PhotosBody> {
        debug!("GET {url}");
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::TransportError(format!(
                "request to {} returned status {}",
                url.path(),
                status
            )));
        }

        let body = response.bytes().await?;
        decode_envelope(&body)
    }

    /// Highest page the service will actually serve for this page size
    fn searchable_pages(&self, page_count: u32) -> u32 {
        let cap = (MAX_SEARCHABLE_RESULTS / self.options.per_page.max(1)).max(1);
        page_count.min(cap)
    }
}

#[async_trait]
impl PhotoSearch for FlickrClient {
    fn target(&self) -> &str {
        &self.options.endpoint
    }

    async fn search(&self, params: &SearchParams) -> SyncResult<SearchResultPage> {
        let first = self.request(self.search_url(params, None)?).await?;
        if first.pages == 0 {
            return Err(SyncError::EmptyResult);
        }

        let pages = self.searchable_pages(first.pages);
        let index = rand::thread_rng().gen_range(0..pages);
        let page = index + 1;
        info!(
            "Search for {} has {} pages, using page {}",
            params.bbox, first.pages, page
        );

        let second = self.request(self.search_url(params, Some(page))?).await?;
        let photos = second.photo.ok_or_else(|| {
            SyncError::MalformedResponse("missing key 'photo' in 'photos'".to_string())
        })?;
        if photos.is_empty() {
            return Err(SyncError::EmptyResult);
        }

        Ok(SearchResultPage {
            photos,
            page_count: first.pages,
            page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoBoundingBoxBuilder;

    fn options(endpoint: &str) -> SearchOptions {
        SearchOptions {
            endpoint: endpoint.to_string(),
            api_key: "test-key".to_string(),
            safe_search: true,
            per_page: 10,
            min_upload_date: "2014/01/01".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn params() -> SearchParams {
        SearchParams {
            bbox: GeoBoundingBoxBuilder::default().build(48.85, 2.29),
        }
    }

    #[test]
    fn test_search_url_carries_base_parameters() {
        let client = FlickrClient::new(options("https://api.flickr.com/services/rest")).unwrap();
        let url = client.search_url(&params(), None).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(get("method").as_deref(), Some(SEARCH_METHOD));
        assert_eq!(get("api_key").as_deref(), Some("test-key"));
        assert_eq!(get("safe_search").as_deref(), Some("1"));
        assert_eq!(get("extras").as_deref(), Some("url_m"));
        assert_eq!(get("nojsoncallback").as_deref(), Some("1"));
        assert_eq!(get("min_date_uploaded").as_deref(), Some("2014/01/01"));
        assert_eq!(get("per_page").as_deref(), Some("10"));
        assert_eq!(get("page"), None);

        let bbox = get("bbox").unwrap();
        let edges: Vec<f64> = bbox.split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(edges.len(), 4);
        assert!((edges[0] - 1.29).abs() < 1e-9);
        assert!((edges[3] - 49.85).abs() < 1e-9);
    }

    #[test]
    fn test_second_request_adds_page() {
        let client = FlickrClient::new(options("https://api.flickr.com/services/rest")).unwrap();
        let url = client.search_url(&params(), Some(7)).unwrap();
        assert!(url.query_pairs().any(|(k, v)| k == "page" && v == "7"));
    }

    #[test]
    fn test_page_count_capped_at_searchable_results() {
        let client = FlickrClient::new(options("https://api.flickr.com/services/rest")).unwrap();
        assert_eq!(client.searchable_pages(12_000), 400);
        assert_eq!(client.searchable_pages(3), 3);
    }

    #[test]
    fn test_decode_ok_envelope() {
        let body = br#"{"stat":"ok","photos":{"page":1,"pages":2,"perpage":10,"total":"12",
            "photo":[{"url_m":"https://example.com/a.jpg","title":"a"},{"title":"no url"}]}}"#;
        let photos = decode_envelope(body).unwrap();
        assert_eq!(photos.pages, 2);
        let list = photos.photo.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].url_m.as_deref(), Some("https://example.com/a.jpg"));
        assert_eq!(list[1].url_m, None);
    }

    #[test]
    fn test_decode_service_error() {
        let body = br#"{"stat":"fail","code":100,"message":"Invalid API Key (Key has invalid format)"}"#;
        assert_eq!(
            decode_envelope(body).unwrap_err(),
            SyncError::ServiceError {
                code: 100,
                message: "Invalid API Key (Key has invalid format)".to_string()
            }
        );
    }

    #[test]
    fn test_decode_status_alias_and_missing_photos() {
        let body = br#"{"status":"ok"}"#;
        assert!(matches!(
            decode_envelope(body),
            Err(SyncError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_envelope(b"jsonFlickrApi({})"),
            Err(SyncError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_search_picks_page_and_returns_descriptors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/services/rest")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("method".into(), SEARCH_METHOD.into()),
                mockito::Matcher::UrlEncoded("api_key".into(), "test-key".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"stat":"ok","photos":{"pages":1,"photo":[
                    {"url_m":"https://example.com/1.jpg","title":"one"},
                    {"url_m":"https://example.com/2.jpg","title":"two"}]}}"#,
            )
            .expect(2)
            .create_async()
            .await;

        let client = FlickrClient::new(options(&format!("{}/services/rest", server.url()))).unwrap();
        let page = client.search(&params()).await.unwrap();

        assert_eq!(page.page, 1);
        assert_eq!(page.page_count, 1);
        assert_eq!(page.photos.len(), 2);
        assert_eq!(page.photos[1].title, "two");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_zero_pages_is_empty_result() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/services/rest")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"stat":"ok","photos":{"pages":0,"photo":[]}}"#)
            .expect(1)
            .create_async()
            .await;

        let client = FlickrClient::new(options(&format!("{}/services/rest", server.url()))).unwrap();
        assert_eq!(client.search(&params()).await, Err(SyncError::EmptyResult));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_2xx_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/services/rest")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = FlickrClient::new(options(&format!("{}/services/rest", server.url()))).unwrap();
        assert!(matches!(
            client.search(&params()).await,
            Err(SyncError::TransportError(_))
        ));
    }
}
