//! End-to-end fetch against a local HTTP server standing in for both the
//! search service and the image host.

use geoalbum::cache::{CacheSettings, CycleOutcome, EnsureOutcome, PhotoCollectionCache};
use geoalbum::error::SyncError;
use geoalbum::geo::Coordinate;
use geoalbum::materializer::HttpDownloader;
use geoalbum::notifier::{ChangeNotifier, CollectionEventKind};
use geoalbum::persistence::PersistenceCoordinator;
use geoalbum::reachability::HostReachability;
use geoalbum::search::{FlickrClient, SearchOptions};
use geoalbum::store::YamlBackend;
use mockito::Matcher;
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::tempdir;

static INIT: Once = Once::new();

fn init_logger() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .is_test(true)
            .init();
    });
}

fn open_cache(endpoint: &str, data_dir: &Path) -> PhotoCollectionCache {
    init_logger();
    let search = FlickrClient::new(SearchOptions {
        endpoint: endpoint.to_string(),
        api_key: "test-key".to_string(),
        safe_search: true,
        per_page: 3,
        min_upload_date: "2014/01/01".to_string(),
        timeout: Duration::from_secs(5),
    })
    .expect("client should build");
    let downloader = HttpDownloader::new(search.http_client());
    let coordinator = PersistenceCoordinator::open(
        Box::new(YamlBackend::new(data_dir)),
        ChangeNotifier::spawn(),
    )
    .expect("store should open");

    PhotoCollectionCache::new(
        Arc::new(coordinator),
        Arc::new(search),
        Arc::new(downloader),
        Arc::new(HostReachability),
        CacheSettings::default(),
    )
}

#[tokio::test]
async fn test_fetch_search_and_download_over_http() {
    // One search page with three photos, the second without a medium URL
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    let body = format!(
        r#"{{"stat":"ok","photos":{{"page":1,"pages":1,"perpage":3,"total":3,"photo":[
            {{"id":"1","title":"Harbour","url_m":"{base}/img/1.jpg"}},
            {{"id":"2","title":"No medium size"}},
            {{"id":"3","title":"Bridge","url_m":"{base}/img/3.jpg"}}
        ]}}}}"#
    );
    let search = server
        .mock("GET", "/services/rest")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "flickr.photos.search".into()),
            Matcher::UrlEncoded("api_key".into(), "test-key".into()),
            Matcher::UrlEncoded("extras".into(), "url_m".into()),
            Matcher::UrlEncoded("per_page".into(), "3".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .expect(2)
        .create_async()
        .await;
    // Serve the two downloadable images
    let first_image = server
        .mock("GET", "/img/1.jpg")
        .with_status(200)
        .with_body(vec![0xFF, 0xD8, 0x01])
        .create_async()
        .await;
    let third_image = server
        .mock("GET", "/img/3.jpg")
        .with_status(200)
        .with_body(vec![0xFF, 0xD8, 0x03])
        .create_async()
        .await;

    // Drop a pin and fetch its collection
    let data_dir = tempdir().unwrap();
    let cache = open_cache(&format!("{base}/services/rest"), data_dir.path());
    let pin = cache.drop_pin(Coordinate::new(-33.8568, 151.2153)).unwrap();
    let mut events = cache.notifier().events();

    let EnsureOutcome::Started(handle) = cache.ensure(&pin.id).unwrap() else {
        panic!("expected a new fetch cycle");
    };
    let cycle = events.cycle_for_pin(pin.id).await;
    assert_eq!(
        handle.wait().await,
        CycleOutcome::Ready {
            expected: 3,
            actual: 2
        }
    );

    search.assert_async().await;
    first_image.assert_async().await;
    third_image.assert_async().await;

    assert_eq!(cycle.first(), Some(&CollectionEventKind::CountAnnounced { expected: 3 }));
    assert_eq!(cycle.last(), Some(&CollectionEventKind::CollectionReady { actual: 2 }));

    // Check the stored photos
    let photos = cache.photos(&pin.id);
    assert_eq!(photos.len(), 2);
    assert_eq!(photos[0].title, "Harbour");
    assert_eq!(photos[0].image.as_slice(), &[0xFF, 0xD8, 0x01]);
    assert_eq!(photos[1].title, "Bridge");
    assert_eq!(photos[1].source_url, format!("{base}/img/3.jpg"));

    // Check the index on disk
    let index = std::fs::read_to_string(data_dir.path().join("index.yaml")).unwrap();
    assert!(index.contains("Harbour"));
    assert!(index.contains("Bridge"));
}

#[tokio::test]
async fn test_service_error_envelope_fails_cycle() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/services/rest")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"stat":"fail","code":100,"message":"Invalid API Key (Key has invalid format)"}"#)
        .create_async()
        .await;

    let data_dir = tempdir().unwrap();
    let cache = open_cache(&format!("{}/services/rest", server.url()), data_dir.path());
    let pin = cache.drop_pin(Coordinate::new(12.0, 34.0)).unwrap();

    let EnsureOutcome::Started(handle) = cache.ensure(&pin.id).unwrap() else {
        panic!("expected a new fetch cycle");
    };
    match handle.wait().await {
        CycleOutcome::Failed(SyncError::ServiceError { code, message }) => {
            assert_eq!(code, 100);
            assert!(message.contains("Invalid API Key"));
        }
        other => panic!("expected a service error, got {other:?}"),
    }
    assert!(cache.photos(&pin.id).is_empty());
}

#[tokio::test]
async fn test_malformed_body_fails_cycle() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/services/rest")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("jsonFlickrApi({not json})")
        .create_async()
        .await;

    let data_dir = tempdir().unwrap();
    let cache = open_cache(&format!("{}/services/rest", server.url()), data_dir.path());
    let pin = cache.drop_pin(Coordinate::new(-12.0, -34.0)).unwrap();

    let EnsureOutcome::Started(handle) = cache.ensure(&pin.id).unwrap() else {
        panic!("expected a new fetch cycle");
    };
    assert!(matches!(
        handle.wait().await,
        CycleOutcome::Failed(SyncError::MalformedResponse(_))
    ));
}
