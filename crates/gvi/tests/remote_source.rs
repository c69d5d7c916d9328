use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gvi::{
    AssignmentEngine, AssignmentRegistry, Backoff, EngineConfig, ImageSource, PipelineMetrics,
    PointError, RemoteImageSource, RemoteSourceConfig, RetryPolicy, SpatialPoint,
};
use serde_json::json;

const TOKEN: &str = "test-token";
const JPEG_BYTES: &[u8] = b"\xFF\xD8\xFF\xE0fake-jpeg-body\xFF\xD9";

/// Image-search API double. The first `*_failures` calls to each endpoint
/// answer with `*_status`; the first `*_stalls` calls sleep for `stall_for`
/// before answering.
struct FakeApi {
    addr: SocketAddr,
    images: Vec<(&'static str, f64, f64)>,
    search_failures: u32,
    search_status: StatusCode,
    download_failures: u32,
    download_status: StatusCode,
    search_stalls: u32,
    download_stalls: u32,
    stall_for: Duration,
    search_calls: AtomicU32,
    download_calls: AtomicU32,
}

impl FakeApi {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            images: vec![
                ("1001", 45.00001, 7.0),
                ("1002", 45.00003, 7.0),
                ("1003", 45.0005, 7.0),
            ],
            search_failures: 0,
            search_status: StatusCode::SERVICE_UNAVAILABLE,
            download_failures: 0,
            download_status: StatusCode::INTERNAL_SERVER_ERROR,
            search_stalls: 0,
            download_stalls: 0,
            stall_for: Duration::from_millis(500),
            search_calls: AtomicU32::new(0),
            download_calls: AtomicU32::new(0),
        }
    }

    fn searches(&self) -> u32 {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn downloads(&self) -> u32 {
        self.download_calls.load(Ordering::SeqCst)
    }
}

async fn search(
    State(api): State<Arc<FakeApi>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let n = api.search_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= api.search_stalls {
        tokio::time::sleep(api.stall_for).await;
    }
    if n <= api.search_failures {
        return api.search_status.into_response();
    }
    if params.get("access_token").map(String::as_str) != Some(TOKEN)
        || params.get("is_pano").map(String::as_str) != Some("true")
        || !params.contains_key("bbox")
    {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let data: Vec<_> = api
        .images
        .iter()
        .map(|(id, lat, lon)| {
            json!({
                "id": id,
                "thumb_original_url": format!("http://{}/files/{id}", api.addr),
                "geometry": {"type": "Point", "coordinates": [lon, lat]},
            })
        })
        .collect();
    Json(json!({ "data": data })).into_response()
}

async fn download(State(api): State<Arc<FakeApi>>, Path(_id): Path<String>) -> Response {
    let n = api.download_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= api.download_stalls {
        tokio::time::sleep(api.stall_for).await;
    }
    if n <= api.download_failures {
        return api.download_status.into_response();
    }
    JPEG_BYTES.into_response()
}

async fn serve(configure: impl FnOnce(&mut FakeApi)) -> Arc<FakeApi> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut api = FakeApi::new(listener.local_addr().unwrap());
    configure(&mut api);
    let api = Arc::new(api);

    let app = Router::new()
        .route("/images", get(search))
        .route("/files/:id", get(download))
        .with_state(api.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    api
}

fn source(
    api: &FakeApi,
    cache: &std::path::Path,
    registry: Arc<AssignmentRegistry>,
) -> RemoteImageSource {
    source_with_timeout(api, cache, registry, Duration::from_secs(5))
}

fn source_with_timeout(
    api: &FakeApi,
    cache: &std::path::Path,
    registry: Arc<AssignmentRegistry>,
    request_timeout: Duration,
) -> RemoteImageSource {
    let config = RemoteSourceConfig {
        base_url: format!("http://{}", api.addr),
        access_token: TOKEN.to_string(),
        images_dir: cache.to_path_buf(),
        max_distance_m: 10.0,
        request_timeout,
        retry: RetryPolicy::new(3, Backoff::none()),
    };
    RemoteImageSource::new(config, reqwest::Client::new(), registry).unwrap()
}

fn point() -> SpatialPoint {
    SpatialPoint::new(0, 45.0, 7.0)
}

#[tokio::test]
async fn search_succeeds_after_two_transient_failures() {
    let api = serve(|api| api.search_failures = 2).await;
    let cache = tempfile::tempdir().unwrap();
    let source = source(&api, cache.path(), Arc::new(AssignmentRegistry::new()));

    let result = source.find_nearest_unassigned(&point()).await;

    assert_eq!(api.searches(), 3);
    assert_eq!(result.error, None);
    assert_eq!(result.image_id.as_deref(), Some("1001"));
    assert!(result.residual_m.unwrap() <= 10.0);
    let path = result.image_path.unwrap();
    assert_eq!(path.file_name().unwrap(), "1001.jpeg");
    assert_eq!(std::fs::read(&path).unwrap(), JPEG_BYTES);
}

#[tokio::test]
async fn search_gives_up_after_three_attempts() {
    let api = serve(|api| api.search_failures = u32::MAX).await;
    let cache = tempfile::tempdir().unwrap();
    let source = source(&api, cache.path(), Arc::new(AssignmentRegistry::new()));

    let result = source.find_nearest_unassigned(&point()).await;

    assert_eq!(api.searches(), 3);
    assert!(matches!(result.error, Some(PointError::Network(_))));
    assert_eq!(result.image_id, None);
    assert_eq!(result.image_path, None);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let api = serve(|api| {
        api.search_failures = u32::MAX;
        api.search_status = StatusCode::FORBIDDEN;
    })
    .await;
    let cache = tempfile::tempdir().unwrap();
    let source = source(&api, cache.path(), Arc::new(AssignmentRegistry::new()));

    let result = source.find_nearest_unassigned(&point()).await;

    assert_eq!(api.searches(), 1);
    assert!(matches!(result.error, Some(PointError::Network(_))));
}

#[tokio::test]
async fn download_succeeds_after_two_transient_failures() {
    let api = serve(|api| api.download_failures = 2).await;
    let cache = tempfile::tempdir().unwrap();
    let registry = Arc::new(AssignmentRegistry::new());
    let source = source(&api, cache.path(), registry.clone());

    let result = source.find_nearest_unassigned(&point()).await;

    assert_eq!(api.downloads(), 3);
    assert_eq!(result.error, None);
    assert_eq!(result.image_id.as_deref(), Some("1001"));
    let path = result.image_path.unwrap();
    assert_eq!(path, cache.path().join("1001.jpeg"));
    assert_eq!(std::fs::read(&path).unwrap(), JPEG_BYTES);
    assert!(registry.is_claimed("1001"));
}

#[tokio::test]
async fn timed_out_requests_are_retried() {
    let api = serve(|api| {
        api.search_stalls = 2;
        api.download_stalls = 2;
        api.stall_for = Duration::from_millis(500);
    })
    .await;
    let cache = tempfile::tempdir().unwrap();
    let source = source_with_timeout(
        &api,
        cache.path(),
        Arc::new(AssignmentRegistry::new()),
        Duration::from_millis(100),
    );

    let result = source.find_nearest_unassigned(&point()).await;

    // Stalled calls are counted by the server even though the client gave up.
    assert_eq!(api.searches(), 3);
    assert_eq!(api.downloads(), 3);
    assert_eq!(result.error, None);
    assert_eq!(result.image_id.as_deref(), Some("1001"));
    assert_eq!(std::fs::read(result.image_path.unwrap()).unwrap(), JPEG_BYTES);
}

#[tokio::test]
async fn failed_download_keeps_the_claim() {
    let api = serve(|api| api.download_failures = u32::MAX).await;
    let cache = tempfile::tempdir().unwrap();
    let registry = Arc::new(AssignmentRegistry::new());
    let source = source(&api, cache.path(), registry.clone());

    let result = source.find_nearest_unassigned(&point()).await;

    assert_eq!(api.downloads(), 3);
    assert_eq!(result.image_id.as_deref(), Some("1001"));
    assert!(result.image_location.is_some());
    assert_eq!(result.image_path, None);
    assert!(matches!(result.error, Some(PointError::Network(_))));
    assert!(registry.is_claimed("1001"));

    // The next lookup moves on to the next-nearest image.
    let next = source.find_nearest_unassigned(&point()).await;
    assert_eq!(next.image_id.as_deref(), Some("1002"));
}

#[tokio::test]
async fn cached_images_are_not_downloaded_again() {
    let api = serve(|_| {}).await;
    let cache = tempfile::tempdir().unwrap();
    std::fs::write(cache.path().join("1001.jpeg"), b"already here").unwrap();
    let source = source(&api, cache.path(), Arc::new(AssignmentRegistry::new()));

    let result = source.find_nearest_unassigned(&point()).await;

    assert_eq!(api.downloads(), 0);
    assert_eq!(std::fs::read(result.image_path.unwrap()).unwrap(), b"already here");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_points_never_share_an_image() {
    let api = serve(|_| {}).await;
    let cache = tempfile::tempdir().unwrap();
    let source: Arc<dyn ImageSource> = Arc::new(source(
        &api,
        cache.path(),
        Arc::new(AssignmentRegistry::new()),
    ));
    let points: Vec<SpatialPoint> = (0..6).map(|i| SpatialPoint::new(i, 45.0, 7.0)).collect();

    let engine = AssignmentEngine::new(
        EngineConfig {
            concurrency: 6,
            progress_every: 2,
        },
        Arc::new(PipelineMetrics::new()),
    );
    let results = engine.run(points, source).await;

    assert_eq!(results.len(), 6);
    let mut ids: Vec<&str> = results.iter().filter_map(|r| r.image_id.as_deref()).collect();
    ids.sort_unstable();
    // 1003 is ~55 m away, outside the bound.
    assert_eq!(ids, vec!["1001", "1002"]);
    assert_eq!(results.iter().filter(|r| r.is_not_found()).count(), 4);
}
