use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::error::{ConfigError, PointError};
use crate::geo::{BoundingBox, LatLon};
use crate::registry::AssignmentRegistry;
use crate::retry::RetryPolicy;
use crate::source::ImageSource;
use crate::types::{AssignmentResult, ImageOrigin, ImageRecord, SpatialPoint};

pub const MAPILLARY_GRAPH_URL: &str = "https://graph.mapillary.com";

const SEARCH_FIELDS: &str = "id,thumb_original_url,geometry";

#[derive(Clone)]
pub struct RemoteSourceConfig {
    pub base_url: String,
    pub access_token: String,
    /// Downloaded images are cached here as `{id}.jpeg`.
    pub images_dir: PathBuf,
    pub max_distance_m: f64,
    /// Per attempt, applies to both search and download requests.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl RemoteSourceConfig {
    pub fn new(access_token: impl Into<String>, images_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: MAPILLARY_GRAPH_URL.to_string(),
            access_token: access_token.into(),
            images_dir: images_dir.into(),
            max_distance_m: 10.0,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for RemoteSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSourceConfig")
            .field("base_url", &self.base_url)
            .field("access_token", &"<redacted>")
            .field("images_dir", &self.images_dir)
            .field("max_distance_m", &self.max_distance_m)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Failure of a single HTTP attempt.
#[derive(Debug, Error)]
enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("HTTP {status} from {endpoint}")]
    Status {
        status: StatusCode,
        endpoint: &'static str,
    },

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl FetchError {
    /// Timeouts, dropped connections and 5xx are worth another attempt.
    /// Client errors (including 429) and bad bodies are not.
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            FetchError::Status { status, .. } => status.is_server_error(),
            FetchError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<RemoteImage>,
}

#[derive(Debug, Deserialize)]
struct RemoteImage {
    id: RemoteId,
    thumb_original_url: Option<String>,
    geometry: Option<PointGeometry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemoteId {
    Text(String),
    Number(u64),
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteId::Text(s) => f.write_str(s),
            RemoteId::Number(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PointGeometry {
    /// GeoJSON order: lon, lat.
    coordinates: [f64; 2],
}

impl RemoteImage {
    /// Results without a URL, a finite location or a file-name-safe id are
    /// dropped.
    fn into_record(self) -> Option<ImageRecord> {
        let id = self.id.to_string();
        if !is_cacheable_id(&id) {
            tracing::warn!(image_id = %id, "Skipping search result with unusable id");
            return None;
        }
        let url = self.thumb_original_url?;
        let [lon, lat] = self.geometry?.coordinates;
        let location = LatLon::new(lat, lon);
        location.is_finite().then(|| ImageRecord {
            id,
            location,
            origin: ImageOrigin::Remote(url),
        })
    }
}

/// Image-search API client that claims and downloads the nearest panorama.
///
/// Each lookup issues one bounding-box search around the point, claims the
/// closest unclaimed result inside the distance bound, then downloads it into
/// the cache directory unless a file for that id is already there.
pub struct RemoteImageSource {
    client: reqwest::Client,
    config: RemoteSourceConfig,
    registry: Arc<AssignmentRegistry>,
}

impl RemoteImageSource {
    /// Validates the configuration and prepares the cache directory.
    pub fn new(
        config: RemoteSourceConfig,
        client: reqwest::Client,
        registry: Arc<AssignmentRegistry>,
    ) -> Result<Self, ConfigError> {
        if config.access_token.trim().is_empty() {
            return Err(ConfigError::MissingAccessToken);
        }

        std::fs::create_dir_all(&config.images_dir).map_err(|source| ConfigError::Io {
            context: format!("creating image cache {}", config.images_dir.display()),
            source,
        })?;
        let images_dir =
            std::fs::canonicalize(&config.images_dir).map_err(|source| ConfigError::Io {
                context: format!("resolving image cache {}", config.images_dir.display()),
                source,
            })?;

        Ok(Self {
            client,
            config: RemoteSourceConfig {
                images_dir,
                ..config
            },
            registry,
        })
    }

    /// HTTP client with connection pooling. One per process, shared by all
    /// workers.
    pub fn http_client(connect_timeout: Duration) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("gvi/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ConfigError::HttpClient)
    }

    /// `{images_dir}/{id}.jpeg`. Search results with ids outside
    /// `[A-Za-z0-9_-]` are dropped, so distinct ids never share a file.
    pub fn cache_path(&self, image_id: &str) -> PathBuf {
        self.config.images_dir.join(format!("{image_id}.jpeg"))
    }

    async fn search_once(&self, bbox: &str) -> Result<Vec<ImageRecord>, FetchError> {
        let url = format!("{}/images", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&[
                ("access_token", self.config.access_token.as_str()),
                ("fields", SEARCH_FIELDS),
                ("is_pano", "true"),
                ("bbox", bbox),
            ])
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                endpoint: "search",
            });
        }

        let body = response.bytes().await.map_err(FetchError::Transport)?;
        let parsed: SearchResponse =
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))?;

        Ok(parsed
            .data
            .into_iter()
            .filter_map(RemoteImage::into_record)
            .collect())
    }

    async fn download_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                endpoint: "download",
            });
        }

        let body = response.bytes().await.map_err(FetchError::Transport)?;
        Ok(body.to_vec())
    }

    /// Returns the cached file for `record`, downloading it first if needed.
    async fn retrieve(&self, record: &ImageRecord) -> Result<PathBuf, PointError> {
        let path = self.cache_path(&record.id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(image_id = %record.id, path = %path.display(), "Image already cached");
            return Ok(path);
        }

        let url = match &record.origin {
            ImageOrigin::Remote(url) => url.as_str(),
            ImageOrigin::Local(local) => return Ok(local.clone()),
        };

        let bytes = self
            .config
            .retry
            .run("image download", |_| self.download_once(url), FetchError::is_transient)
            .await
            .map_err(|e| PointError::Network(format!("downloading image {}: {e}", record.id)))?;

        write_atomically(&path, &bytes)
            .await
            .map_err(|e| PointError::Storage(format!("writing {}: {e}", path.display())))?;

        tracing::debug!(image_id = %record.id, bytes = bytes.len(), path = %path.display(), "Image downloaded");
        Ok(path)
    }
}

#[async_trait]
impl ImageSource for RemoteImageSource {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn max_distance_m(&self) -> f64 {
        self.config.max_distance_m
    }

    async fn find_nearest_unassigned(&self, point: &SpatialPoint) -> AssignmentResult {
        let here = point.location();
        if !here.is_finite() {
            return AssignmentResult::not_found(point.id);
        }

        let bbox = BoundingBox::around(here, self.config.max_distance_m).to_query_param();
        let images = match self
            .config
            .retry
            .run("image search", |_| self.search_once(&bbox), FetchError::is_transient)
            .await
        {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!(point_id = point.id, error = %e, "Image search failed");
                return AssignmentResult::failed(
                    point.id,
                    PointError::Network(format!("image search: {e}")),
                );
            }
        };

        tracing::debug!(point_id = point.id, results = images.len(), "Image search returned");

        let candidates: Vec<(&ImageRecord, f64)> = images
            .iter()
            .map(|record| (record, here.distance_m(&record.location)))
            .filter(|(_, residual)| *residual <= self.config.max_distance_m)
            .collect();

        let Some((record, residual)) = self.registry.claim_nearest(candidates) else {
            tracing::debug!(point_id = point.id, "No unassigned image in range");
            return AssignmentResult::not_found(point.id);
        };

        // The claim stands even if retrieval fails.
        match self.retrieve(record).await {
            Ok(path) => AssignmentResult::assigned(point.id, record, residual, Some(path), None),
            Err(e) => {
                tracing::warn!(point_id = point.id, image_id = %record.id, error = %e, "Image retrieval failed");
                AssignmentResult::assigned(point.id, record, residual, None, Some(e))
            }
        }
    }
}

/// Non-empty and limited to `[A-Za-z0-9_-]`, so the id is its own file stem.
fn is_cacheable_id(image_id: &str) -> bool {
    !image_id.is_empty()
        && image_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Writes to a unique temp file beside `path` and renames it into place, so a
/// concurrent reader never sees a partial image.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.part", uuid::Uuid::new_v4()));

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
