use clap::{Parser, ValueEnum};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Where candidate panoramas come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// A directory of geotagged JPEGs.
    Local,
    /// The Mapillary Graph API; images are downloaded into `--images-dir`.
    Remote,
}

/// Opaque API credential. Never printed.
#[derive(Clone)]
pub struct AccessToken(pub String);

impl From<String> for AccessToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// `assign_images` - match every input point to the nearest street-level
/// panorama that no other point has taken.
///
/// Reads a GeoJSON FeatureCollection of points and writes it back with
/// `image_id`, `image_lat`, `image_lon`, `residual`, `image_path` and `error`
/// properties on each feature.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Input GeoJSON FeatureCollection of Point features.
    #[arg(long, env = "GVI_POINTS")]
    pub input: PathBuf,

    /// Output GeoJSON path.
    #[arg(long, env = "GVI_ASSIGNED_POINTS")]
    pub output: PathBuf,

    #[arg(long, value_enum, default_value_t = SourceKind::Remote, env = "GVI_IMAGE_SOURCE")]
    pub source: SourceKind,

    /// Image directory: searched for `local`, used as the download cache for `remote`.
    #[arg(long, env = "GVI_IMAGES_DIR")]
    pub images_dir: PathBuf,

    /// Largest accepted distance between a point and its image, in metres.
    #[arg(long, default_value_t = 10.0, env = "GVI_MAX_DISTANCE_M")]
    pub max_distance_m: f64,

    /// Number of points looked up concurrently.
    #[arg(long, default_value_t = 8, env = "GVI_CONCURRENCY")]
    pub concurrency: usize,

    /// Image-search API credential, required for the remote source.
    #[arg(long, env = "MAPILLARY_CLIENT_TOKEN", hide_env_values = true)]
    pub access_token: Option<AccessToken>,

    #[arg(long, default_value = gvi::source::remote::MAPILLARY_GRAPH_URL, env = "GVI_API_BASE_URL")]
    pub api_base_url: String,

    /// Per-attempt timeout for search and download requests.
    #[arg(long, default_value_t = 30, env = "GVI_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: u64,

    /// Attempts per request before a point is marked with a network error.
    #[arg(long, default_value_t = 3, env = "GVI_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Serve Prometheus metrics on this address while the run is in progress.
    #[arg(long, env = "GVI_METRICS_LISTEN_ADDR")]
    pub metrics_listen_addr: Option<SocketAddr>,
}
