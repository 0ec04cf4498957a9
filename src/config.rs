//! Configuration types for creator-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default filename template used when the configured template contains
/// unknown placeholders
pub const DEFAULT_FILENAME_TEMPLATE: &str = "{post_id}_{orig_name}";

/// Download behavior configuration (concurrency, retry budgets, naming)
///
/// Groups settings related to how files are fetched and where they land.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Number of files downloaded in parallel, 1-20 (default: 5)
    #[serde(default = "default_simultaneous_downloads")]
    pub simultaneous_downloads: usize,

    /// Attempts per creator post-listing page, 1-1000 (default: 200)
    #[serde(default = "default_creator_posts_max_attempts")]
    pub creator_posts_max_attempts: u32,

    /// Attempts per full post fetch, 1-100 (default: 7)
    #[serde(default = "default_post_data_max_retries")]
    pub post_data_max_retries: u32,

    /// Attempts per file transfer, 1-200 (default: 50)
    #[serde(default = "default_file_download_max_retries")]
    pub file_download_max_retries: u32,

    /// Attempts per auxiliary API call, 1-50 (default: 3)
    #[serde(default = "default_api_request_max_retries")]
    pub api_request_max_retries: u32,

    /// Filename template with `{post_id}`, `{post_title}`, `{orig_name}`,
    /// `{index}`, `{total}`, `{creator_id}`, `{creator_name}`, `{service}`
    /// and `{date}` placeholders
    #[serde(default = "default_filename_template")]
    pub creator_filename_template: String,

    /// Subfolder structure under the creator's download directory
    #[serde(default)]
    pub creator_folder_strategy: FolderStrategy,

    /// Prefix filenames with the file's 1-based ordinal within its post
    #[serde(default)]
    pub auto_rename_enabled: bool,

    /// Maximum sanitized filename length, extension preserved (default: 100)
    #[serde(default = "default_max_filename_length")]
    pub max_filename_length: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            simultaneous_downloads: default_simultaneous_downloads(),
            creator_posts_max_attempts: default_creator_posts_max_attempts(),
            post_data_max_retries: default_post_data_max_retries(),
            file_download_max_retries: default_file_download_max_retries(),
            api_request_max_retries: default_api_request_max_retries(),
            creator_filename_template: default_filename_template(),
            creator_folder_strategy: FolderStrategy::default(),
            auto_rename_enabled: false,
            max_filename_length: default_max_filename_length(),
        }
    }
}

/// Subfolder structure under a creator's download directory
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderStrategy {
    /// One subfolder per post, named `{post_id}_{sanitized_title}` (default)
    #[default]
    PerPost,
    /// All files directly in the creator folder
    SingleFolder,
    /// Subfolders named after the file extension without its dot
    ByFileType,
}

/// Duplicate detection strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// URL-based dedup at discovery time plus an md5 content check after
    /// each transfer (default)
    #[default]
    UrlAndContent,
    /// URL-based dedup only
    UrlOnly,
}

/// Outbound proxy configuration
///
/// The engine never manages a proxy process; a SOCKS endpoint is assumed
/// to already be listening.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyConfig {
    /// Direct connections (default)
    #[default]
    Disabled,
    /// HTTP/HTTPS proxy URL, e.g. `http://127.0.0.1:8080`
    Http {
        /// Proxy URL
        url: String,
    },
    /// Local SOCKS5 endpoint, e.g. `socks5h://127.0.0.1:9050`
    Socks {
        /// Proxy URL
        url: String,
    },
}

/// Retry delay shape for transient failures
///
/// The per-operation attempt counts live in [`DownloadConfig`]; this only
/// controls how long to wait between attempts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Main configuration for [`CreatorDownloader`](crate::CreatorDownloader)
///
/// Immutable once passed to the downloader; there is no ambient global
/// state. Consumers that persist settings elsewhere build a fresh `Config`
/// per run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for all engine output (default: "./")
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,

    /// Application folder name under the base directory
    /// (default: "Creator Downloader")
    #[serde(default = "default_base_folder_name")]
    pub base_folder_name: String,

    /// Download behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry delay shape
    #[serde(default)]
    pub retry: RetryConfig,

    /// Outbound proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Duplicate detection strategy
    #[serde(default)]
    pub dedup_mode: DedupMode,

    /// Write each post's text content as a `.txt` file alongside its media
    #[serde(default)]
    pub save_descriptions: bool,

    /// Per-request network timeout (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            base_folder_name: default_base_folder_name(),
            download: DownloadConfig::default(),
            retry: RetryConfig::default(),
            proxy: ProxyConfig::default(),
            dedup_mode: DedupMode::default(),
            save_descriptions: false,
            request_timeout: default_request_timeout(),
        }
    }
}

impl Config {
    /// Clamp numeric settings into their documented ranges
    ///
    /// A run must never abort because a collaborator handed in an
    /// out-of-range value, so values are clamped rather than rejected.
    /// Each adjustment is logged.
    pub fn validate(mut self) -> Self {
        self.download.simultaneous_downloads =
            clamp_logged("simultaneous_downloads", self.download.simultaneous_downloads, 1, 20);
        self.download.creator_posts_max_attempts = clamp_logged(
            "creator_posts_max_attempts",
            self.download.creator_posts_max_attempts,
            1,
            1000,
        );
        self.download.post_data_max_retries =
            clamp_logged("post_data_max_retries", self.download.post_data_max_retries, 1, 100);
        self.download.file_download_max_retries = clamp_logged(
            "file_download_max_retries",
            self.download.file_download_max_retries,
            1,
            200,
        );
        self.download.api_request_max_retries = clamp_logged(
            "api_request_max_retries",
            self.download.api_request_max_retries,
            1,
            50,
        );
        if self.download.max_filename_length < 16 {
            tracing::warn!(
                value = self.download.max_filename_length,
                "max_filename_length too small, using 16"
            );
            self.download.max_filename_length = 16;
        }
        self
    }

    /// The directory the engine writes downloads under:
    /// `{base_directory}/{base_folder_name}/Downloads`
    pub fn downloads_dir(&self) -> PathBuf {
        self.base_directory
            .join(&self.base_folder_name)
            .join("Downloads")
    }
}

fn clamp_logged<T: Ord + Copy + std::fmt::Display>(key: &str, value: T, min: T, max: T) -> T {
    let clamped = value.clamp(min, max);
    if clamped != value {
        tracing::warn!(key, %value, %clamped, "configuration value out of range, clamped");
    }
    clamped
}

fn default_simultaneous_downloads() -> usize {
    5
}

fn default_creator_posts_max_attempts() -> u32 {
    200
}

fn default_post_data_max_retries() -> u32 {
    7
}

fn default_file_download_max_retries() -> u32 {
    50
}

fn default_api_request_max_retries() -> u32 {
    3
}

fn default_filename_template() -> String {
    DEFAULT_FILENAME_TEMPLATE.to_string()
}

fn default_max_filename_length() -> usize {
    100
}

fn default_base_directory() -> PathBuf {
    PathBuf::from("./")
}

fn default_base_folder_name() -> String {
    "Creator Downloader".to_string()
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

/// Serde helper for Duration as seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
