//! Core types and events for creator-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File extensions accepted for download, without leading dot, lowercase.
///
/// Images, archives, video, audio, and a fixed set of document and
/// creative-tool formats. Anything else discovered on a post is counted as
/// skipped rather than failed.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    // Images
    "jpg", "jpeg", "jpe", "png", "gif", "webp", "bmp",
    // Archives
    "zip", "rar", "7z",
    // Video
    "mp4", "mov", "webm", "mkv", "avi",
    // Audio
    "mp3", "wav", "flac", "ogg", "m4a",
    // Documents and creative-tool formats
    "psd", "clip", "pdf", "docx",
];

/// Returns true when `ext` (lowercase, no dot) is in the allow-list
pub fn is_allowed_extension(ext: &str) -> bool {
    ALLOWED_EXTENSIONS.contains(&ext)
}

/// A post as returned by the aggregator API
///
/// Owned by discovery; downstream stages only read it.
#[derive(Clone, Debug, Deserialize)]
pub struct Post {
    /// Post identifier
    pub id: String,
    /// Post title; missing titles fall back to `Post {id}`
    #[serde(default)]
    pub title: Option<String>,
    /// Raw post content HTML/text
    #[serde(default)]
    pub content: Option<String>,
    /// Primary file, if the post has one
    #[serde(default, deserialize_with = "deserialize_maybe_file")]
    pub file: Option<FileDescriptor>,
    /// Ordered attachment sequence
    #[serde(default)]
    pub attachments: Vec<FileDescriptor>,
}

impl Post {
    /// The post title, falling back to `Post {id}` when absent or empty
    pub fn display_title(&self) -> String {
        match self.title.as_deref() {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => format!("Post {}", self.id),
        }
    }
}

/// A file reference inside a post: a source path plus an optional
/// declared name
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Source path or URL fragment, e.g. `/data/12/34/abcd.jpg`
    #[serde(default)]
    pub path: Option<String>,
    /// Declared filename, e.g. `cover.jpg`
    #[serde(default)]
    pub name: Option<String>,
}

impl FileDescriptor {
    /// Effective extension, lowercase without the dot
    ///
    /// Prefers the declared name's extension over the path's; empty when
    /// neither has one.
    pub fn effective_extension(&self) -> String {
        extension_of(self.name.as_deref())
            .or_else(|| extension_of(self.path.as_deref()))
            .unwrap_or_default()
    }
}

/// Extension of the last path segment, lowercase, without the dot
fn extension_of(s: Option<&str>) -> Option<String> {
    let s = s?;
    let last = s.rsplit(['/', '\\']).next().unwrap_or(s);
    let (stem, ext) = last.rsplit_once('.')?;
    // A leading dot alone ("." or ".hidden") is not an extension
    if stem.is_empty() || ext.is_empty() || ext.contains(' ') {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// One accepted file to download, produced by discovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTask {
    /// Resolved absolute URL
    pub url: String,
    /// Declared filename, when the API provided one
    pub name: Option<String>,
    /// Owning post id
    pub post_id: String,
    /// Owning post title
    pub post_title: String,
    /// Zero-based ordinal among the post's files, assigned in discovery
    /// order: primary file, attachments, embedded images
    pub index: usize,
    /// Total file count for the post
    pub total: usize,
}

impl FileTask {
    /// Original filename for `{orig_name}`: the declared name, else the
    /// URL's last path segment
    pub fn orig_name(&self) -> String {
        if let Some(name) = self.name.as_deref()
            && !name.is_empty()
        {
            return name.to_string();
        }
        self.url
            .split('?')
            .next()
            .unwrap_or(&self.url)
            .rsplit('/')
            .next()
            .unwrap_or("file")
            .to_string()
    }
}

/// Why a discovered file was skipped rather than downloaded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Extension not in the allow-list
    ExtensionNotAllowed,
    /// URL already seen this run
    DuplicateUrl,
    /// Downloaded bytes hashed to an already-seen digest
    DuplicateContent,
    /// Destination already exists and is non-empty (resume)
    AlreadyOnDisk,
    /// Run was cancelled before the task started
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::ExtensionNotAllowed => "extension not allowed",
            SkipReason::DuplicateUrl => "duplicate URL",
            SkipReason::DuplicateContent => "duplicate content",
            SkipReason::AlreadyOnDisk => "already on disk",
            SkipReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal status of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Discovery and all tasks finished (individual tasks may have failed)
    Completed,
    /// Cancellation was requested and queued work was dropped
    Cancelled,
    /// Discovery itself failed before completing
    Failed,
}

/// Aggregate summary reported when a run terminates
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    /// Terminal status
    pub status: RunStatus,
    /// File tasks discovered (post-dedup)
    pub discovered: u64,
    /// Files written to disk
    pub succeeded: u64,
    /// Files skipped (duplicates, disallowed extensions, resume hits)
    pub skipped: u64,
    /// Files or posts that exhausted their retry budget
    pub failed: u64,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
}

/// Event emitted during a run's lifecycle
///
/// Consumers subscribe via
/// [`CreatorDownloader::subscribe`](crate::CreatorDownloader::subscribe).
/// Emission is serialized through a single broadcast channel, so sinks
/// never see interleaved partial events.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Discovery accepted a file task
    FileDiscovered {
        /// Resolved URL
        url: String,
        /// Owning post id
        post_id: String,
    },

    /// A post's full data could not be fetched; the run continues
    PostFailed {
        /// Post id
        post_id: String,
        /// Error message
        error: String,
    },

    /// Bytes are flowing for a file
    Progress {
        /// File URL
        url: String,
        /// Bytes received so far
        bytes_received: u64,
        /// Total bytes when the server declared a length
        #[serde(skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
    },

    /// A file finished successfully
    FileCompleted {
        /// File URL
        url: String,
        /// Final on-disk path
        path: PathBuf,
    },

    /// A file was skipped
    FileSkipped {
        /// File URL
        url: String,
        /// Why
        reason: SkipReason,
    },

    /// A file exhausted its retry budget
    FileFailed {
        /// File URL
        url: String,
        /// Error message
        error: String,
        /// Attempts made
        attempts: u32,
    },

    /// Human-readable status line for log sinks
    Log {
        /// The message
        message: String,
    },

    /// The run terminated
    RunFinished {
        /// Aggregate summary
        summary: RunSummary,
    },
}

/// The aggregator sometimes serializes "no primary file" as `{}` instead
/// of `null`; treat a descriptor with no path as absent.
fn deserialize_maybe_file<'de, D>(deserializer: D) -> Result<Option<FileDescriptor>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let maybe: Option<FileDescriptor> = Option::deserialize(deserializer)?;
    Ok(maybe.filter(|f| f.path.as_deref().is_some_and(|p| !p.is_empty())))
}
