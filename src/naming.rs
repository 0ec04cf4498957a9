//! Filename templating, sanitization, and folder placement
//!
//! Turns a (post, file) pair into a sanitized, deduplicated on-disk path.
//! A bad template must never abort a run: unknown placeholders fall back to
//! the default `{post_id}_{orig_name}` template, and every produced name is
//! sanitized for common filesystems.

use crate::config::{DownloadConfig, FolderStrategy, DEFAULT_FILENAME_TEMPLATE};
use crate::types::FileTask;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Placeholders the template engine recognizes
const KNOWN_PLACEHOLDERS: &[&str] = &[
    "post_id",
    "post_title",
    "orig_name",
    "index",
    "total",
    "creator_id",
    "creator_name",
    "service",
    "date",
];

/// Characters replaced with `_` in filename components
const ILLEGAL_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Maximum counter tried when resolving in-run path collisions
const MAX_COLLISION_COUNTER: u32 = 9999;

/// Sanitize one filename component
///
/// Illegal characters and control characters are replaced (not dropped)
/// with underscores, whitespace runs collapse to a single underscore, the
/// extension (if any) is preserved verbatim and excluded from sanitization,
/// and the result is truncated to `max_length` characters while keeping the
/// extension. An empty or whitespace-only input becomes `unnamed`.
pub fn sanitize_filename(name: &str, max_length: usize) -> String {
    let trimmed = name.trim();
    let (stem, ext) = split_extension(trimmed);

    let mut sanitized = String::with_capacity(stem.len());
    let mut last_was_underscore = false;
    for c in stem.chars() {
        let mapped = if c.is_whitespace() || c.is_control() || ILLEGAL_CHARS.contains(&c) {
            '_'
        } else {
            c
        };
        // Collapse whitespace runs; deliberate underscores in the input
        // are kept as-is
        if mapped == '_' && last_was_underscore && c.is_whitespace() {
            continue;
        }
        last_was_underscore = mapped == '_' && c.is_whitespace();
        sanitized.push(mapped);
    }

    if sanitized.is_empty() {
        sanitized = "unnamed".to_string();
    }

    match ext {
        Some(ext) => {
            let budget = max_length.saturating_sub(ext.chars().count() + 1).max(1);
            let stem: String = sanitized.chars().take(budget).collect();
            format!("{stem}.{ext}")
        }
        None => sanitized.chars().take(max_length).collect(),
    }
}

/// Split a name into (stem, extension) where the extension excludes the dot
///
/// A name with no dot, a leading dot only, or a dot followed by whitespace
/// has no extension.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && !ext.chars().any(|c| c.is_whitespace() || ILLEGAL_CHARS.contains(&c)) =>
        {
            (stem, Some(ext))
        }
        _ => (name, None),
    }
}

/// Variables available to the filename template
#[derive(Clone, Debug)]
pub struct TemplateVars<'a> {
    /// `{post_id}`
    pub post_id: &'a str,
    /// `{post_title}`
    pub post_title: &'a str,
    /// `{orig_name}`
    pub orig_name: &'a str,
    /// `{index}`, 1-based
    pub index: usize,
    /// `{total}`
    pub total: usize,
    /// `{creator_id}`
    pub creator_id: &'a str,
    /// `{creator_name}`
    pub creator_name: &'a str,
    /// `{service}`
    pub service: &'a str,
    /// `{date}`, YYYY-MM-DD
    pub date: &'a str,
}

impl TemplateVars<'_> {
    fn lookup(&self, key: &str) -> Option<String> {
        let value = match key {
            "post_id" => self.post_id.to_string(),
            "post_title" => self.post_title.to_string(),
            "orig_name" => self.orig_name.to_string(),
            "index" => self.index.to_string(),
            "total" => self.total.to_string(),
            "creator_id" => self.creator_id.to_string(),
            "creator_name" => self.creator_name.to_string(),
            "service" => self.service.to_string(),
            "date" => self.date.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Render a filename template, falling back to the default template when it
/// contains unknown or malformed placeholders
///
/// The output is unsanitized; callers pass it through [`sanitize_filename`].
pub fn render_template(template: &str, vars: &TemplateVars<'_>) -> String {
    match try_render(template, vars) {
        Some(rendered) => rendered,
        None => {
            tracing::warn!(template, "unknown placeholder in filename template, using default");
            // The default template only uses known placeholders
            try_render(DEFAULT_FILENAME_TEMPLATE, vars)
                .unwrap_or_else(|| format!("{}_{}", vars.post_id, vars.orig_name))
        }
    }
}

/// Substitute placeholders; None when the template references an unknown
/// placeholder or has unbalanced braces
fn try_render(template: &str, vars: &TemplateVars<'_>) -> Option<String> {
    if !KNOWN_PLACEHOLDERS
        .iter()
        .any(|p| template.contains(&format!("{{{p}}}")))
    {
        // A template with no recognized placeholder would name every file
        // identically; treat it like an unknown template
        return None;
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}')?;
        out.push_str(&vars.lookup(&after[..close])?);
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return None;
    }
    out.push_str(rest);
    Some(out)
}

/// Resolved on-disk placement for one file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Directory the file goes into
    pub folder: PathBuf,
    /// Final filename within that directory
    pub filename: String,
}

impl Placement {
    /// The full path
    pub fn path(&self) -> PathBuf {
        self.folder.join(&self.filename)
    }
}

/// Per-run filename and folder policy
///
/// One placer exists per run; its reservation set serializes path
/// resolution so no two tasks can target the same final path.
pub struct FilePlacer {
    creator_id: String,
    creator_name: String,
    service: String,
    template: String,
    strategy: FolderStrategy,
    auto_rename: bool,
    max_filename_length: usize,
    /// Paths handed out this run; collisions get a counter suffix
    reserved: Mutex<HashSet<PathBuf>>,
}

impl FilePlacer {
    /// Create a placer for one creator
    pub fn new(
        download: &DownloadConfig,
        service: impl Into<String>,
        creator_id: impl Into<String>,
        creator_name: impl Into<String>,
    ) -> Self {
        Self {
            creator_id: creator_id.into(),
            creator_name: creator_name.into(),
            service: service.into(),
            template: download.creator_filename_template.clone(),
            strategy: download.creator_folder_strategy,
            auto_rename: download.auto_rename_enabled,
            max_filename_length: download.max_filename_length,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// The creator folder name: `{creator_id}_{creator_name}`
    pub fn creator_folder_name(&self) -> String {
        format!("{}_{}", self.creator_id, self.creator_name)
    }

    /// Append the creator folder to `base` unless it already ends with it
    ///
    /// Idempotent: callers sometimes pass the run's base download folder and
    /// sometimes a path that already ends in the creator folder; the
    /// segment must appear exactly once either way.
    pub fn creator_folder(&self, base: &Path) -> PathBuf {
        let name = self.creator_folder_name();
        if base
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == name)
        {
            base.to_path_buf()
        } else {
            base.join(name)
        }
    }

    /// Resolve folder and filename for a file task
    ///
    /// The returned path is reserved for this task for the rest of the run;
    /// a later task resolving to the same path receives a ` (1)`, ` (2)` …
    /// counter suffix before the extension.
    pub fn place(&self, task: &FileTask, base: &Path) -> Placement {
        let creator_folder = self.creator_folder(base);
        let orig_name = task.orig_name();

        let folder = match self.strategy {
            FolderStrategy::PerPost => creator_folder.join(self.post_folder_name(task)),
            FolderStrategy::SingleFolder => creator_folder,
            FolderStrategy::ByFileType => {
                let ext = sanitize_filename(&orig_name, self.max_filename_length);
                let ext = match ext.rsplit_once('.') {
                    Some((_, e)) if !e.is_empty() => e.to_ascii_lowercase(),
                    _ => "other".to_string(),
                };
                creator_folder.join(ext)
            }
        };

        let vars = TemplateVars {
            post_id: &task.post_id,
            post_title: &task.post_title,
            orig_name: &orig_name,
            index: task.index + 1,
            total: task.total,
            creator_id: &self.creator_id,
            creator_name: &self.creator_name,
            service: &self.service,
            date: "",
        };

        let rendered = render_template(&self.template, &vars);
        let mut filename = sanitize_filename(&rendered, self.max_filename_length);

        // Keep the source extension even when the template drops {orig_name}
        let source_ext = split_extension(&orig_name).1;
        if let Some(ext) = source_ext
            && !filename.to_ascii_lowercase().ends_with(&format!(".{}", ext.to_ascii_lowercase()))
        {
            filename = format!("{filename}.{ext}");
        }

        if self.auto_rename {
            filename = format!("{}_{filename}", task.index + 1);
        }

        self.reserve_unique(folder, filename)
    }

    /// Strategy-dependent folder for a post's description text file
    pub fn description_folder(&self, base: &Path, post_id: &str, post_title: &str) -> PathBuf {
        let creator_folder = self.creator_folder(base);
        match self.strategy {
            FolderStrategy::PerPost => creator_folder.join(format!(
                "{post_id}_{}",
                sanitize_filename(post_title, self.max_filename_length)
            )),
            FolderStrategy::SingleFolder => creator_folder,
            FolderStrategy::ByFileType => creator_folder.join("txt"),
        }
    }

    fn post_folder_name(&self, task: &FileTask) -> String {
        format!(
            "{}_{}",
            task.post_id,
            sanitize_filename(&task.post_title, self.max_filename_length)
        )
    }

    /// Reserve a unique path, appending a counter suffix on collision
    fn reserve_unique(&self, folder: PathBuf, filename: String) -> Placement {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let candidate = folder.join(&filename);
        if reserved.insert(candidate) {
            return Placement { folder, filename };
        }

        let (stem, ext) = split_extension(&filename);
        for i in 1..=MAX_COLLISION_COUNTER {
            let numbered = match ext {
                Some(ext) => format!("{stem} ({i}).{ext}"),
                None => format!("{stem} ({i})"),
            };
            let candidate = folder.join(&numbered);
            if reserved.insert(candidate) {
                return Placement {
                    folder,
                    filename: numbered,
                };
            }
        }

        // 9999 collisions within one post is unreachable in practice
        Placement { folder, filename }
    }
}
