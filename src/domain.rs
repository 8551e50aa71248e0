use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ReelError;

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/*?:"<>|]"#).expect("static regex"));
static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("static regex"));
static BRACKET_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[.*?\]\s*").expect("static regex"));

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Default,
    Video,
    Pic,
    Custom,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Default => write!(f, "default"),
            TaskKind::Video => write!(f, "video"),
            TaskKind::Pic => write!(f, "pic"),
            TaskKind::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = ReelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(TaskKind::Default),
            "video" => Ok(TaskKind::Video),
            "pic" => Ok(TaskKind::Pic),
            "custom" => Ok(TaskKind::Custom),
            other => Err(ReelError::Parse(format!("unknown task kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetDescriptor {
    source: String,
    pub id_or_url: String,
    pub title: String,
    pub normalized_title: String,
    pub author: String,
    pub updated_at: String,
    pub view_count: u64,
    pub download_dir: Utf8PathBuf,
    pub kind: TaskKind,
    pub listing_url: String,
}

impl AssetDescriptor {
    pub fn new(source: impl Into<String>, id_or_url: impl Into<String>, title: &str) -> Self {
        let mut descriptor = Self {
            source: source.into(),
            id_or_url: id_or_url.into().trim().to_string(),
            title: title.trim().to_string(),
            normalized_title: String::new(),
            author: String::new(),
            updated_at: String::new(),
            view_count: 0,
            download_dir: Utf8PathBuf::new(),
            kind: TaskKind::Default,
            listing_url: String::new(),
        };
        descriptor.refresh_normalized_title();
        descriptor
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = author.trim().to_string();
        self
    }

    pub fn with_updated_at(mut self, updated_at: &str) -> Self {
        self.set_updated_at(updated_at);
        self
    }

    pub fn with_view_count(mut self, view_count: u64) -> Self {
        self.view_count = view_count;
        self
    }

    pub fn with_download_root(mut self, root: &Utf8PathBuf) -> Self {
        self.download_dir = if self.author.is_empty() {
            root.clone()
        } else {
            root.join(sanitize_file_name(&self.author))
        };
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_listing_url(mut self, listing_url: &str) -> Self {
        self.listing_url = listing_url.trim().to_string();
        self
    }

    /// Sets the date (accepting full ISO timestamps) and recomputes the file name.
    pub fn set_updated_at(&mut self, updated_at: &str) {
        self.updated_at = normalize_date(updated_at);
        self.refresh_normalized_title();
    }

    pub fn refresh_normalized_title(&mut self) {
        self.normalized_title = normalized_title(&self.title, &self.updated_at);
    }

    pub fn undated_title(&self) -> String {
        sanitize_file_name(&self.title)
    }

    pub fn target_path(&self, extension: &str) -> Utf8PathBuf {
        self.download_dir
            .join(format!("{}.{extension}", self.normalized_title))
    }

    pub fn updated_timestamp(&self) -> i64 {
        chrono::NaiveDate::parse_from_str(&self.updated_at, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTask {
    pub url: String,
    pub source: Option<String>,
    pub kind: Option<TaskKind>,
}

impl UrlTask {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim().to_string(),
            source: None,
            kind: None,
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadTask {
    Asset(AssetDescriptor),
    Url(UrlTask),
}

impl DownloadTask {
    pub fn source(&self) -> Option<&str> {
        match self {
            DownloadTask::Asset(asset) => Some(asset.source()),
            DownloadTask::Url(task) => task.source.as_deref(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            DownloadTask::Asset(asset) => asset.kind,
            DownloadTask::Url(task) => task.kind.unwrap_or(TaskKind::Custom),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            DownloadTask::Asset(asset) => &asset.id_or_url,
            DownloadTask::Url(task) => &task.url,
        }
    }

    pub fn as_asset(&self) -> Option<&AssetDescriptor> {
        match self {
            DownloadTask::Asset(asset) => Some(asset),
            DownloadTask::Url(_) => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            DownloadTask::Asset(asset) => format!("{}:{}", asset.source(), asset.normalized_title),
            DownloadTask::Url(task) => task.url.clone(),
        }
    }
}

impl From<AssetDescriptor> for DownloadTask {
    fn from(value: AssetDescriptor) -> Self {
        DownloadTask::Asset(value)
    }
}

impl From<UrlTask> for DownloadTask {
    fn from(value: UrlTask) -> Self {
        DownloadTask::Url(value)
    }
}

pub fn sanitize_file_name(value: &str) -> String {
    UNSAFE_CHARS.replace_all(value.trim(), "_").into_owned()
}

pub fn normalized_title(title: &str, updated_at: &str) -> String {
    if updated_at.is_empty() {
        sanitize_file_name(title)
    } else {
        sanitize_file_name(&format!("[{updated_at}]{}", title.trim()))
    }
}

pub fn extract_date(text: &str) -> Option<String> {
    ISO_DATE.find(text).map(|m| m.as_str().to_string())
}

/// Reduces ISO timestamps such as `2024-01-02T03:04:05Z` to `2024-01-02`.
pub fn normalize_date(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return parsed.format("%Y-%m-%d").to_string();
    }
    extract_date(trimmed).unwrap_or_else(|| trimmed.to_string())
}

pub fn strip_bracket_prefix(value: &str) -> String {
    BRACKET_PREFIX.replace(value, "").into_owned()
}

/// Author embedded as `[author]` in a listing title, `unknown` otherwise.
pub fn author_from_title(title: &str) -> String {
    let start = title.find('[');
    let end = start.and_then(|start| title[start + 1..].find(']').map(|end| start + 1 + end));
    match (start, end) {
        (Some(start), Some(end)) => title[start + 1..end].to_string(),
        _ => "unknown".to_string(),
    }
}

/// Falls back to the undated title wherever two distinct keys of the same
/// author would share a file name.
pub fn resolve_title_collisions(descriptors: &mut [AssetDescriptor]) -> usize {
    let mut owners: HashMap<(String, String, String), HashSet<String>> = HashMap::new();
    for descriptor in descriptors.iter() {
        owners
            .entry((
                descriptor.source.clone(),
                descriptor.author.clone(),
                descriptor.normalized_title.clone(),
            ))
            .or_default()
            .insert(descriptor.id_or_url.clone());
    }

    let mut changed = 0;
    for descriptor in descriptors.iter_mut() {
        let key = (
            descriptor.source.clone(),
            descriptor.author.clone(),
            descriptor.normalized_title.clone(),
        );
        if owners.get(&key).map(|keys| keys.len() > 1).unwrap_or(false) {
            descriptor.normalized_title = descriptor.undated_title();
            changed += 1;
        }
    }
    changed
}
