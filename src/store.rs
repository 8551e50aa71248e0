use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::sync::{Mutex, PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::domain::{AssetDescriptor, normalized_title};
use crate::error::ReelError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub normalized_title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub view_count: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub download_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub listing_url: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn take_if_set(current: &mut String, incoming: &str) {
    if !incoming.is_empty() {
        *current = incoming.to_string();
    }
}

impl CacheRecord {
    pub fn from_descriptor(descriptor: &AssetDescriptor) -> Self {
        Self {
            title: descriptor.title.clone(),
            normalized_title: descriptor.normalized_title.clone(),
            author: descriptor.author.clone(),
            updated_at: descriptor.updated_at.clone(),
            view_count: descriptor.view_count,
            download_dir: descriptor.download_dir.to_string(),
            listing_url: descriptor.listing_url.clone(),
            extra: BTreeMap::new(),
        }
    }

    /// Folds `incoming` into `self`; a field is replaced only when the
    /// incoming value is non-empty.
    pub fn merge(&mut self, incoming: &CacheRecord) {
        take_if_set(&mut self.title, &incoming.title);
        take_if_set(&mut self.normalized_title, &incoming.normalized_title);
        take_if_set(&mut self.author, &incoming.author);
        take_if_set(&mut self.updated_at, &incoming.updated_at);
        take_if_set(&mut self.download_dir, &incoming.download_dir);
        take_if_set(&mut self.listing_url, &incoming.listing_url);
        if incoming.view_count != 0 {
            self.view_count = incoming.view_count;
        }
        // An undated incoming title must not hide a date kept from before.
        if incoming.updated_at.is_empty() && !self.updated_at.is_empty() {
            self.normalized_title = normalized_title(&self.title, &self.updated_at);
        }
        for (key, value) in &incoming.extra {
            if !is_blank(value) {
                self.extra.insert(key.clone(), value.clone());
            }
        }
    }
}

pub type ChannelCache = BTreeMap<String, CacheRecord>;

pub struct CacheStore {
    path: Utf8PathBuf,
    entries: RwLock<BTreeMap<String, ChannelCache>>,
    write_lock: Mutex<()>,
}

impl CacheStore {
    pub fn load(path: Utf8PathBuf) -> Self {
        info!(path = %path, "loading cache");
        let entries = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "cache file is malformed, starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %err, "cache file unreadable, starting empty");
                }
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn get_cache(&self, channel: &str) -> ChannelCache {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_record(&self, channel: &str, key: &str) -> Option<CacheRecord> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .and_then(|records| records.get(key))
            .cloned()
    }

    pub fn set_cache(&self, channel: &str, descriptors: &[AssetDescriptor]) -> Result<(), ReelError> {
        self.merge_records(
            channel,
            descriptors.iter().map(|descriptor| {
                (
                    descriptor.id_or_url.clone(),
                    CacheRecord::from_descriptor(descriptor),
                )
            }),
        )
    }

    pub fn merge_records<I>(&self, channel: &str, records: I) -> Result<(), ReelError>
    where
        I: IntoIterator<Item = (String, CacheRecord)>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let channel_entries = entries.entry(channel.to_string()).or_default();
            for (key, record) in records {
                channel_entries.entry(key).or_default().merge(&record);
            }
        }
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        write_json_atomic(&self.path, &*entries)?;
        debug!(channel, path = %self.path, "cache saved");
        Ok(())
    }

    /// Fills the empty fields of `descriptor` from its cached record.
    /// Returns whether anything changed.
    pub fn enrich(&self, descriptor: &mut AssetDescriptor) -> bool {
        let Some(record) = self.get_record(descriptor.source(), &descriptor.id_or_url) else {
            return false;
        };
        let mut changed = false;
        if descriptor.title.is_empty() && !record.title.is_empty() {
            descriptor.title = record.title.clone();
            changed = true;
        }
        if descriptor.author.is_empty() && !record.author.is_empty() {
            descriptor.author = record.author.clone();
            changed = true;
        }
        if descriptor.view_count == 0 && record.view_count != 0 {
            descriptor.view_count = record.view_count;
            changed = true;
        }
        if descriptor.download_dir.as_str().is_empty() && !record.download_dir.is_empty() {
            descriptor.download_dir = Utf8PathBuf::from(&record.download_dir);
            changed = true;
        }
        if descriptor.listing_url.is_empty() && !record.listing_url.is_empty() {
            descriptor.listing_url = record.listing_url.clone();
            changed = true;
        }
        if descriptor.updated_at.is_empty() && !record.updated_at.is_empty() {
            descriptor.set_updated_at(&record.updated_at);
            changed = true;
        } else if changed {
            descriptor.refresh_normalized_title();
        }
        changed
    }
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Utf8Path, value: &T) -> Result<(), ReelError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| ReelError::Filesystem(err.to_string()))?;
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| ReelError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".reelsync")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| ReelError::Filesystem(err.to_string()))?;
    temp.write_all(&content)
        .map_err(|err| ReelError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| ReelError::Filesystem(err.to_string()))?;
    Ok(())
}
