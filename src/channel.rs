use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::domain::{AssetDescriptor, DownloadTask, TaskKind};
use crate::error::ReelError;
use crate::settings::Settings;

pub type DiscoveryOp = Arc<dyn Fn(&str) -> Result<Vec<AssetDescriptor>, ReelError> + Send + Sync>;
pub type DownloadOp = Arc<dyn Fn(&DownloadTask) -> Result<(), ReelError> + Send + Sync>;

#[derive(Clone)]
pub struct Channel {
    name: String,
    hostname_key: String,
    download_path_key: String,
    discovery: DiscoveryOp,
    operations: HashMap<TaskKind, DownloadOp>,
}

impl Channel {
    pub fn new<F>(name: &str, hostname_key: &str, download_path_key: &str, discovery: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<AssetDescriptor>, ReelError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            hostname_key: hostname_key.to_string(),
            download_path_key: download_path_key.to_string(),
            discovery: Arc::new(discovery),
            operations: HashMap::new(),
        }
    }

    pub fn with_operation<F>(mut self, kind: TaskKind, operation: F) -> Self
    where
        F: Fn(&DownloadTask) -> Result<(), ReelError> + Send + Sync + 'static,
    {
        self.operations.insert(kind, Arc::new(operation));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hostname_key(&self) -> &str {
        &self.hostname_key
    }

    pub fn download_path_key(&self) -> &str {
        &self.download_path_key
    }

    pub fn has_operation(&self, kind: TaskKind) -> bool {
        self.operations.contains_key(&kind)
    }

    pub fn discover(&self, keyword: &str) -> Result<Vec<AssetDescriptor>, ReelError> {
        (self.discovery)(keyword)
    }

    /// Operation for `kind`, falling back to the `Default` one.
    pub fn resolve_operation(&self, kind: TaskKind) -> Result<&DownloadOp, ReelError> {
        self.operations
            .get(&kind)
            .or_else(|| self.operations.get(&TaskKind::Default))
            .ok_or_else(|| ReelError::NoOperation {
                channel: self.name.clone(),
                kind: kind.to_string(),
            })
    }

    fn owns(&self, task: &DownloadTask) -> bool {
        task.source()
            .is_some_and(|source| source.eq_ignore_ascii_case(&self.name))
    }

    fn matches_host(&self, task: &DownloadTask, settings: &Settings) -> bool {
        if task.source().is_some() || task.as_asset().is_some() {
            return false;
        }
        let hostname = settings.hostname(&self.hostname_key);
        !hostname.is_empty() && task.url().contains(&hostname)
    }

    pub fn can_handle(&self, task: &DownloadTask, settings: &Settings) -> bool {
        self.owns(task) || (self.has_operation(TaskKind::Custom) && self.matches_host(task, settings))
    }

    /// Runs the matching operation. Errors are logged and reported as `false`.
    pub fn download(&self, task: &DownloadTask, settings: &Settings) -> bool {
        let operation = if self.owns(task) {
            self.resolve_operation(task.kind())
        } else if self.matches_host(task, settings) {
            self.operations
                .get(&TaskKind::Custom)
                .ok_or_else(|| ReelError::NoOperation {
                    channel: self.name.clone(),
                    kind: TaskKind::Custom.to_string(),
                })
        } else {
            warn!(channel = %self.name, task = %task.label(), "task does not belong to channel");
            return false;
        };

        let operation = match operation {
            Ok(operation) => operation,
            Err(err) => {
                error!(channel = %self.name, task = %task.label(), error = %err, "no operation");
                return false;
            }
        };
        debug!(channel = %self.name, task = %task.label(), kind = %task.kind(), "dispatching");
        match operation(task) {
            Ok(()) => true,
            Err(err) => {
                error!(channel = %self.name, task = %task.label(), error = %err, "download failed");
                false
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("hostname_key", &self.hostname_key)
            .field("download_path_key", &self.download_path_key)
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}
