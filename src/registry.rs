use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, info, warn};

use crate::channel::Channel;
use crate::domain::{AssetDescriptor, DownloadTask};
use crate::error::ReelError;
use crate::orchestrator::TaskRunner;
use crate::settings::SettingsStore;

/// Registered channels in registration order. Names compare case-insensitively.
pub struct ChannelRegistry {
    settings: Arc<SettingsStore>,
    channels: RwLock<Vec<Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            channels: RwLock::new(Vec::new()),
        }
    }

    /// Inserts `channel`, replacing any channel of the same name in place.
    /// The replaced channel is returned.
    pub fn register(&self, channel: Channel) -> Option<Arc<Channel>> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let channel = Arc::new(channel);
        match channels
            .iter()
            .position(|existing| existing.name().eq_ignore_ascii_case(channel.name()))
        {
            Some(index) => {
                warn!(channel = %channel.name(), "channel re-registered, replacing previous");
                Some(std::mem::replace(&mut channels[index], channel))
            }
            None => {
                info!(channel = %channel.name(), "channel registered");
                channels.push(channel);
                None
            }
        }
    }

    pub fn try_register(&self, channel: Channel) -> Result<(), ReelError> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels
            .iter()
            .any(|existing| existing.name().eq_ignore_ascii_case(channel.name()))
        {
            return Err(ReelError::DuplicateChannel(channel.name().to_string()));
        }
        info!(channel = %channel.name(), "channel registered");
        channels.push(Arc::new(channel));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|channel| channel.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|channel| channel.name().to_string())
            .collect()
    }

    pub fn discover(&self, keyword: &str, channel_name: &str) -> Result<Vec<AssetDescriptor>, ReelError> {
        let channel = self
            .get(channel_name)
            .ok_or_else(|| ReelError::UnknownChannel(channel_name.to_string()))?;
        channel.discover(keyword)
    }

    /// Discovery results, or an empty list when the channel is unknown or
    /// discovery fails.
    pub fn search(&self, keyword: &str, channel_name: &str) -> Vec<AssetDescriptor> {
        match self.discover(keyword, channel_name) {
            Ok(found) => {
                info!(channel = %channel_name, keyword, found = found.len(), "search finished");
                found
            }
            Err(err) => {
                error!(channel = %channel_name, keyword, error = %err, "search failed");
                Vec::new()
            }
        }
    }

    /// Owning channel of `task`: the declared source first, then the first
    /// channel in registration order that claims it.
    pub fn resolve(&self, task: &DownloadTask) -> Option<Arc<Channel>> {
        if let Some(channel) = task.source().and_then(|source| self.get(source)) {
            return Some(channel);
        }
        let settings = self.settings.snapshot();
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|channel| channel.can_handle(task, &settings))
            .cloned()
    }

    pub fn download(&self, task: &DownloadTask) -> bool {
        let Some(channel) = self.resolve(task) else {
            error!(task = %task.label(), "no channel can handle task");
            return false;
        };
        let settings = self.settings.snapshot();
        channel.download(task, &settings)
    }
}

impl TaskRunner for ChannelRegistry {
    fn run(&self, task: &DownloadTask) -> bool {
        self.download(task)
    }
}
