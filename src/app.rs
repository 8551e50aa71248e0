use std::cmp::Reverse;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::auth::BearerToken;
use crate::config::AppPaths;
use crate::domain::{AssetDescriptor, DownloadTask, resolve_title_collisions};
use crate::error::ReelError;
use crate::fetch::{BrowserOptions, BypassClient, ClientOptions, FetchLayer, SharedBrowser};
use crate::library;
use crate::media::{MediaTool, ToolInfo, YtDlpTool};
use crate::orchestrator::{CompletionSink, Orchestrator, QueueStats, TaskRunner};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::ChannelRegistry;
use crate::settings::SettingsStore;
use crate::sites::{self, SiteContext, hanime1, iwara};
use crate::store::{CacheStore, ChannelCache};

/// New assets collected per favorite author before giving up on finding
/// an already downloaded one.
const UPDATE_WINDOW: usize = 5;

pub struct AppParts {
    pub settings: Arc<SettingsStore>,
    pub cache: Arc<CacheStore>,
    pub fetch: Arc<FetchLayer>,
    pub media: Arc<dyn MediaTool>,
    pub token: Arc<BearerToken>,
    pub progress: Arc<dyn ProgressSink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub hostname: String,
    pub download_root: String,
    pub latched: bool,
}

pub struct App {
    settings: Arc<SettingsStore>,
    cache: Arc<CacheStore>,
    registry: Arc<ChannelRegistry>,
    orchestrator: Orchestrator,
    sites: Arc<SiteContext>,
}

impl App {
    pub fn open(
        paths: &AppPaths,
        token: Option<String>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self, ReelError> {
        let settings = Arc::new(SettingsStore::load(paths.settings_file())?);
        let cache = Arc::new(CacheStore::load(paths.cache_file()));
        let snapshot = settings.snapshot();
        let primary = Arc::new(BypassClient::new(&ClientOptions::from_settings(&snapshot))?);
        let browser = Arc::new(SharedBrowser::chrome(BrowserOptions::from_settings(&snapshot)));
        Self::assemble(AppParts {
            settings,
            cache,
            fetch: Arc::new(FetchLayer::new(primary, browser)),
            media: Arc::new(YtDlpTool::new()),
            token: Arc::new(BearerToken::new(token)),
            progress,
        })
    }

    /// Registers the built-in channels and starts the download workers. A token
    /// saved by an earlier login is used when none was given.
    pub fn assemble(parts: AppParts) -> Result<Self, ReelError> {
        if !parts.token.is_set() {
            if let Some(saved) = parts.settings.snapshot().saved_token() {
                parts.token.set(saved);
            }
        }
        let sites = Arc::new(SiteContext {
            settings: Arc::clone(&parts.settings),
            cache: Arc::clone(&parts.cache),
            fetch: parts.fetch,
            media: parts.media,
            token: parts.token,
            progress: Arc::clone(&parts.progress),
        });
        let registry = Arc::new(ChannelRegistry::new(Arc::clone(&parts.settings)));
        sites::register_builtin_channels(&registry, &sites)?;

        let sink = Arc::new(LibrarySink {
            cache: Arc::clone(&parts.cache),
            progress: parts.progress,
        });
        let workers = parts.settings.snapshot().worker_count();
        let runner: Arc<dyn TaskRunner> = Arc::clone(&registry) as Arc<dyn TaskRunner>;
        let orchestrator = Orchestrator::start(workers, runner, sink)?;

        Ok(Self {
            settings: parts.settings,
            cache: parts.cache,
            registry,
            orchestrator,
            sites,
        })
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn media_info(&self) -> ToolInfo {
        self.sites.media.tool_info()
    }

    pub fn channels(&self) -> Vec<ChannelInfo> {
        let settings = self.settings.snapshot();
        self.registry
            .channel_names()
            .into_iter()
            .filter_map(|name| self.registry.get(&name))
            .map(|channel| {
                let hostname = settings.hostname(channel.hostname_key());
                let latched = crate::fetch::domain_of(&hostname)
                    .map(|domain| self.sites.fetch.is_latched(&domain))
                    .unwrap_or(false);
                ChannelInfo {
                    name: channel.name().to_string(),
                    hostname,
                    download_root: settings
                        .download_root(channel.download_path_key())
                        .into_string(),
                    latched,
                }
            })
            .collect()
    }

    pub fn search(&self, keyword: &str, channel_name: &str) -> Result<Vec<AssetDescriptor>, ReelError> {
        let channel = self
            .registry
            .get(channel_name)
            .ok_or_else(|| ReelError::UnknownChannel(channel_name.to_string()))?;
        let mut found = self.registry.discover(keyword, channel.name())?;
        self.reconcile(channel.name(), &mut found);
        info!(channel = %channel.name(), keyword, found = found.len(), "search finished");
        Ok(found)
    }

    fn reconcile(&self, channel: &str, assets: &mut [AssetDescriptor]) {
        for asset in assets.iter_mut() {
            self.cache.enrich(asset);
        }
        library::annotate_from_disk(assets);
        resolve_title_collisions(assets);
        library::refresh_legacy_titles(assets);
        if let Err(err) = self.cache.set_cache(channel, assets) {
            error!(channel, error = %err, "failed to update cache");
        }
    }

    pub fn enqueue(&self, task: DownloadTask) -> bool {
        self.orchestrator.enqueue(task)
    }

    pub fn download(&self, task: &DownloadTask) -> bool {
        self.registry.download(task)
    }

    pub fn get_cache(&self, channel: &str) -> ChannelCache {
        self.cache.get_cache(channel)
    }

    pub fn set_cache(&self, channel: &str, assets: &[AssetDescriptor]) -> Result<(), ReelError> {
        self.cache.set_cache(channel, assets)
    }

    /// Re-reads upload dates from detail pages. Only Hanime1 listings carry
    /// no dates, so other channels have nothing to refresh.
    pub fn refresh_dates(
        &self,
        channel_name: &str,
        assets: &mut [AssetDescriptor],
    ) -> Result<usize, ReelError> {
        let channel = self
            .registry
            .get(channel_name)
            .ok_or_else(|| ReelError::UnknownChannel(channel_name.to_string()))?;
        if channel.name() != hanime1::NAME {
            return Err(ReelError::NoOperation {
                channel: channel.name().to_string(),
                kind: "date refresh".to_string(),
            });
        }
        let changed = hanime1::refresh_dates(&self.sites, assets)?;
        resolve_title_collisions(assets);
        Ok(changed)
    }

    pub fn refresh_legacy_titles(&self, assets: &[AssetDescriptor]) -> usize {
        library::refresh_legacy_titles(assets)
    }

    /// New assets from the favorite authors of `channel_name`: newest first,
    /// stopping per author at the first one already on disk.
    pub fn check_updates(&self, channel_name: &str) -> Result<Vec<AssetDescriptor>, ReelError> {
        let channel = self
            .registry
            .get(channel_name)
            .ok_or_else(|| ReelError::UnknownChannel(channel_name.to_string()))?;
        let authors = self.settings.snapshot().favorites_for(channel.name());
        if authors.is_empty() {
            info!(channel = %channel.name(), "no favorite authors");
            return Ok(Vec::new());
        }

        let mut updates = Vec::new();
        for author in &authors {
            let mut found = match self.search(author, channel.name()) {
                Ok(found) => found,
                Err(err) => {
                    error!(author = %author, error = %err, "update check failed");
                    continue;
                }
            };
            found.sort_by_key(|asset| Reverse(asset.updated_timestamp()));
            let fresh = newest_not_downloaded(found);
            info!(author = %author, new = fresh.len(), "update check");
            updates.extend(fresh);
        }
        Ok(updates)
    }

    pub fn login(&self, email: &str, password: &str) -> Result<String, ReelError> {
        iwara::login(&self.sites, email, password)
    }

    pub fn logout(&self) -> Result<(), ReelError> {
        iwara::logout(&self.sites)
    }

    pub fn is_logged_in(&self) -> bool {
        self.sites.token.is_set()
    }

    pub fn pending(&self) -> usize {
        self.orchestrator.pending()
    }

    pub fn stats(&self) -> QueueStats {
        self.orchestrator.stats()
    }

    pub fn wait_idle(&self) {
        self.orchestrator.wait_idle();
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }
}

fn newest_not_downloaded(sorted: Vec<AssetDescriptor>) -> Vec<AssetDescriptor> {
    sorted
        .into_iter()
        .take_while(|asset| !library::is_downloaded(asset))
        .take(UPDATE_WINDOW)
        .collect()
}

struct LibrarySink {
    cache: Arc<CacheStore>,
    progress: Arc<dyn ProgressSink>,
}

impl CompletionSink for LibrarySink {
    fn completed(&self, task: &DownloadTask) {
        if let Some(asset) = task.as_asset() {
            if let Err(err) = self.cache.set_cache(asset.source(), std::slice::from_ref(asset)) {
                error!(error = %err, "failed to record download in cache");
            }
        }
        self.progress
            .event(ProgressEvent::message(format!("finished {}", task.label())));
    }
}
