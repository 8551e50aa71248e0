use camino::{Utf8Path, Utf8PathBuf};
use directories::{BaseDirs, ProjectDirs};

use crate::error::ReelError;

pub const SCHEMA_VERSION: &str = "1.0.1";
pub const HOME_ENV: &str = "REELSYNC_HOME";
pub const TOKEN_ENV: &str = "REELSYNC_TOKEN";

pub const MAX_PAGE: usize = 20;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy)]
pub struct ChannelDefaults {
    pub name: &'static str,
    pub hostname_key: &'static str,
    pub download_path_key: &'static str,
    pub default_hostname: &'static str,
    pub default_download_dir: &'static str,
    pub api_hostname: Option<(&'static str, &'static str)>,
}

pub const XPV: ChannelDefaults = ChannelDefaults {
    name: "Xpv",
    hostname_key: "Xpv_Hostname",
    download_path_key: "Xpv_Download_Path",
    default_hostname: "https://www.xpicvid.com",
    default_download_dir: "Xpv_Downloads",
    api_hostname: None,
};

pub const IWARA: ChannelDefaults = ChannelDefaults {
    name: "Iwara",
    hostname_key: "Iwara_Hostname",
    download_path_key: "Iwara_Download_Path",
    default_hostname: "https://www.iwara.tv",
    default_download_dir: "Iwara_Downloads",
    api_hostname: Some(("Iwara_API_Hostname", "https://api.iwara.tv")),
};

pub const HANIME1: ChannelDefaults = ChannelDefaults {
    name: "Hanime1",
    hostname_key: "Hanime1_Hostname",
    download_path_key: "Hanime1_Download_Path",
    default_hostname: "https://hanime1.me",
    default_download_dir: "Hanime1_Downloads",
    api_hostname: None,
};

pub const BUILTIN_CHANNELS: [ChannelDefaults; 3] = [XPV, IWARA, HANIME1];

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: Utf8PathBuf,
}

impl AppPaths {
    /// Resolves the data directory: explicit override, then `REELSYNC_HOME`,
    /// then the platform config directory.
    pub fn resolve(data_dir: Option<&str>) -> Result<Self, ReelError> {
        if let Some(dir) = data_dir {
            return Ok(Self::new(Utf8PathBuf::from(dir)));
        }
        if let Ok(dir) = std::env::var(HOME_ENV) {
            if !dir.trim().is_empty() {
                return Ok(Self::new(Utf8PathBuf::from(dir.trim())));
            }
        }
        let dirs = ProjectDirs::from("", "", "reelsync").ok_or_else(|| {
            ReelError::Filesystem("unable to resolve config directory".to_string())
        })?;
        let data_dir = Utf8PathBuf::from_path_buf(dirs.config_dir().to_path_buf())
            .map_err(|_| ReelError::Filesystem("invalid config path".to_string()))?;
        Ok(Self::new(data_dir))
    }

    pub fn new(data_dir: Utf8PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn settings_file(&self) -> Utf8PathBuf {
        self.data_dir
            .join(format!("reelsync_settings_{SCHEMA_VERSION}.json"))
    }

    pub fn cache_file(&self) -> Utf8PathBuf {
        self.data_dir
            .join(format!("reelsync_cache_{SCHEMA_VERSION}.json"))
    }
}

/// Home directory used for default download roots; falls back to the
/// working directory when no home can be resolved.
pub fn home_dir() -> Utf8PathBuf {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."))
}
