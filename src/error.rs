use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ReelError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("{domain} blocked the request with status {status}")]
    Blocked { domain: String, status: u16 },

    #[error("{url} returned status {status}")]
    Status { status: u16, url: String },

    #[error("browser automation failed: {0}")]
    Browser(String),

    #[error("unexpected page shape: {0}")]
    Parse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read settings file at {0}")]
    SettingsRead(Utf8PathBuf),

    #[error("failed to parse settings: {0}")]
    SettingsParse(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel already registered: {0}")]
    DuplicateChannel(String),

    #[error("channel {channel} has no operation for {kind}")]
    NoOperation { channel: String, kind: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("media tool failed: {0}")]
    ToolFailed(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("failed to start download worker: {0}")]
    Worker(String),
}
