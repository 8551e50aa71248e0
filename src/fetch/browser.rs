use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use headless_chrome::{Browser, LaunchOptions};
use tracing::{debug, info, warn};

use super::{BrowserFetcher, FetchedResponse};
use crate::error::ReelError;
use crate::settings::Settings;

const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default)]
pub struct BrowserOptions {
    pub executable: Option<PathBuf>,
    pub proxy: Option<String>,
    pub check_cert: bool,
}

impl BrowserOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let executable = settings.browser_path.trim();
        let proxy = settings.proxy.trim();
        Self {
            executable: (!executable.is_empty()).then(|| PathBuf::from(executable)),
            proxy: (!proxy.is_empty()).then(|| proxy.to_string()),
            check_cert: settings.check_cert,
        }
    }
}

pub trait BrowserSession: Send + Sync {
    /// Cheap round trip that fails once the process is gone.
    fn probe(&self) -> Result<(), ReelError>;
    fn render(&self, url: &str, marker: &str, timeout: Duration) -> Result<FetchedResponse, ReelError>;
}

pub trait BrowserLauncher: Send + Sync {
    fn launch(&self) -> Result<Arc<dyn BrowserSession>, ReelError>;
}

/// One lazily launched browser shared by every caller. A session that fails
/// its probe is dropped and a new one is launched in its place.
pub struct SharedBrowser {
    launcher: Arc<dyn BrowserLauncher>,
    session: Mutex<Option<Arc<dyn BrowserSession>>>,
}

impl SharedBrowser {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            session: Mutex::new(None),
        }
    }

    pub fn chrome(options: BrowserOptions) -> Self {
        Self::new(Arc::new(ChromeLauncher { options }))
    }

    fn acquire(&self) -> Result<Arc<dyn BrowserSession>, ReelError> {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = slot.as_ref() {
            match session.probe() {
                Ok(()) => return Ok(Arc::clone(session)),
                Err(err) => {
                    warn!(error = %err, "browser stopped responding, relaunching");
                    *slot = None;
                }
            }
        }
        let session = self.launcher.launch()?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }
}

impl BrowserFetcher for SharedBrowser {
    fn render(&self, url: &str, marker: &str, timeout: Duration) -> Result<FetchedResponse, ReelError> {
        self.acquire()?.render(url, marker, timeout)
    }
}

struct ChromeLauncher {
    options: BrowserOptions,
}

impl BrowserLauncher for ChromeLauncher {
    fn launch(&self) -> Result<Arc<dyn BrowserSession>, ReelError> {
        let options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((1366, 900)))
            .path(self.options.executable.clone())
            .proxy_server(self.options.proxy.as_deref())
            .ignore_certificate_errors(!self.options.check_cert)
            .idle_browser_timeout(IDLE_TIMEOUT)
            .build()
            .map_err(|err| ReelError::Browser(err.to_string()))?;
        let browser = Browser::new(options).map_err(|err| ReelError::Browser(err.to_string()))?;
        info!("headless browser launched");
        let session: Arc<dyn BrowserSession> = Arc::new(ChromeSession { browser });
        Ok(session)
    }
}

struct ChromeSession {
    browser: Browser,
}

impl BrowserSession for ChromeSession {
    fn probe(&self) -> Result<(), ReelError> {
        self.browser
            .get_version()
            .map(|_| ())
            .map_err(|err| ReelError::Browser(err.to_string()))
    }

    fn render(&self, url: &str, marker: &str, timeout: Duration) -> Result<FetchedResponse, ReelError> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|err| ReelError::Browser(err.to_string()))?;
        tab.set_default_timeout(timeout);

        let rendered = tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_for_element_with_custom_timeout(marker, timeout))
            .and_then(|_| tab.get_content());
        let final_url = tab.get_url();
        if let Err(err) = tab.close(true) {
            debug!(error = %err, "failed to close tab");
        }

        let body = rendered.map_err(|err| ReelError::Browser(format!("{url}: {err}")))?;
        debug!(url = %final_url, bytes = body.len(), "rendered");
        Ok(FetchedResponse {
            status: 200,
            url: final_url,
            body,
        })
    }
}
