//! Built-in channels. Each adapter turns one site's pages or API into
//! [`AssetDescriptor`](crate::domain::AssetDescriptor)s and download operations.

pub mod hanime1;
pub mod iwara;
pub mod xpv;

use std::sync::Arc;

use scraper::{ElementRef, Selector};

use crate::auth::BearerToken;
use crate::error::ReelError;
use crate::fetch::FetchLayer;
use crate::media::MediaTool;
use crate::progress::ProgressSink;
use crate::registry::ChannelRegistry;
use crate::settings::SettingsStore;
use crate::store::CacheStore;

pub struct SiteContext {
    pub settings: Arc<SettingsStore>,
    pub cache: Arc<CacheStore>,
    pub fetch: Arc<FetchLayer>,
    pub media: Arc<dyn MediaTool>,
    pub token: Arc<BearerToken>,
    pub progress: Arc<dyn ProgressSink>,
}

pub fn register_builtin_channels(
    registry: &ChannelRegistry,
    context: &Arc<SiteContext>,
) -> Result<(), ReelError> {
    registry.try_register(xpv::channel(Arc::clone(context)))?;
    registry.try_register(iwara::channel(Arc::clone(context)))?;
    registry.try_register(hanime1::channel(Arc::clone(context)))?;
    Ok(())
}

pub(crate) fn selector(css: &str) -> Result<Selector, ReelError> {
    Selector::parse(css).map_err(|err| ReelError::Parse(format!("selector {css}: {err}")))
}

pub(crate) fn absolute_url(base: &str, href: &str) -> String {
    url::Url::parse(base)
        .and_then(|base| base.join(href))
        .map(|joined| joined.to_string())
        .unwrap_or_else(|_| href.to_string())
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn last_path_segment(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_relative_links() {
        assert_eq!(
            absolute_url("https://www.xpicvid.com", "/showinfo-1-2.html"),
            "https://www.xpicvid.com/showinfo-1-2.html"
        );
        assert_eq!(absolute_url("https://a.example/x/", "https://b.example/y"), "https://b.example/y");
    }

    #[test]
    fn file_name_from_url() {
        assert_eq!(last_path_segment("https://cdn/p/001.jpg?x=1").as_deref(), Some("001.jpg"));
        assert_eq!(last_path_segment("https://cdn/p/"), None);
    }
}
