use std::sync::Arc;

use camino::Utf8PathBuf;
use scraper::Html;
use tracing::{debug, error, info, warn};

use super::{SiteContext, absolute_url, element_text, selector};
use crate::channel::Channel;
use crate::config::{HANIME1, MAX_PAGE};
use crate::domain::{AssetDescriptor, DownloadTask, TaskKind, author_from_title, extract_date};
use crate::error::ReelError;
use crate::library;
use crate::media::MediaJob;
use crate::progress::ProgressEvent;

pub const NAME: &str = HANIME1.name;

const RESULTS_PER_PAGE: usize = 60;
const ITEM_MARKER: &str = "div.video-item-container";
const DETAILS_MARKER: &str = "div.video-details-wrapper";
const SORT_NEWEST: &str = "最新上傳";

pub fn channel(context: Arc<SiteContext>) -> Channel {
    let search_context = Arc::clone(&context);
    Channel::new(NAME, HANIME1.hostname_key, HANIME1.download_path_key, move |keyword| {
        search(&search_context, keyword)
    })
    .with_operation(TaskKind::Default, move |task| download(&context, task))
}

pub fn search_url(host: &str, keyword: &str, page: usize) -> Result<String, ReelError> {
    let page = page.to_string();
    url::Url::parse_with_params(
        &format!("{host}/search"),
        [
            ("query", keyword),
            ("type", ""),
            ("genre", ""),
            ("sort", SORT_NEWEST),
            ("date", ""),
            ("duration", ""),
            ("page", page.as_str()),
        ],
    )
    .map(|url| url.to_string())
    .map_err(|err| ReelError::InvalidUrl(format!("{host}: {err}")))
}

fn search(context: &SiteContext, keyword: &str) -> Result<Vec<AssetDescriptor>, ReelError> {
    let settings = context.settings.snapshot();
    let host = settings.hostname(HANIME1.hostname_key);
    let root = settings.download_root(HANIME1.download_path_key);

    let mut found = Vec::new();
    for page in 1..=MAX_PAGE {
        let listing_url = search_url(&host, keyword, page)?;
        debug!(url = %listing_url, page, "hanime1 result page");
        let html = match context.fetch.fetch_page(&listing_url, ITEM_MARKER) {
            Ok(html) => html,
            Err(err) if page > 1 => {
                warn!(page, error = %err, "hanime1 page failed, keeping earlier pages");
                return Ok(found);
            }
            Err(err) => return Err(err),
        };
        let items = parse_results(&html, &host, &listing_url, &root)?;
        let count = items.len();
        found.extend(items);
        if count < RESULTS_PER_PAGE {
            info!(keyword, found = found.len(), "hanime1 search finished");
            return Ok(found);
        }
    }
    warn!(keyword, pages = MAX_PAGE, "hanime1 search hit the page limit");
    Ok(found)
}

pub fn parse_results(
    html: &str,
    host: &str,
    listing_url: &str,
    root: &Utf8PathBuf,
) -> Result<Vec<AssetDescriptor>, ReelError> {
    let document = Html::parse_document(html);
    let item = selector(ITEM_MARKER)?;
    let link = selector("a[href]")?;

    let mut found = Vec::new();
    for element in document.select(&item) {
        let Some(href) = element
            .select(&link)
            .next()
            .and_then(|anchor| anchor.value().attr("href"))
        else {
            continue;
        };
        let title = element.value().attr("title").unwrap_or_default();
        found.push(
            AssetDescriptor::new(NAME, absolute_url(host, href), title)
                .with_author(&author_from_title(title))
                .with_listing_url(listing_url)
                .with_download_root(root),
        );
    }
    Ok(found)
}

pub fn parse_detail_date(html: &str) -> Result<Option<String>, ReelError> {
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector(DETAILS_MARKER)?)
        .map(element_text)
        .find_map(|text| extract_date(&text)))
}

fn parse_page_title(html: &str) -> Result<String, ReelError> {
    let document = Html::parse_document(html);
    let title = document
        .select(&selector("title")?)
        .next()
        .map(element_text)
        .unwrap_or_default();
    Ok(title
        .split(" - ")
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

fn resolve_asset(context: &SiteContext, task: &DownloadTask) -> Result<AssetDescriptor, ReelError> {
    if let Some(asset) = task.as_asset() {
        return Ok(asset.clone());
    }
    let settings = context.settings.snapshot();
    let html = context.fetch.fetch_page(task.url(), DETAILS_MARKER)?;
    let title = parse_page_title(&html)?;
    let mut asset = AssetDescriptor::new(NAME, task.url(), &title)
        .with_author(&author_from_title(&title))
        .with_download_root(&settings.download_root(HANIME1.download_path_key));
    if let Some(date) = parse_detail_date(&html)? {
        asset.set_updated_at(&date);
    }
    Ok(asset)
}

fn detail_date(context: &SiteContext, url: &str) -> Option<String> {
    let date = context
        .fetch
        .fetch_page(url, DETAILS_MARKER)
        .and_then(|html| parse_detail_date(&html));
    match date {
        Ok(Some(date)) => Some(date),
        Ok(None) => {
            warn!(url, "detail page carries no date");
            None
        }
        Err(err) => {
            warn!(url, error = %err, "detail page unavailable");
            None
        }
    }
}

fn fill_date(context: &SiteContext, asset: &mut AssetDescriptor) {
    if !asset.updated_at.is_empty() {
        return;
    }
    let Some(date) = detail_date(context, &asset.id_or_url) else {
        return;
    };
    asset.set_updated_at(&date);
    if let Err(err) = library::rename_legacy_file(asset) {
        error!(title = %asset.title, error = %err, "legacy rename failed");
    }
    if let Err(err) = context.cache.set_cache(NAME, std::slice::from_ref(asset)) {
        error!(error = %err, "failed to record date in cache");
    }
}

/// Re-reads every Hanime1 asset's date from its detail page, records the
/// batch in the cache, then renames files saved under an older title.
/// Returns how many dates changed.
pub fn refresh_dates(context: &SiteContext, assets: &mut [AssetDescriptor]) -> Result<usize, ReelError> {
    let mut changed = 0;
    for asset in assets.iter_mut().filter(|asset| asset.source() == NAME) {
        let Some(date) = detail_date(context, &asset.id_or_url) else {
            continue;
        };
        if date != asset.updated_at {
            asset.set_updated_at(&date);
            changed += 1;
        }
        debug!(title = %asset.title, date = %asset.updated_at, "hanime1 date refreshed");
    }
    let batch: Vec<_> = assets
        .iter()
        .filter(|asset| asset.source() == NAME)
        .cloned()
        .collect();
    context.cache.set_cache(NAME, &batch)?;
    library::refresh_legacy_titles(&batch);
    info!(assets = batch.len(), changed, "hanime1 dates refreshed");
    Ok(changed)
}

fn download(context: &SiteContext, task: &DownloadTask) -> Result<(), ReelError> {
    let mut asset = resolve_asset(context, task)?;
    fill_date(context, &mut asset);

    let target = library::video_path(&asset);
    if target.exists() {
        info!(path = %target, "already downloaded");
        return Ok(());
    }
    let settings = context.settings.snapshot();
    let referer = format!("{}/", settings.hostname(HANIME1.hostname_key));
    let job = MediaJob::new(&asset.id_or_url, target.clone())
        .with_referer(&referer)
        .with_check_cert(settings.check_cert);
    context.media.fetch(&job)?;
    context
        .progress
        .event(ProgressEvent::message(format!("saved {target}")));
    Ok(())
}
