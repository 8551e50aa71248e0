use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use regex::Regex;
use scraper::Html;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{SiteContext, absolute_url, element_text, last_path_segment, selector};
use crate::channel::Channel;
use crate::config::{MAX_PAGE, XPV};
use crate::domain::{AssetDescriptor, DownloadTask, TaskKind, author_from_title, sanitize_file_name};
use crate::error::ReelError;
use crate::fetch::{HttpRequest, origin_of};
use crate::library;
use crate::media::{self, MediaJob};
use crate::progress::{NoopProgress, ProgressEvent};
use crate::throttle::RateGate;

pub const NAME: &str = XPV.name;

const SEARCH_INTERVAL: Duration = Duration::from_millis(5500);
const RESULTS_PER_PAGE: usize = 60;
const PIC_WORKERS: usize = 5;
const SEARCH_CLASS_ID: &str = "21";
const VIDEO_ACCEPT: &str =
    "video/webm,video/ogg,video/*;q=0.9,application/ogg;q=0.7,audio/*;q=0.6,*/*;q=0.5";

const CUSTOM_KINDS: [(&str, TaskKind); 2] = [("moeupup", TaskKind::Pic), ("showinfo", TaskKind::Video)];

static SEARCH_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"searchid=(\d+)").expect("static regex"));
static THUMB_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d{4})/(\d{2})(\d{2})/").expect("static regex"));

pub fn channel(context: Arc<SiteContext>) -> Channel {
    let gate = Arc::new(RateGate::new(SEARCH_INTERVAL));
    let search_context = Arc::clone(&context);
    let default_context = Arc::clone(&context);
    let video_context = Arc::clone(&context);
    let pic_context = Arc::clone(&context);
    let custom_context = context;

    Channel::new(NAME, XPV.hostname_key, XPV.download_path_key, move |keyword| {
        search(&search_context, &gate, keyword)
    })
    .with_operation(TaskKind::Default, move |task| download_video(&default_context, task))
    .with_operation(TaskKind::Video, move |task| {
        download_community_video(&video_context, task.url())
    })
    .with_operation(TaskKind::Pic, move |task| download_gallery(&pic_context, task.url()))
    .with_operation(TaskKind::Custom, move |task| download_custom(&custom_context, task))
}

pub fn classify_url(url: &str) -> Option<TaskKind> {
    CUSTOM_KINDS
        .iter()
        .find(|(fragment, _)| url.contains(fragment))
        .map(|(_, kind)| *kind)
}

fn search(context: &SiteContext, gate: &RateGate, keyword: &str) -> Result<Vec<AssetDescriptor>, ReelError> {
    gate.wait();
    let settings = context.settings.snapshot();
    let host = settings.hostname(XPV.hostname_key);
    let root = settings.download_root(XPV.download_path_key);

    let form_url = format!("{host}/e/search/index.php");
    info!(url = %form_url, keyword, "xpv search");
    let request = HttpRequest::post_form(
        &form_url,
        &[
            ("classid", SEARCH_CLASS_ID),
            ("show", "title,text,keyboard,ftitle"),
            ("keyboard", keyword),
            ("Submit", ""),
        ],
    );
    let response = context.fetch.send_direct(&request)?;
    let search_id = parse_search_id(&response.url)?;

    let mut found = Vec::new();
    for page in 0..MAX_PAGE {
        let listing_url = format!("{host}/e/search/result/index.php?page={page}&searchid={search_id}");
        debug!(url = %listing_url, page, "xpv result page");
        let html = context.fetch.fetch_page(&listing_url, "div.list-col")?;
        let items = parse_results(&html, &host, &listing_url, &root)?;
        let count = items.len();
        found.extend(items);
        if count < RESULTS_PER_PAGE {
            return Ok(found);
        }
    }
    warn!(keyword, pages = MAX_PAGE, "xpv search hit the page limit");
    Ok(found)
}

pub fn parse_search_id(redirect_url: &str) -> Result<String, ReelError> {
    SEARCH_ID
        .captures(redirect_url)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
        .ok_or_else(|| ReelError::Parse(format!("no search id in {redirect_url}")))
}

pub fn parse_results(
    html: &str,
    host: &str,
    listing_url: &str,
    root: &Utf8PathBuf,
) -> Result<Vec<AssetDescriptor>, ReelError> {
    let document = Html::parse_document(html);
    let item = selector("div.list-col")?;
    let link = selector("a[href]")?;
    let thumb = selector("img[data-src]")?;

    let mut found = Vec::new();
    for element in document.select(&item) {
        let Some(anchor) = element.select(&link).next() else {
            continue;
        };
        let href = anchor.value().attr("href").unwrap_or_default();
        let title = anchor.value().attr("title").unwrap_or_default();
        let updated_at = anchor
            .select(&thumb)
            .next()
            .and_then(|img| img.value().attr("data-src"))
            .and_then(thumbnail_date)
            .unwrap_or_default();
        found.push(
            AssetDescriptor::new(NAME, absolute_url(host, href), title)
                .with_author(&author_from_title(title))
                .with_updated_at(&updated_at)
                .with_listing_url(listing_url)
                .with_download_root(root),
        );
    }
    Ok(found)
}

/// `/2025/1107/` in a thumbnail path -> `2025-11-07`.
pub fn thumbnail_date(path: &str) -> Option<String> {
    let captures = THUMB_DATE.captures(path)?;
    Some(format!("{}-{}-{}", &captures[1], &captures[2], &captures[3]))
}

pub fn extract_content_url(html: &str) -> Result<String, ReelError> {
    let document = Html::parse_document(html);
    let script = document
        .select(&selector("script")?)
        .next()
        .ok_or_else(|| ReelError::Parse("page has no script tag".to_string()))?;
    let raw: String = script
        .text()
        .collect::<String>()
        .trim()
        .chars()
        .filter(|ch| !ch.is_control() && *ch != '\\')
        .collect();
    let metadata: Value = serde_json::from_str(&raw)
        .map_err(|err| ReelError::Parse(format!("script metadata: {err}")))?;
    metadata
        .get("contentUrl")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ReelError::Parse("metadata has no contentUrl".to_string()))
}

fn download_video(context: &SiteContext, task: &DownloadTask) -> Result<(), ReelError> {
    let asset = task.as_asset().ok_or_else(|| {
        ReelError::Parse(format!("{} is not a discovered video", task.url()))
    })?;
    let target = library::video_path(asset);
    if target.exists() {
        info!(path = %target, "already downloaded");
        return Ok(());
    }

    let html = context.fetch.fetch_page(&asset.id_or_url, "script")?;
    let content_url = extract_content_url(&html)?;
    debug!(content_url = %content_url, "resolved video url");
    let referer = format!("{}/", origin_of(&asset.id_or_url)?);
    let job = MediaJob::new(&content_url, target.clone())
        .with_referer(&referer)
        .with_header("Accept", VIDEO_ACCEPT)
        .with_header("Range", "bytes=0-")
        .with_check_cert(context.settings.snapshot().check_cert);
    context.media.fetch(&job)?;
    context
        .progress
        .event(ProgressEvent::message(format!("saved {}", target)));
    Ok(())
}

pub struct CommunityPost {
    pub video_url: String,
    pub title: String,
}

pub fn parse_community_post(html: &str, page_url: &str) -> Result<CommunityPost, ReelError> {
    let document = Html::parse_document(html);
    let source = document
        .select(&selector("video source[src]")?)
        .next()
        .and_then(|element| element.value().attr("src"))
        .filter(|src| !src.is_empty())
        .ok_or_else(|| ReelError::Parse("post has no video source".to_string()))?;
    let video_url = absolute_url(page_url, source);
    let title = document
        .select(&selector("div.tweet-content")?)
        .next()
        .map(element_text)
        .filter(|title| !title.is_empty())
        .or_else(|| {
            last_path_segment(&video_url)
                .map(|name| name.split('.').next().unwrap_or_default().to_string())
        })
        .unwrap_or_else(|| "video".to_string());
    Ok(CommunityPost { video_url, title })
}

fn download_community_video(context: &SiteContext, page_url: &str) -> Result<(), ReelError> {
    let html = context.fetch.fetch_page(page_url, "video")?;
    let post = parse_community_post(&html, page_url)?;
    let settings = context.settings.snapshot();
    let target = settings
        .custom_download_path
        .join(format!("{}.{}", sanitize_file_name(&post.title), library::VIDEO_EXTENSION));
    if target.exists() {
        info!(path = %target, "already downloaded");
        return Ok(());
    }

    let headers = vec![
        ("Referer".to_string(), format!("{}/", origin_of(page_url)?)),
        ("Accept".to_string(), VIDEO_ACCEPT.to_string()),
        ("Range".to_string(), "bytes=0-".to_string()),
    ];
    context
        .fetch
        .download_to(&post.video_url, &headers, &target, context.progress.as_ref())?;
    media::validate_video_file(&target)?;
    info!(path = %target, "community video saved");
    Ok(())
}

pub struct Gallery {
    pub title: String,
    pub images: Vec<String>,
}

pub fn parse_gallery(html: &str, page_url: &str) -> Result<Gallery, ReelError> {
    let document = Html::parse_document(html);
    let images = document
        .select(&selector("img.comic_img[data-src]")?)
        .filter_map(|img| img.value().attr("data-src"))
        .filter(|src| !src.is_empty())
        .map(|src| absolute_url(page_url, src))
        .collect();
    let title = document
        .select(&selector("div.panel-heading div.pull-left")?)
        .next()
        .map(element_text)
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());
    Ok(Gallery { title, images })
}

fn download_gallery(context: &SiteContext, page_url: &str) -> Result<(), ReelError> {
    let html = context.fetch.fetch_page(page_url, "img.comic_img")?;
    let gallery = parse_gallery(&html, page_url)?;
    if gallery.images.is_empty() {
        return Err(ReelError::Parse(format!("no images on {page_url}")));
    }
    let settings = context.settings.snapshot();
    let save_dir = settings
        .download_root(XPV.download_path_key)
        .join(&settings.xpv_pic_relative_path)
        .join(sanitize_file_name(&gallery.title));
    fs::create_dir_all(save_dir.as_std_path())
        .map_err(|err| ReelError::Filesystem(err.to_string()))?;
    info!(title = %gallery.title, images = gallery.images.len(), dir = %save_dir, "downloading gallery");

    let headers = vec![(
        "Referer".to_string(),
        format!("{}/", settings.hostname(XPV.hostname_key)),
    )];
    let next = AtomicUsize::new(0);
    let saved = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..PIC_WORKERS.min(gallery.images.len()) {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(url) = gallery.images.get(index) else {
                        break;
                    };
                    let file_name =
                        last_path_segment(url).unwrap_or_else(|| format!("image_{index}.jpg"));
                    let path = save_dir.join(file_name);
                    if path.exists() {
                        saved.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    match context.fetch.download_to(url, &headers, &path, &NoopProgress) {
                        Ok(_) => {
                            saved.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => warn!(url = %url, error = %err, "image download failed"),
                    }
                }
            });
        }
    });

    let saved = saved.into_inner();
    context.progress.event(ProgressEvent::message(format!(
        "{}: {saved}/{} images",
        gallery.title,
        gallery.images.len()
    )));
    if saved == 0 {
        return Err(ReelError::Transport(format!("no image of {page_url} could be saved")));
    }
    Ok(())
}

fn download_custom(context: &SiteContext, task: &DownloadTask) -> Result<(), ReelError> {
    match classify_url(task.url()) {
        Some(TaskKind::Pic) => download_gallery(context, task.url()),
        Some(TaskKind::Video) => download_community_video(context, task.url()),
        _ => Err(ReelError::Parse(format!("unrecognized xpv link: {}", task.url()))),
    }
}
