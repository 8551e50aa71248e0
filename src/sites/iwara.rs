use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::SiteContext;
use crate::auth;
use crate::channel::Channel;
use crate::config::IWARA;
use crate::domain::{AssetDescriptor, DownloadTask, TaskKind};
use crate::error::ReelError;
use crate::fetch::HttpRequest;
use crate::library;
use crate::settings::Settings;

pub const NAME: &str = IWARA.name;
pub const API_HOSTNAME_KEY: &str = "Iwara_API_Hostname";

const SHA_POSTFIX: &str = "_5nFp9kmbNnHdAFhaqMvt";
const VIDEOS_PER_PAGE: usize = 32;
const MAX_VIDEO_PAGES: usize = 100;
const QUALITY_ORDER: [&str; 5] = ["Source", "1080", "720", "480", "360"];

static VIDEO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/video/([A-Za-z0-9]+)").expect("static regex"));

#[derive(Debug, Clone, Deserialize)]
pub struct IwaraUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IwaraVideo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub user: Option<IwaraUser>,
    #[serde(default)]
    pub num_views: u64,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoDetail {
    #[serde(flatten)]
    video: IwaraVideo,
    file_url: Option<String>,
    file: Option<FileRef>,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Resource {
    pub name: String,
    pub src: ResourceSource,
    #[serde(rename = "type", default)]
    pub mime: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSource {
    pub download: String,
}

pub fn channel(context: Arc<SiteContext>) -> Channel {
    let search_context = Arc::clone(&context);
    Channel::new(NAME, IWARA.hostname_key, IWARA.download_path_key, move |keyword| {
        search(&search_context, keyword)
    })
    .with_operation(TaskKind::Default, move |task| download(&context, task))
}

/// Logs in against the configured API host. The token is kept for later
/// calls and saved to settings so the next run starts logged in.
pub fn login(context: &SiteContext, email: &str, password: &str) -> Result<String, ReelError> {
    let api = context.settings.snapshot().hostname(API_HOSTNAME_KEY);
    let token = auth::password_login(
        &context.fetch,
        &format!("{api}/user/login"),
        email,
        password,
        &context.token,
    )?;
    context.settings.update(|settings| {
        settings.iwara_token = Some(token.clone());
        Ok(())
    })?;
    Ok(token)
}

pub fn logout(context: &SiteContext) -> Result<(), ReelError> {
    context.token.clear();
    context.settings.update(|settings| {
        settings.iwara_token = None;
        Ok(())
    })?;
    info!("iwara token cleared");
    Ok(())
}

fn api_get<T: DeserializeOwned>(context: &SiteContext, url: &str) -> Result<T, ReelError> {
    debug!(url, "iwara api");
    let request = HttpRequest::get(url).with_headers(&context.token.auth_headers());
    context.fetch.send_direct(&request)?.json()
}

fn search(context: &SiteContext, keyword: &str) -> Result<Vec<AssetDescriptor>, ReelError> {
    let settings = context.settings.snapshot();
    let api = settings.hostname(API_HOSTNAME_KEY);
    let query: String = url::form_urlencoded::byte_serialize(keyword.as_bytes()).collect();
    let users: Page<IwaraUser> =
        api_get(context, &format!("{api}/search?type=users&page=0&query={query}"))?;
    let Some(author) = pick_author(&users.results, keyword) else {
        info!(keyword, "no iwara author found");
        return Ok(Vec::new());
    };
    info!(author = %author.username, candidates = users.results.len(), "iwara author selected");

    let mut found = Vec::new();
    for page in 0..MAX_VIDEO_PAGES {
        let videos: Page<IwaraVideo> = api_get(
            context,
            &format!("{api}/videos?rating=all&sort=date&page={page}&user={}", author.id),
        )?;
        let count = videos.results.len();
        found.extend(
            videos
                .results
                .iter()
                .map(|video| describe(video, &settings)),
        );
        if count < VIDEOS_PER_PAGE {
            return Ok(found);
        }
    }
    warn!(author = %author.username, "iwara listing hit the page limit");
    Ok(found)
}

/// Exact username match, otherwise the first result.
pub fn pick_author<'a>(users: &'a [IwaraUser], keyword: &str) -> Option<&'a IwaraUser> {
    users
        .iter()
        .find(|user| user.username.eq_ignore_ascii_case(keyword.trim()))
        .or_else(|| users.first())
}

pub fn describe(video: &IwaraVideo, settings: &Settings) -> AssetDescriptor {
    let site = settings.hostname(IWARA.hostname_key);
    let author = video
        .user
        .as_ref()
        .map(|user| user.username.as_str())
        .unwrap_or_default();
    AssetDescriptor::new(NAME, format!("{site}/video/{}", video.id), &video.title)
        .with_author(author)
        .with_updated_at(&video.created_at)
        .with_view_count(video.num_views)
        .with_listing_url(&format!("{site}/profile/{author}/videos"))
        .with_download_root(&settings.download_root(IWARA.download_path_key))
}

pub fn video_id(url: &str) -> Result<String, ReelError> {
    VIDEO_ID
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
        .ok_or_else(|| ReelError::InvalidUrl(format!("no iwara video id in {url}")))
}

pub fn x_version(file_id: &str, expires: &str) -> String {
    format!("{:x}", Sha1::digest(format!("{file_id}_{expires}{SHA_POSTFIX}").as_bytes()))
}

pub fn expires_param(file_url: &str) -> Result<String, ReelError> {
    let parsed =
        url::Url::parse(file_url).map_err(|err| ReelError::InvalidUrl(format!("{file_url}: {err}")))?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "expires")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| ReelError::Parse(format!("no expires in {file_url}")))
}

/// Highest known quality, otherwise the first resource.
pub fn pick_resource(resources: &[Resource]) -> Option<&Resource> {
    QUALITY_ORDER
        .iter()
        .find_map(|quality| resources.iter().find(|resource| resource.name == *quality))
        .or_else(|| resources.first())
}

fn download_link(resource: &Resource) -> String {
    let link = resource.src.download.as_str();
    if link.starts_with("//") {
        format!("https:{link}")
    } else {
        link.to_string()
    }
}

fn extension(resource: &Resource) -> &str {
    resource
        .mime
        .split('/')
        .nth(1)
        .filter(|ext| !ext.is_empty())
        .unwrap_or("mp4")
}

fn download(context: &SiteContext, task: &DownloadTask) -> Result<(), ReelError> {
    if let Some(asset) = task.as_asset().filter(|asset| library::is_downloaded(asset)) {
        info!(title = %asset.title, "already downloaded");
        return Ok(());
    }
    let settings = context.settings.snapshot();
    let api = settings.hostname(API_HOSTNAME_KEY);
    let id = video_id(task.url())?;
    let detail: VideoDetail = api_get(context, &format!("{api}/video/{id}"))?;

    let asset = match task.as_asset() {
        Some(asset) => asset.clone(),
        None => describe(&detail.video, &settings),
    };
    let file_url = detail
        .file_url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ReelError::Parse(format!("video {id} has no fileUrl")))?;
    let file_id = detail
        .file
        .map(|file| file.id)
        .ok_or_else(|| ReelError::Parse(format!("video {id} has no file id")))?;
    let version = x_version(&file_id, &expires_param(&file_url)?);

    let request = HttpRequest::get(&file_url)
        .with_header("X-Version", &version)
        .with_headers(&context.token.auth_headers());
    let resources: Vec<Resource> = context.fetch.send_direct(&request)?.json()?;
    let resource = pick_resource(&resources)
        .ok_or_else(|| ReelError::Parse(format!("video {id} has no downloadable resource")))?;

    let target = asset.target_path(extension(resource));
    if target.exists() {
        info!(path = %target, "already downloaded");
        return Ok(());
    }
    info!(title = %asset.title, quality = %resource.name, "downloading iwara video");
    context.fetch.download_to(
        &download_link(resource),
        &context.token.auth_headers(),
        &target,
        context.progress.as_ref(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(name: &str) -> Resource {
        Resource {
            name: name.to_string(),
            src: ResourceSource {
                download: format!("//files.example/{name}"),
            },
            mime: "video/mp4".to_string(),
        }
    }

    #[test]
    fn picks_best_quality() {
        let resources = vec![resource("360"), resource("720"), resource("preview")];
        assert_eq!(pick_resource(&resources).unwrap().name, "720");
        let resources = vec![resource("preview"), resource("other")];
        assert_eq!(pick_resource(&resources).unwrap().name, "preview");
        assert!(pick_resource(&[]).is_none());
        assert_eq!(download_link(&resource("Source")), "https://files.example/Source");
        assert_eq!(extension(&resource("Source")), "mp4");
    }

    #[test]
    fn x_version_is_sha1_hex() {
        let value = x_version("file", "123");
        assert_eq!(value.len(), 40);
        assert!(value.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(value, x_version("file", "124"));
    }

    #[test]
    fn expires_and_id_parsing() {
        assert_eq!(
            expires_param("https://files.iwara.tv/file/abc?expires=1700000000&hash=x").unwrap(),
            "1700000000"
        );
        assert_eq!(video_id("https://www.iwara.tv/video/AbC123/some-title").unwrap(), "AbC123");
    }

    #[test]
    fn author_choice() {
        let users: Vec<IwaraUser> = serde_json::from_str(
            r#"[{"id":"1","username":"alpha"},{"id":"2","username":"Beta"}]"#,
        )
        .unwrap();
        assert_eq!(pick_author(&users, "beta").unwrap().id, "2");
        assert_eq!(pick_author(&users, "gamma").unwrap().id, "1");
    }

    #[test]
    fn describes_videos() {
        let video: IwaraVideo = serde_json::from_str(
            r#"{"id":"v1","title":"dance","user":{"id":"u","username":"maker"},"numViews":42,"createdAt":"2024-02-03T10:00:00.000Z"}"#,
        )
        .unwrap();
        let asset = describe(&video, &Settings::default());
        assert_eq!(asset.id_or_url, "https://www.iwara.tv/video/v1");
        assert_eq!(asset.updated_at, "2024-02-03");
        assert_eq!(asset.view_count, 42);
        assert_eq!(asset.normalized_title, "[2024-02-03]dance");
    }
}
