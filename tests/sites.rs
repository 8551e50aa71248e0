use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use reelsync::auth::BearerToken;
use reelsync::domain::{AssetDescriptor, DownloadTask, UrlTask};
use reelsync::error::ReelError;
use reelsync::fetch::{BrowserFetcher, FetchLayer, FetchedResponse, HttpRequest, PrimaryFetcher};
use reelsync::media::{MediaJob, MediaTool, ToolInfo};
use reelsync::progress::{NoopProgress, ProgressSink};
use reelsync::settings::{Settings, SettingsStore};
use reelsync::sites::{SiteContext, hanime1, iwara, xpv};
use reelsync::store::CacheStore;

struct Scripted {
    status: u16,
    final_url: Option<String>,
    body: String,
}

#[derive(Default)]
struct ScriptedPrimary {
    routes: Mutex<HashMap<String, Scripted>>,
    requests: Mutex<Vec<HttpRequest>>,
    downloads: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptedPrimary {
    fn route(&self, url: &str, body: &str) {
        self.route_full(url, 200, None, body);
    }

    fn route_full(&self, url: &str, status: u16, final_url: Option<&str>, body: &str) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Scripted {
                status,
                final_url: final_url.map(str::to_string),
                body: body.to_string(),
            },
        );
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl PrimaryFetcher for ScriptedPrimary {
    fn send(&self, request: &HttpRequest) -> Result<FetchedResponse, ReelError> {
        self.requests.lock().unwrap().push(request.clone());
        let routes = self.routes.lock().unwrap();
        Ok(match routes.get(&request.url) {
            Some(route) => FetchedResponse {
                status: route.status,
                url: route.final_url.clone().unwrap_or_else(|| request.url.clone()),
                body: route.body.clone(),
            },
            None => FetchedResponse {
                status: 404,
                url: request.url.clone(),
                body: String::new(),
            },
        })
    }

    fn download_to(
        &self,
        url: &str,
        headers: &[(String, String)],
        destination: &Utf8Path,
        _progress: &dyn ProgressSink,
    ) -> Result<u64, ReelError> {
        self.downloads
            .lock()
            .unwrap()
            .push((url.to_string(), headers.to_vec()));
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(destination, b"video bytes").unwrap();
        Ok(11)
    }
}

struct NoBrowser;

impl BrowserFetcher for NoBrowser {
    fn render(&self, url: &str, _marker: &str, _timeout: Duration) -> Result<FetchedResponse, ReelError> {
        Err(ReelError::Browser(format!("browser not expected for {url}")))
    }
}

#[derive(Default)]
struct RecordingMedia {
    jobs: Mutex<Vec<MediaJob>>,
}

impl MediaTool for RecordingMedia {
    fn fetch(&self, job: &MediaJob) -> Result<(), ReelError> {
        self.jobs.lock().unwrap().push(job.clone());
        if let Some(parent) = job.output.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&job.output, b"video bytes").unwrap();
        Ok(())
    }

    fn tool_info(&self) -> ToolInfo {
        ToolInfo { yt_dlp: None }
    }
}

struct Harness {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
    primary: Arc<ScriptedPrimary>,
    media: Arc<RecordingMedia>,
    context: Arc<SiteContext>,
}

fn harness() -> Harness {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let mut settings = Settings::default();
    for key in ["Xpv_Download_Path", "Iwara_Download_Path", "Hanime1_Download_Path"] {
        settings.set_value(key, root.join(key).as_str()).unwrap();
    }
    settings.set_value("Custom_Download_Path", root.join("custom").as_str()).unwrap();
    settings.set_value("Iwara_API_Hostname", "https://api.iwara.test").unwrap();

    let primary = Arc::new(ScriptedPrimary::default());
    let media = Arc::new(RecordingMedia::default());
    let primary_dyn: Arc<dyn PrimaryFetcher> = primary.clone();
    let context = Arc::new(SiteContext {
        settings: Arc::new(SettingsStore::with_settings(root.join("settings.json"), settings)),
        cache: Arc::new(CacheStore::load(root.join("cache.json"))),
        fetch: Arc::new(FetchLayer::new(primary_dyn, Arc::new(NoBrowser))),
        media: media.clone(),
        token: Arc::new(BearerToken::new(Some("secret".to_string()))),
        progress: Arc::new(NoopProgress),
    });
    Harness {
        _temp: temp,
        root,
        primary,
        media,
        context,
    }
}

fn hanime_asset(h: &Harness, key: &str, title: &str, date: &str) -> AssetDescriptor {
    AssetDescriptor::new("Hanime1", format!("https://hanime1.me/watch?v={key}"), title)
        .with_download_root(&h.root.join("Hanime1_Download_Path"))
        .with_updated_at(date)
}

#[test]
fn hanime1_download_is_idempotent() {
    let h = harness();
    let channel = hanime1::channel(Arc::clone(&h.context));
    let settings = h.context.settings.snapshot();
    let asset = hanime_asset(&h, "7", "episode 7", "2024-07-07");
    let target = h.root.join("Hanime1_Download_Path/[2024-07-07]episode 7.mp4");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, b"already here").unwrap();

    let task = DownloadTask::from(asset);
    assert!(channel.download(&task, &settings));
    assert!(channel.download(&task, &settings));
    assert!(h.media.jobs.lock().unwrap().is_empty());
    assert!(h.primary.requests().is_empty());
    assert_eq!(fs::read(&target).unwrap(), b"already here");
}

#[test]
fn hanime1_fills_date_and_renames_legacy_file() {
    let h = harness();
    let channel = hanime1::channel(Arc::clone(&h.context));
    let settings = h.context.settings.snapshot();
    h.primary.route(
        "https://hanime1.me/watch?v=8",
        r#"<div class="video-details-wrapper">views 2024-08-08</div>"#,
    );
    let dir = h.root.join("Hanime1_Download_Path");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("episode 8.mp4"), b"legacy").unwrap();

    let task = DownloadTask::from(hanime_asset(&h, "8", "episode 8", ""));
    assert!(channel.download(&task, &settings));

    assert!(!dir.join("episode 8.mp4").exists());
    assert_eq!(fs::read(dir.join("[2024-08-08]episode 8.mp4")).unwrap(), b"legacy");
    assert!(h.media.jobs.lock().unwrap().is_empty());
    let record = h
        .context
        .cache
        .get_record("Hanime1", "https://hanime1.me/watch?v=8")
        .unwrap();
    assert_eq!(record.updated_at, "2024-08-08");
}

#[test]
fn hanime1_hands_missing_video_to_media_tool() {
    let h = harness();
    let channel = hanime1::channel(Arc::clone(&h.context));
    let settings = h.context.settings.snapshot();

    let task = DownloadTask::from(hanime_asset(&h, "9", "episode 9", "2024-09-09"));
    assert!(channel.download(&task, &settings));

    let jobs = h.media.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].url, "https://hanime1.me/watch?v=9");
    assert_eq!(jobs[0].referer.as_deref(), Some("https://hanime1.me/"));
    assert!(jobs[0].output.as_str().ends_with("[2024-09-09]episode 9.mp4"));
    assert!(jobs[0].check_cert);
}

#[test]
fn hanime1_bulk_date_refresh_updates_cache_and_files() {
    let h = harness();
    h.primary.route(
        "https://hanime1.me/watch?v=21",
        r#"<div class="video-details-wrapper">2024-05-21</div>"#,
    );
    h.primary.route(
        "https://hanime1.me/watch?v=22",
        r#"<div class="video-details-wrapper">2024-05-22</div>"#,
    );
    let dir = h.root.join("Hanime1_Download_Path");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("episode 21.mp4"), b"legacy").unwrap();

    let mut assets = vec![
        hanime_asset(&h, "21", "episode 21", ""),
        hanime_asset(&h, "22", "episode 22", "2023-01-01"),
        hanime_asset(&h, "23", "episode 23", ""),
    ];
    let changed = hanime1::refresh_dates(&h.context, &mut assets).unwrap();

    assert_eq!(changed, 2);
    assert_eq!(assets[0].normalized_title, "[2024-05-21]episode 21");
    assert_eq!(assets[1].updated_at, "2024-05-22");
    assert_eq!(assets[2].updated_at, "");
    assert_eq!(h.primary.requests().len(), 3);
    assert!(dir.join("[2024-05-21]episode 21.mp4").is_file());
    assert!(!dir.join("episode 21.mp4").exists());

    let cache = h.context.cache.get_cache("Hanime1");
    assert_eq!(cache.len(), 3);
    assert_eq!(cache["https://hanime1.me/watch?v=22"].updated_at, "2024-05-22");
    assert_eq!(cache["https://hanime1.me/watch?v=23"].updated_at, "");
}

#[test]
fn media_hand_off_follows_certificate_setting() {
    let h = harness();
    h.context
        .settings
        .update(|settings| settings.set_value("Check_Cert", "false"))
        .unwrap();
    let channel = hanime1::channel(Arc::clone(&h.context));
    let settings = h.context.settings.snapshot();

    let task = DownloadTask::from(hanime_asset(&h, "10", "episode 10", "2024-10-10"));
    assert!(channel.download(&task, &settings));
    assert!(!h.media.jobs.lock().unwrap()[0].check_cert);
}

const IWARA_DETAIL: &str = r#"{
    "id": "abc123",
    "title": "dance",
    "user": {"id": "u1", "username": "maker"},
    "numViews": 3,
    "createdAt": "2024-02-03T10:00:00.000Z",
    "fileUrl": "https://files.iwara.test/file/f1?expires=1700000000&hash=h",
    "file": {"id": "f1"}
}"#;

const IWARA_RESOURCES: &str = r#"[
    {"name": "360", "src": {"download": "//files.iwara.test/dl/360"}, "type": "video/mp4"},
    {"name": "Source", "src": {"download": "//files.iwara.test/dl/source"}, "type": "video/mp4"}
]"#;

#[test]
fn iwara_download_signs_resource_request() {
    let h = harness();
    let channel = iwara::channel(Arc::clone(&h.context));
    let settings = h.context.settings.snapshot();
    h.primary.route("https://api.iwara.test/video/abc123", IWARA_DETAIL);
    h.primary.route(
        "https://files.iwara.test/file/f1?expires=1700000000&hash=h",
        IWARA_RESOURCES,
    );

    let task = DownloadTask::from(
        UrlTask::new("https://www.iwara.tv/video/abc123/dance").with_source("Iwara"),
    );
    assert!(channel.download(&task, &settings));

    let requests = h.primary.requests();
    let resources = requests
        .iter()
        .find(|request| request.url.starts_with("https://files.iwara.test/file/"))
        .unwrap();
    let version = resources
        .headers
        .iter()
        .find(|(name, _)| name == "X-Version")
        .map(|(_, value)| value.clone());
    assert_eq!(version, Some(iwara::x_version("f1", "1700000000")));
    assert!(resources
        .headers
        .iter()
        .any(|(name, value)| name == "Authorization" && value == "Bearer secret"));

    let downloads = h.primary.downloads.lock().unwrap().clone();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].0, "https://files.iwara.test/dl/source");
    assert!(h
        .root
        .join("Iwara_Download_Path/maker/[2024-02-03]dance.mp4")
        .is_file());

    assert!(channel.download(&task, &settings));
    assert_eq!(h.primary.download_count(), 1);
}

#[test]
fn iwara_api_failure_reports_false() {
    let h = harness();
    let channel = iwara::channel(Arc::clone(&h.context));
    let settings = h.context.settings.snapshot();
    let task = DownloadTask::from(UrlTask::new("https://www.iwara.tv/video/missing").with_source("Iwara"));
    assert!(!channel.download(&task, &settings));
    assert_eq!(h.primary.download_count(), 0);
}

fn xpv_item(id: usize) -> String {
    format!(
        r#"<div class="list-col"><a href="/showinfo-{id}.html" title="[maker] clip {id}"><img data-src="/d/file/2025/1107/{id}.jpg"></a></div>"#
    )
}

#[test]
fn xpv_search_walks_pages_until_short_page() {
    let h = harness();
    let channel = xpv::channel(Arc::clone(&h.context));
    h.primary.route_full(
        "https://www.xpicvid.com/e/search/index.php",
        200,
        Some("https://www.xpicvid.com/e/search/result/?searchid=4242"),
        "",
    );
    let full_page: String = (0..60).map(xpv_item).collect();
    h.primary.route(
        "https://www.xpicvid.com/e/search/result/index.php?page=0&searchid=4242",
        &full_page,
    );
    h.primary.route(
        "https://www.xpicvid.com/e/search/result/index.php?page=1&searchid=4242",
        &xpv_item(60),
    );

    let found = channel.discover("maker").unwrap();
    assert_eq!(found.len(), 61);
    assert_eq!(found[0].id_or_url, "https://www.xpicvid.com/showinfo-0.html");
    assert_eq!(found[0].author, "maker");
    assert_eq!(found[0].updated_at, "2025-11-07");
    assert_eq!(found[60].normalized_title, "[2025-11-07][maker] clip 60");
    assert!(found[60].download_dir.as_str().ends_with("Xpv_Download_Path/maker"));
    // form post, then two result pages
    assert_eq!(h.primary.requests().len(), 3);
}
