use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8Path;

use reelsync::error::ReelError;
use reelsync::fetch::{
    BrowserFetcher, BrowserLauncher, BrowserSession, FetchLayer, FetchedResponse, HttpRequest,
    PrimaryFetcher, SharedBrowser,
};
use reelsync::progress::ProgressSink;

enum Reply {
    Status(u16, &'static str),
    Fail,
}

struct MockPrimary {
    reply: Reply,
    calls: Mutex<usize>,
}

impl MockPrimary {
    fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: Mutex::new(0),
        })
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl PrimaryFetcher for MockPrimary {
    fn send(&self, request: &HttpRequest) -> Result<FetchedResponse, ReelError> {
        *self.calls.lock().unwrap() += 1;
        match self.reply {
            Reply::Status(status, body) => Ok(FetchedResponse {
                status,
                url: request.url.clone(),
                body: body.to_string(),
            }),
            Reply::Fail => Err(ReelError::Transport("connection reset".to_string())),
        }
    }

    fn download_to(
        &self,
        _url: &str,
        _headers: &[(String, String)],
        _destination: &Utf8Path,
        _progress: &dyn ProgressSink,
    ) -> Result<u64, ReelError> {
        Ok(0)
    }
}

#[derive(Default)]
struct MockBrowser {
    calls: Mutex<Vec<String>>,
}

impl MockBrowser {
    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl BrowserFetcher for MockBrowser {
    fn render(&self, url: &str, _marker: &str, _timeout: Duration) -> Result<FetchedResponse, ReelError> {
        self.calls.lock().unwrap().push(url.to_string());
        Ok(FetchedResponse {
            status: 200,
            url: url.to_string(),
            body: "<html>rendered</html>".to_string(),
        })
    }
}

fn layer(primary: &Arc<MockPrimary>, browser: &Arc<MockBrowser>) -> FetchLayer {
    let primary: Arc<dyn PrimaryFetcher> = Arc::clone(primary) as Arc<dyn PrimaryFetcher>;
    let browser: Arc<dyn BrowserFetcher> = Arc::clone(browser) as Arc<dyn BrowserFetcher>;
    FetchLayer::new(primary, browser)
}

#[test]
fn success_stays_on_primary() {
    let primary = MockPrimary::new(Reply::Status(200, "<html>ok</html>"));
    let browser = Arc::new(MockBrowser::default());
    let fetch = layer(&primary, &browser);

    assert_eq!(fetch.fetch_page("https://site.example/a", "body").unwrap(), "<html>ok</html>");
    assert_eq!(primary.calls(), 1);
    assert_eq!(browser.calls(), 0);
    assert!(!fetch.is_latched("site.example"));
}

#[test]
fn block_latches_domain_and_falls_back_once() {
    let primary = MockPrimary::new(Reply::Status(403, "forbidden"));
    let browser = Arc::new(MockBrowser::default());
    let fetch = layer(&primary, &browser);

    let body = fetch.fetch_page("https://site.example/a", "div.item").unwrap();
    assert_eq!(body, "<html>rendered</html>");
    assert_eq!(primary.calls(), 1);
    assert_eq!(browser.calls(), 1);
    assert!(fetch.is_latched("site.example"));

    for index in 0..100 {
        fetch
            .fetch_page(&format!("https://SITE.example/page/{index}"), "div.item")
            .unwrap();
    }
    assert_eq!(primary.calls(), 1);
    assert_eq!(browser.calls(), 101);
    assert_eq!(fetch.latched_domains(), vec!["site.example"]);
}

#[test]
fn latch_is_per_domain() {
    let primary = MockPrimary::new(Reply::Status(403, ""));
    let browser = Arc::new(MockBrowser::default());
    let fetch = layer(&primary, &browser);

    fetch.fetch_page("https://one.example/", "body").unwrap();
    assert!(fetch.is_latched("one.example"));
    assert!(!fetch.is_latched("two.example"));
    fetch.fetch_page("https://two.example/", "body").unwrap();
    assert_eq!(primary.calls(), 2);
}

#[test]
fn transport_errors_do_not_latch() {
    let primary = MockPrimary::new(Reply::Fail);
    let browser = Arc::new(MockBrowser::default());
    let fetch = layer(&primary, &browser);

    assert_matches!(
        fetch.fetch_page("https://site.example/a", "body"),
        Err(ReelError::Transport(_))
    );
    assert_matches!(
        fetch.fetch_page("https://site.example/b", "body"),
        Err(ReelError::Transport(_))
    );
    assert_eq!(primary.calls(), 2);
    assert_eq!(browser.calls(), 0);
    assert!(!fetch.is_latched("site.example"));
}

#[test]
fn challenge_page_latches_but_plain_503_does_not() {
    let browser = Arc::new(MockBrowser::default());

    let plain = MockPrimary::new(Reply::Status(503, "maintenance"));
    let fetch = layer(&plain, &browser);
    assert_matches!(
        fetch.fetch_page("https://site.example/a", "body"),
        Err(ReelError::Status { status: 503, .. })
    );
    assert!(!fetch.is_latched("site.example"));

    let challenge = MockPrimary::new(Reply::Status(503, "<title>Just a moment...</title>"));
    let fetch = layer(&challenge, &browser);
    fetch.fetch_page("https://site.example/a", "body").unwrap();
    assert!(fetch.is_latched("site.example"));
    assert_eq!(browser.calls(), 1);
}

#[test]
fn direct_requests_never_use_browser() {
    let primary = MockPrimary::new(Reply::Status(403, ""));
    let browser = Arc::new(MockBrowser::default());
    let fetch = layer(&primary, &browser);

    let form = HttpRequest::post_form("https://site.example/search", &[("q", "x")]);
    assert_matches!(
        fetch.fetch_response(&form),
        Err(ReelError::Blocked { status: 403, .. })
    );
    assert_eq!(browser.calls(), 0);
    assert!(!fetch.is_latched("site.example"));
}

#[test]
fn concurrent_block_trips_latch_once() {
    let primary = MockPrimary::new(Reply::Status(403, ""));
    let browser = Arc::new(MockBrowser::default());
    let fetch = Arc::new(layer(&primary, &browser));

    let handles: Vec<_> = (0..8)
        .map(|index| {
            let fetch = Arc::clone(&fetch);
            thread::spawn(move || {
                fetch
                    .fetch_page(&format!("https://site.example/{index}"), "body")
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), "<html>rendered</html>");
    }
    assert_eq!(browser.calls(), 8);
    assert!(primary.calls() <= 8);
    assert_eq!(fetch.latched_domains().len(), 1);
}

struct FakeSession {
    id: usize,
    alive: AtomicBool,
}

impl BrowserSession for FakeSession {
    fn probe(&self) -> Result<(), ReelError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReelError::Browser("connection closed".to_string()))
        }
    }

    fn render(&self, url: &str, _marker: &str, _timeout: Duration) -> Result<FetchedResponse, ReelError> {
        Ok(FetchedResponse {
            status: 200,
            url: url.to_string(),
            body: format!("session {}", self.id),
        })
    }
}

#[derive(Default)]
struct FakeLauncher {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeLauncher {
    fn launches(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn kill_current(&self) {
        if let Some(session) = self.sessions.lock().unwrap().last() {
            session.alive.store(false, Ordering::SeqCst);
        }
    }
}

impl BrowserLauncher for FakeLauncher {
    fn launch(&self) -> Result<Arc<dyn BrowserSession>, ReelError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = Arc::new(FakeSession {
            id: sessions.len() + 1,
            alive: AtomicBool::new(true),
        });
        sessions.push(Arc::clone(&session));
        Ok(session as Arc<dyn BrowserSession>)
    }
}

#[test]
fn shared_browser_launches_once_while_alive() {
    let launcher = Arc::new(FakeLauncher::default());
    let browser = SharedBrowser::new(Arc::clone(&launcher) as Arc<dyn BrowserLauncher>);

    for _ in 0..5 {
        let page = browser.render("https://site.example/a", "body", Duration::from_secs(1)).unwrap();
        assert_eq!(page.body, "session 1");
    }
    assert_eq!(launcher.launches(), 1);
}

#[test]
fn dead_browser_is_relaunched_once() {
    let launcher = Arc::new(FakeLauncher::default());
    let browser = SharedBrowser::new(Arc::clone(&launcher) as Arc<dyn BrowserLauncher>);
    browser.render("https://site.example/a", "body", Duration::from_secs(1)).unwrap();

    launcher.kill_current();
    let page = browser.render("https://site.example/b", "body", Duration::from_secs(1)).unwrap();
    assert_eq!(page.body, "session 2");
    assert_eq!(launcher.launches(), 2);

    browser.render("https://site.example/c", "body", Duration::from_secs(1)).unwrap();
    assert_eq!(launcher.launches(), 2);
}
