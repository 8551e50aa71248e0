use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config;
use crate::error::ReelError;

const MIN_VIDEO_BYTES: u64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaJob {
    pub url: String,
    pub output: Utf8PathBuf,
    pub referer: Option<String>,
    pub headers: Vec<(String, String)>,
    pub check_cert: bool,
}

impl MediaJob {
    pub fn new(url: &str, output: Utf8PathBuf) -> Self {
        Self {
            url: url.to_string(),
            output,
            referer: None,
            headers: Vec::new(),
            check_cert: true,
        }
    }

    pub fn with_referer(mut self, referer: &str) -> Self {
        self.referer = Some(referer.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_check_cert(mut self, check_cert: bool) -> Self {
        self.check_cert = check_cert;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub yt_dlp: Option<String>,
}

pub trait MediaTool: Send + Sync {
    fn fetch(&self, job: &MediaJob) -> Result<(), ReelError>;
    fn tool_info(&self) -> ToolInfo;
}

#[derive(Debug, Clone)]
pub struct YtDlpTool {
    program: Option<PathBuf>,
}

impl Default for YtDlpTool {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpTool {
    pub fn new() -> Self {
        Self {
            program: find_in_path("yt-dlp"),
        }
    }

    fn require_program(&self) -> Result<&PathBuf, ReelError> {
        self.program
            .as_ref()
            .ok_or_else(|| ReelError::MissingTool("yt-dlp".to_string()))
    }

    fn run_cmd(&self, program: &Path, args: &[String]) -> Result<(), ReelError> {
        debug!(program = %program.display(), ?args, "running media tool");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| ReelError::ToolFailed(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {}", program.display())
        } else {
            stderr
        };
        Err(ReelError::ToolFailed(message))
    }
}

impl MediaTool for YtDlpTool {
    fn fetch(&self, job: &MediaJob) -> Result<(), ReelError> {
        let program = self.require_program()?;
        if let Some(parent) = job.output.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| ReelError::Filesystem(err.to_string()))?;
        }
        info!(output = %job.output, "handing off to yt-dlp");
        self.run_cmd(program, &build_args(job))
    }

    fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            yt_dlp: self
                .program
                .as_ref()
                .and_then(|path| tool_version(path, &["--version"])),
        }
    }
}

fn build_args(job: &MediaJob) -> Vec<String> {
    let mut args = vec![
        "--format".to_string(),
        "bestvideo+bestaudio/best".to_string(),
        "--output".to_string(),
        job.output.to_string(),
        "--no-warnings".to_string(),
        "--quiet".to_string(),
        "--user-agent".to_string(),
        config::USER_AGENT.to_string(),
    ];
    if !job.check_cert {
        args.push("--no-check-certificates".to_string());
    }
    if let Some(referer) = &job.referer {
        args.push("--referer".to_string());
        args.push(referer.clone());
    }
    for (name, value) in &job.headers {
        args.push("--add-header".to_string());
        args.push(format!("{name}:{value}"));
    }
    args.push(job.url.clone());
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCheck {
    Video,
    Unknown,
}

/// Rejects files too small to be a video and HTML pages saved by mistake.
/// A rejected file is removed.
pub fn validate_video_file(path: &Utf8Path) -> Result<VideoCheck, ReelError> {
    let size = fs::metadata(path.as_std_path())
        .map_err(|err| ReelError::Filesystem(err.to_string()))?
        .len();
    if size < MIN_VIDEO_BYTES {
        remove_quietly(path);
        return Err(ReelError::Parse(format!(
            "{path} is {size} bytes, too small for a video"
        )));
    }

    let mut header = [0u8; 100];
    let read = File::open(path.as_std_path())
        .and_then(|mut file| file.read(&mut header))
        .map_err(|err| ReelError::Filesystem(err.to_string()))?;
    let header = &header[..read];
    if [b"ftyp".as_slice(), b"moov", b"mdat"]
        .iter()
        .any(|marker| contains(header, marker))
    {
        return Ok(VideoCheck::Video);
    }
    if contains(header, b"<!DOCTYPE") || contains(header, b"<html") {
        remove_quietly(path);
        return Err(ReelError::Parse(format!("{path} is an HTML page")));
    }
    warn!(path = %path, "unrecognized file type, keeping it");
    Ok(VideoCheck::Unknown)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn remove_quietly(path: &Utf8Path) {
    if let Err(err) = fs::remove_file(path.as_std_path()) {
        warn!(path = %path, error = %err, "failed to remove rejected file");
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() { None } else { Some(stdout) }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn temp_file(bytes: &[u8]) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("clip.mp4")).unwrap();
        fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn args_carry_referer_and_headers() {
        let job = MediaJob::new("https://cdn/x.m3u8", Utf8PathBuf::from("/out/clip.mp4"))
            .with_referer("https://site/")
            .with_header("Range", "bytes=0-");
        let args = build_args(&job);
        assert!(args.windows(2).any(|pair| pair == ["--referer", "https://site/"]));
        assert!(args.windows(2).any(|pair| pair == ["--add-header", "Range:bytes=0-"]));
        assert_eq!(args.last().map(String::as_str), Some("https://cdn/x.m3u8"));
        assert!(!args.iter().any(|arg| arg == "--no-check-certificates"));
    }

    #[test]
    fn certificate_checks_follow_job() {
        let job = MediaJob::new("https://cdn/x.m3u8", Utf8PathBuf::from("/out/clip.mp4"))
            .with_check_cert(false);
        assert!(build_args(&job).iter().any(|arg| arg == "--no-check-certificates"));
    }

    #[test]
    fn small_file_is_rejected_and_removed() {
        let (_dir, path) = temp_file(b"tiny");
        assert_matches!(validate_video_file(&path), Err(ReelError::Parse(_)));
        assert!(!path.exists());
    }

    #[test]
    fn html_page_is_rejected() {
        let mut body = b"<!DOCTYPE html><html>".to_vec();
        body.resize(200_000, b' ');
        let (_dir, path) = temp_file(&body);
        assert_matches!(validate_video_file(&path), Err(ReelError::Parse(_)));
    }

    #[test]
    fn mp4_header_is_accepted() {
        let mut body = vec![0u8, 0, 0, 24];
        body.extend_from_slice(b"ftypisom");
        body.resize(200_000, 0);
        let (_dir, path) = temp_file(&body);
        assert_eq!(validate_video_file(&path).unwrap(), VideoCheck::Video);
    }
}
