use std::io::{self, Write};

use crossterm::style::Stylize;
use serde::Serialize;

use crate::app::ChannelInfo;
use crate::domain::AssetDescriptor;
use crate::library;
use crate::media::ToolInfo;
use crate::orchestrator::QueueStats;
use crate::settings::Settings;
use crate::store::ChannelCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_assets(assets: &[AssetDescriptor]) -> io::Result<()> {
        Self::print_json(assets)
    }

    pub fn print_cache(cache: &ChannelCache) -> io::Result<()> {
        Self::print_json(cache)
    }

    pub fn print_settings(settings: &Settings) -> io::Result<()> {
        Self::print_json(settings)
    }

    pub fn print_channels(channels: &[ChannelInfo]) -> io::Result<()> {
        Self::print_json(channels)
    }

    pub fn print_stats(stats: &QueueStats) -> io::Result<()> {
        Self::print_json(stats)
    }

    fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_assets(assets: &[AssetDescriptor]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        if assets.is_empty() {
            writeln!(stdout, "{}", "no results".yellow())?;
            return Ok(());
        }
        for (index, asset) in assets.iter().enumerate() {
            let date = if asset.updated_at.is_empty() {
                "----------"
            } else {
                asset.updated_at.as_str()
            };
            let line = format!(
                "{:>4}  {date}  {:<20}  {}",
                index + 1,
                truncate(&asset.author, 20),
                asset.title
            );
            if library::is_downloaded(asset) {
                writeln!(stdout, "{}", line.dark_grey())?;
            } else {
                writeln!(stdout, "{line}")?;
            }
        }
        writeln!(stdout, "{}", format!("{} item(s)", assets.len()).cyan())?;
        Ok(())
    }

    pub fn print_channels(channels: &[ChannelInfo], tool: &ToolInfo) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for channel in channels {
            let state = if channel.latched {
                "browser".yellow()
            } else {
                "direct".green()
            };
            writeln!(
                stdout,
                "{:<10} {:<32} {state}  {}",
                channel.name, channel.hostname, channel.download_root
            )?;
        }
        match &tool.yt_dlp {
            Some(version) => writeln!(stdout, "yt-dlp {version}")?,
            None => writeln!(stdout, "{}", "yt-dlp not found".red())?,
        }
        Ok(())
    }

    pub fn print_cache(cache: &ChannelCache) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for (key, record) in cache {
            writeln!(stdout, "{}", record.normalized_title.as_str().bold())?;
            writeln!(stdout, "    {key}")?;
        }
        writeln!(stdout, "{}", format!("{} record(s)", cache.len()).cyan())?;
        Ok(())
    }

    pub fn print_stats(stats: &QueueStats) -> io::Result<()> {
        let summary = format!(
            "downloads: {} succeeded, {} failed, {} crashed",
            stats.succeeded, stats.failed, stats.panicked
        );
        if stats.failed + stats.panicked == 0 {
            println!("{}", summary.green());
        } else {
            println!("{}", summary.yellow());
        }
        Ok(())
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut cut: String = value.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
