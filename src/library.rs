//! What is already on disk under each channel's download root.

use std::fs;

use camino::Utf8PathBuf;
use tracing::{debug, error, info};

use crate::domain::{AssetDescriptor, extract_date};
use crate::error::ReelError;

pub const VIDEO_EXTENSION: &str = "mp4";

pub fn video_path(asset: &AssetDescriptor) -> Utf8PathBuf {
    asset.target_path(VIDEO_EXTENSION)
}

pub fn is_downloaded(asset: &AssetDescriptor) -> bool {
    video_path(asset).is_file()
}

/// Date found in a `[YYYY-MM-DD]<title>.<ext>` sibling of the undated title.
pub fn discover_local_date(asset: &AssetDescriptor) -> Option<String> {
    let undated = asset.undated_title();
    let entries = fs::read_dir(asset.download_dir.as_std_path()).ok()?;
    entries.flatten().find_map(|entry| {
        let name = entry.file_name();
        let name = name.to_str()?;
        let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
        let rest = stem.strip_prefix('[')?;
        let (date, title) = rest.split_once(']')?;
        if title != undated {
            return None;
        }
        extract_date(date).filter(|found| found == date)
    })
}

pub fn annotate_from_disk(assets: &mut [AssetDescriptor]) -> usize {
    let mut changed = 0;
    for asset in assets.iter_mut().filter(|asset| asset.updated_at.is_empty()) {
        if let Some(date) = discover_local_date(asset) {
            debug!(title = %asset.title, date = %date, "date found on disk");
            asset.set_updated_at(&date);
            changed += 1;
        }
    }
    changed
}

/// Moves `<undated title>.mp4` to the date-prefixed name. Returns false when
/// there is nothing to move or the target already exists.
pub fn rename_legacy_file(asset: &AssetDescriptor) -> Result<bool, ReelError> {
    if asset.updated_at.is_empty() {
        return Ok(false);
    }
    let legacy = asset
        .download_dir
        .join(format!("{}.{VIDEO_EXTENSION}", asset.undated_title()));
    let target = video_path(asset);
    if legacy == target || !legacy.is_file() {
        return Ok(false);
    }
    if target.exists() {
        debug!(legacy = %legacy, target = %target, "target exists, legacy file left in place");
        return Ok(false);
    }
    fs::rename(legacy.as_std_path(), target.as_std_path())
        .map_err(|err| ReelError::Filesystem(format!("{legacy} -> {target}: {err}")))?;
    info!(legacy = %legacy, target = %target, "renamed legacy file");
    Ok(true)
}

pub fn refresh_legacy_titles(assets: &[AssetDescriptor]) -> usize {
    let mut renamed = 0;
    for asset in assets {
        match rename_legacy_file(asset) {
            Ok(true) => renamed += 1,
            Ok(false) => {}
            Err(err) => error!(title = %asset.title, error = %err, "legacy rename failed"),
        }
    }
    if renamed > 0 {
        info!(renamed, "legacy titles refreshed");
    }
    renamed
}
