//! Media asset discovery for the delivery assets endpoint
//!
//! A delivery's attributes carry `snapshots` and `videos` directory hints
//! written by the recording pipeline. The listings resolve those against
//! the configured media root and enumerate the files; the exact layout is
//! the recorder's concern, not ours.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One listed media file
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AssetEntry {
    /// URL path served by the media host
    pub url: String,
    pub name: String,
    pub time: String,
}

/// Placeholder entry shown while the recorder is still writing
pub fn placeholder_entry(now_display: &str) -> AssetEntry {
    AssetEntry {
        url: "/alarms/delivery/documentation-in-progress.jpg".to_string(),
        name: "documentation in progress".to_string(),
        time: now_display.to_string(),
    }
}

/// Resolve a delivery's media directory hint against the media root
///
/// Hints are stored as paths containing a `delivery/...` suffix; anything
/// before that marker is host-specific and discarded. Returns `None` when
/// the hint is missing or has no delivery segment - the caller falls back
/// to the placeholder.
pub fn resolve_media_dir(media_root: &str, hint: Option<&str>) -> Option<PathBuf> {
    let hint = hint?;
    let suffix = hint.split_once("delivery")?.1;
    let suffix = suffix.trim_start_matches('/');
    if suffix.contains("..") {
        return None;
    }
    Some(Path::new(media_root).join(suffix))
}

/// Derive the URL path under the media host from an absolute file path
fn media_url(path: &Path) -> String {
    let s = path.to_string_lossy();
    match s.split_once("media") {
        Some((_, rest)) => rest.to_string(),
        None => s.to_string(),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
}

fn list_by_extension(dir: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|ext| extensions.iter().any(|want| ext.eq_ignore_ascii_case(want)))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// List snapshot images in a delivery's snapshot directory, oldest first
///
/// Snapshot names encode their capture time (`YYYY-MM-DD_HH-MM-SS.jpg`);
/// the name doubles as the display time.
pub fn list_snapshots(dir: &Path) -> Vec<AssetEntry> {
    list_by_extension(dir, &["jpg"])
        .into_iter()
        .map(|path| {
            let stem = file_stem(&path);
            let display = snapshot_display_time(&stem).unwrap_or_else(|| stem.clone());
            AssetEntry { url: media_url(&path), name: display.clone(), time: display }
        })
        .collect()
}

/// List recorded videos in a delivery's video directory
pub fn list_videos(dir: &Path) -> Vec<AssetEntry> {
    list_by_extension(dir, &["avi", "mp4"])
        .into_iter()
        .map(|path| {
            let stem = file_stem(&path);
            AssetEntry { url: media_url(&path), name: stem.clone(), time: stem }
        })
        .collect()
}

/// Parse `YYYY-MM-DD_HH-MM-SS` snapshot stems into a display string
fn snapshot_display_time(stem: &str) -> Option<String> {
    let (date, time) = stem.split_once('_')?;
    let time = time.replace('-', ":");
    let parsed =
        chrono::NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
            .ok()?;
    Some(parsed.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_media_dir() {
        let dir = resolve_media_dir("/media/alarms/delivery", Some("/mnt/nfs/delivery/000003/snaps"));
        assert_eq!(dir, Some(PathBuf::from("/media/alarms/delivery/000003/snaps")));
    }

    #[test]
    fn test_resolve_media_dir_missing_hint() {
        assert!(resolve_media_dir("/media", None).is_none());
        assert!(resolve_media_dir("/media", Some("/mnt/other/path")).is_none());
    }

    #[test]
    fn test_resolve_media_dir_rejects_traversal() {
        assert!(resolve_media_dir("/media", Some("/mnt/delivery/../../etc")).is_none());
    }

    #[test]
    fn test_list_snapshots_sorted_with_display_time() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("2024-05-02_10-30-00.jpg")).unwrap();
        File::create(dir.path().join("2024-05-02_10-15-00.jpg")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        let snaps = list_snapshots(dir.path());

        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].time, "2024-05-02 10:15:00");
        assert_eq!(snaps[1].time, "2024-05-02 10:30:00");
    }

    #[test]
    fn test_list_videos_filters_extensions() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("run1.avi")).unwrap();
        File::create(dir.path().join("run2.mp4")).unwrap();
        File::create(dir.path().join("run3.jpg")).unwrap();

        let videos = list_videos(dir.path());

        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].name, "run1");
    }

    #[test]
    fn test_missing_dir_lists_empty() {
        assert!(list_snapshots(Path::new("/nonexistent/dir")).is_empty());
        assert!(list_videos(Path::new("/nonexistent/dir")).is_empty());
    }

    #[test]
    fn test_media_url_strips_host_prefix() {
        let url = media_url(Path::new("/media/alarms/delivery/000001/a.jpg"));
        assert_eq!(url, "/alarms/delivery/000001/a.jpg");
    }
}
