//! Small filesystem and formatting helpers shared across components.

use std::path::{Path, PathBuf};
use std::time::Duration;

const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "wmv"];
const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "ass", "ssa", "sub", "idx", "vtt"];
const FONT_EXTENSIONS: &[&str] = &["ttf", "otf", "ttc", "otc"];

fn has_extension_in(path: &str, set: &[&str]) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| set.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_media_file(path: &str) -> bool {
    has_extension_in(path, MEDIA_EXTENSIONS)
}

pub fn is_subtitle_file(path: &str) -> bool {
    has_extension_in(path, SUBTITLE_EXTENSIONS)
}

pub fn is_font_file(path: &str) -> bool {
    has_extension_in(path, FONT_EXTENSIONS)
}

/// File name without its final extension. `foo.zh.ass` -> `foo.zh`.
pub fn file_base_name(path: &str) -> String {
    match path.rfind('.') {
        Some(idx) => path[..idx].to_string(),
        None => path.to_string(),
    }
}

/// Every extension of the file name, stacked. `movie.zh.srt` -> `.zh.srt`.
pub fn all_extensions(path: &str) -> String {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);
    match name.find('.') {
        Some(idx) if idx > 0 => name[idx..].to_string(),
        _ => String::new(),
    }
}

/// Files in the same directory sharing the media file's base name.
///
/// Matches on `base + "."` so that `foo.zh.ass` pairs with `foo.mkv` while
/// `foobar.mkv` does not.
pub fn find_same_base_files(file_path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let dir = file_path.parent().unwrap_or_else(|| Path::new("."));
    let base = file_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let prefix = format!("{base}.");

    let mut result = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(&prefix) {
                result.push(dir.join(name));
            }
        }
    }
    result.sort();
    Ok(result)
}

/// Zero-pads season/episode numbers below ten: 3 -> "03", 12 -> "12".
pub fn format_number(num: u32) -> String {
    format!("{num:02}")
}

pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

pub fn format_file_size(size: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;
    let size = size as f64;
    if size >= TB {
        format!("{:.2} TB", size / TB)
    } else if size >= GB {
        format!("{:.2} GB", size / GB)
    } else if size >= MB {
        format!("{:.2} MB", size / MB)
    } else if size >= KB {
        format!("{:.2} KB", size / KB)
    } else {
        format!("{size} B")
    }
}

pub fn average_speed(size: i64, duration: Duration) -> String {
    if duration.is_zero() {
        return "N/A".to_string();
    }
    let per_second = size as f64 / duration.as_secs_f64();
    format!("{}/s", format_file_size(per_second as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_kind_checks_ignore_case() {
        assert!(is_media_file("Show.S01E01.MKV"));
        assert!(is_subtitle_file("Show.S01E01.zh.ASS"));
        assert!(is_font_file("SourceHanSans.TTC"));
        assert!(!is_media_file("Show.S01E01.nfo"));
    }

    #[test]
    fn base_name_strips_last_extension_only() {
        assert_eq!(file_base_name("foo.zh.ass"), "foo.zh");
        assert_eq!(file_base_name("foo"), "foo");
    }

    #[test]
    fn all_extensions_keeps_language_tags() {
        assert_eq!(all_extensions("movie.zh.srt"), ".zh.srt");
        assert_eq!(all_extensions("/tmp/movie.en-US.ass"), ".en-US.ass");
        assert_eq!(all_extensions("plain"), "");
    }

    #[test]
    fn same_base_requires_dot_boundary() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["foo.mkv", "foo.zh.ass", "foo.mka", "foobar.mkv"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let found = find_same_base_files(&dir.path().join("foo.mkv")).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["foo.mka", "foo.mkv", "foo.zh.ass"]);
    }

    #[test]
    fn number_formatting_pads_below_ten() {
        assert_eq!(format_number(3), "03");
        assert_eq!(format_number(12), "12");
    }

    #[test]
    fn sizes_humanize() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536 * 1024 * 1024), "1.50 GB");
    }
}
