use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Millisecond timestamp that never repeats within the process.
pub(crate) fn unique_stamp() -> u64 {
    let now = timestamp_millis();
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

/// Upload content type: PNG is announced as such, everything else goes out as JPEG.
pub(crate) fn upload_mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        _ => "image/jpeg",
    }
}

pub(crate) fn output_extension_from_mime(mime: Option<&str>) -> &'static str {
    if let Some(mime) = mime {
        let lowered = mime.to_ascii_lowercase();
        if lowered.contains("png") {
            return "png";
        }
        if lowered.contains("webp") {
            return "webp";
        }
    }
    "jpg"
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn upload_mime_maps_png_and_defaults_to_jpeg() {
        assert_eq!(upload_mime_for_path(Path::new("/s/pirate.PNG")), "image/png");
        assert_eq!(upload_mime_for_path(Path::new("/s/photo.jpg")), "image/jpeg");
        assert_eq!(upload_mime_for_path(Path::new("/s/photo.heic")), "image/jpeg");
        assert_eq!(upload_mime_for_path(Path::new("/s/photo")), "image/jpeg");
    }

    #[test]
    fn output_extension_prefers_content_type() {
        assert_eq!(output_extension_from_mime(Some("image/png")), "png");
        assert_eq!(output_extension_from_mime(Some("image/webp")), "webp");
        assert_eq!(output_extension_from_mime(Some("image/jpeg")), "jpg");
        assert_eq!(output_extension_from_mime(None), "jpg");
    }

    #[test]
    fn unique_stamp_is_strictly_increasing() {
        let first = unique_stamp();
        let second = unique_stamp();
        let third = unique_stamp();
        assert!(first < second && second < third);
    }

    #[test]
    fn truncate_text_marks_cut() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
