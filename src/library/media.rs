use chrono::{DateTime, Utc};
use url::Url;

/// Longest title fragment kept in a generated file name
const MAX_TITLE_LENGTH: usize = 100;

/// Broad media class of a downloaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Other,
}

/// Classify a MIME type by substring, case-insensitively
pub fn media_kind(mime_type: Option<&str>) -> MediaKind {
    let Some(mime) = mime_type.filter(|m| !m.is_empty()) else {
        return MediaKind::Other;
    };

    let lower = mime.to_lowercase();
    if lower.contains("audio") {
        MediaKind::Audio
    } else if lower.contains("video") {
        MediaKind::Video
    } else {
        MediaKind::Other
    }
}

/// Guess a MIME type from the extension of a file name or URL path
pub fn mime_from_path(path: &str) -> Option<&'static str> {
    let name = path.split(['?', '#']).next().unwrap_or(path);
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let (_, ext) = name.rsplit_once('.')?;

    match ext.to_lowercase().as_str() {
        "mp3" => Some("audio/mpeg"),
        "m4a" => Some("audio/mp4"),
        "aac" => Some("audio/aac"),
        "ogg" | "oga" => Some("audio/ogg"),
        "opus" => Some("audio/opus"),
        "wav" => Some("audio/wav"),
        "flac" => Some("audio/flac"),
        "mp4" | "m4v" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        "mkv" => Some("video/x-matroska"),
        _ => None,
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or(mime).trim().to_lowercase();

    match essence.as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "video/webm" => Some("webm"),
        _ => None,
    }
}

/// Pick the file extension for an enclosure URL.
///
/// Known media extensions in the URL path win, then the MIME type, then `mp3`.
pub fn media_extension(url: &str, mime_type: Option<&str>) -> String {
    let from_url = Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|last| last.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()))
            .filter(|ext| mime_from_path(&format!("x.{ext}")).is_some())
    });

    from_url
        .or_else(|| mime_type.and_then(extension_for_mime).map(String::from))
        .unwrap_or_else(|| "mp3".to_string())
}

/// Generate a local file name: `YYYY-MM-DD-title.ext` or `undated-title.ext`
pub fn generate_file_name(
    title: &str,
    published: Option<DateTime<Utc>>,
    url: &str,
    mime_type: Option<&str>,
) -> String {
    let prefix = published
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());

    let title = sanitize_title(title);
    let ext = media_extension(url, mime_type);

    if title.is_empty() {
        format!("{prefix}.{ext}")
    } else {
        format!("{prefix}-{title}.{ext}")
    }
}

/// Make `name` distinct from every name `taken` reports by adding `-2`, `-3`, ...
/// before the extension
pub fn unique_file_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    (2u32..)
        .map(|n| match ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        })
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| name.to_string())
}

/// Whitelist-sanitize a title, collapsing runs of separators into one dash
fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_dash = false;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }

    if out.len() <= MAX_TITLE_LENGTH {
        return out;
    }

    // Output is pure ASCII here, so byte slicing is safe
    let cut = &out[..MAX_TITLE_LENGTH];
    match cut.rfind('-') {
        Some(pos) if pos > MAX_TITLE_LENGTH / 2 => cut[..pos].to_string(),
        _ => cut.trim_end_matches('-').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn classifies_audio_video_and_other() {
        assert_eq!(media_kind(Some("audio/mpeg")), MediaKind::Audio);
        assert_eq!(media_kind(Some("VIDEO/MP4")), MediaKind::Video);
        assert_eq!(media_kind(Some("application/pdf")), MediaKind::Other);
        assert_eq!(media_kind(Some("")), MediaKind::Other);
        assert_eq!(media_kind(None), MediaKind::Other);
    }

    #[test]
    fn mime_from_path_ignores_query_and_case() {
        assert_eq!(mime_from_path("/data/ep.MP4?x=1"), Some("video/mp4"));
        assert_eq!(mime_from_path("episode.mp3"), Some("audio/mpeg"));
        assert_eq!(mime_from_path("episode"), None);
        assert_eq!(mime_from_path("notes.txt"), None);
    }

    #[test]
    fn extension_prefers_url_then_mime_then_mp3() {
        assert_eq!(media_extension("https://example.com/a.m4a", None), "m4a");
        assert_eq!(
            media_extension("https://example.com/a.MP3?token=abc", Some("audio/ogg")),
            "mp3"
        );
        assert_eq!(
            media_extension("https://example.com/stream", Some("audio/ogg; codecs=opus")),
            "ogg"
        );
        assert_eq!(media_extension("https://example.com/page.html", None), "mp3");
        assert_eq!(media_extension("not a url", None), "mp3");
    }

    #[test]
    fn sanitize_collapses_and_trims() {
        assert_eq!(sanitize_title("  --Episode: A \"Test\"--  "), "Episode-A-Test");
        assert_eq!(sanitize_title("a - - - b"), "a-b");
        assert_eq!(sanitize_title("path/to\\file"), "path-to-file");
        assert_eq!(sanitize_title("Café résumé"), "Caf-r-sum");
        assert_eq!(sanitize_title(":::///"), "");
    }

    #[test]
    fn sanitize_truncates_long_titles() {
        let long = "word-".repeat(40);
        let result = sanitize_title(&long);
        assert!(result.len() <= MAX_TITLE_LENGTH);
        assert!(!result.ends_with('-'));

        let solid = "a".repeat(150);
        assert_eq!(sanitize_title(&solid).len(), MAX_TITLE_LENGTH);
    }

    #[test]
    fn file_name_includes_date_prefix() {
        let published = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        assert_eq!(
            generate_file_name(
                "My Episode",
                Some(published),
                "https://example.com/audio.mp3",
                None
            ),
            "2024-01-15-My-Episode.mp3"
        );
    }

    #[test]
    fn file_name_without_date_or_title() {
        assert_eq!(
            generate_file_name("Test Episode", None, "https://example.com/e", None),
            "undated-Test-Episode.mp3"
        );
        assert_eq!(
            generate_file_name("???", None, "https://example.com/e.ogg", None),
            "undated.ogg"
        );
    }

    #[test]
    fn unique_name_counts_up_before_extension() {
        let taken = ["ep.mp3", "ep-2.mp3"];
        assert_eq!(unique_file_name("new.mp3", |n| taken.contains(&n)), "new.mp3");
        assert_eq!(unique_file_name("ep.mp3", |n| taken.contains(&n)), "ep-3.mp3");
        assert_eq!(unique_file_name("ep", |n| n == "ep"), "ep-2");
    }
}
