//! Video URL to iframe embed translation.
//!
//! Recognizes the two hosting families the legacy sites used. Anything
//! else returns `None`; the caller logs and keeps the body unchanged.

use std::sync::LazyLock;

use regex::Regex;

static YOUTUBE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/)([A-Za-z0-9_-]+)")
        .expect("youtube pattern must compile")
});

static VIMEO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"vimeo\.com/(\d+)").expect("vimeo pattern must compile"));

/// Translate a raw video URL into an iframe embed fragment.
pub fn translate(video_url: &str) -> Option<String> {
    if let Some(captures) = YOUTUBE_RE.captures(video_url) {
        let id = &captures[1];
        return Some(format!(
            r#"<p><iframe width="560" height="315" src="https://www.youtube.com/embed/{id}" frameborder="0" allow="accelerometer; autoplay; clipboard-write; encrypted-media; gyroscope; picture-in-picture" allowfullscreen></iframe></p>"#
        ));
    }

    if let Some(captures) = VIMEO_RE.captures(video_url) {
        let id = &captures[1];
        return Some(format!(
            r#"<p><iframe src="https://player.vimeo.com/video/{id}" width="560" height="315" frameborder="0" allow="autoplay; fullscreen; picture-in-picture" allowfullscreen></iframe></p>"#
        ));
    }

    None
}
