//! Link extraction from email bodies.
//!
//! Plain-text bodies are scanned with a URL regex; HTML bodies additionally
//! yield their href attributes, since tracking-wrapped links rarely appear
//! as visible text. Extraction is deliberately generous; the candidate
//! filter afterwards keeps only links that plausibly point at media.

use std::sync::OnceLock;

use regex::Regex;

use crate::core::fetcher::{AUDIO_EXTENSIONS, VIDEO_EXTENSIONS};
use crate::core::resolver::url_host;

/// Hosts whose links are always worth resolving, media extension or not
const MEDIA_HOSTS: &[&str] = &[
    "dropbox.com",
    "drive.google.com",
    "docs.google.com",
    "onedrive.live.com",
    "1drv.ms",
    "box.com",
    "wetransfer.com",
    "we.tl",
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "zoom.us",
    "loom.com",
];

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("static pattern"))
}

fn href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("static pattern"))
}

/// Extract every URL from a message's plain and HTML bodies, in order of
/// appearance, deduplicated
pub fn extract_links(text_body: &str, html_body: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut push = |raw: &str| {
        let url = tidy_url(raw);
        if !url.is_empty() && !links.contains(&url) {
            links.push(url);
        }
    };

    for m in url_regex().find_iter(text_body) {
        push(m.as_str());
    }

    for caps in href_regex().captures_iter(html_body) {
        if let Some(href) = caps.get(1) {
            let href = href.as_str();
            if href.starts_with("http://") || href.starts_with("https://") {
                push(href);
            }
        }
    }

    // hrefs were already taken above; this catches URLs in the HTML text
    for m in url_regex().find_iter(html_body) {
        push(m.as_str());
    }

    links
}

/// Decode the HTML entities that commonly appear inside hrefs and strip
/// trailing sentence punctuation that the regex swallowed
fn tidy_url(raw: &str) -> String {
    let decoded = raw
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    decoded
        .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '>', '"', '\''])
        .to_string()
}

/// Does this (already unwrapped) URL plausibly point at audio or video?
pub fn is_media_candidate(url: &str) -> bool {
    let Some(host) = url_host(url) else {
        return false;
    };

    if MEDIA_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
    {
        return true;
    }

    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next() {
        Some(ext) => {
            let ext = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str()) || VIDEO_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}
