//! Link classification and resolution.
//!
//! Turns an arbitrary locator into something fetchable: unwraps corporate
//! security-proxy wrappers, follows redirect chains, applies per-platform
//! rewrite rules from an ordered table, and confirms the final URL is
//! reachable. Everything except the network steps is pure and testable
//! offline.

use std::path::Path;
use std::time::Duration;

use glob::Pattern;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::domain::{ContentLocator, SharingPlatform, VideoPlatform};

/// Security-wrapper unwrapping stops after this many hops
pub const MAX_UNWRAP_HOPS: usize = 5;

/// Redirect chains longer than this fail resolution
pub const MAX_REDIRECT_HOPS: usize = 10;

/// Timeout for the reachability probe and each redirect hop
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Some sharing hosts refuse requests with non-browser user agents
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("could not classify locator: {0}")]
    Unrecognized(String),

    #[error("redirect chain exceeded {limit} hops starting from {url}")]
    TooManyRedirects { url: String, limit: usize },

    #[error("security-wrapper unwrap did not converge after {limit} hops: {url}")]
    UnwrapLoopDetected { url: String, limit: usize },

    #[error("resolved URL is not reachable: {url} ({reason})")]
    Unreachable { url: String, reason: String },
}

/// A URL ready to hand to the fetcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl(pub String);

/// One entry in the ordered platform rule table
struct HostRule {
    /// Glob over the URL host, e.g. `*dropbox.com`
    pattern: Pattern,
    target: RuleTarget,
}

enum RuleTarget {
    Sharing(SharingPlatform),
    Video(VideoPlatform),
}

/// Classifies locators and resolves them to fetchable URLs
pub struct LinkResolver {
    rules: Vec<HostRule>,
    client: reqwest::Client,
}

impl Default for LinkResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkResolver {
    pub fn new() -> Self {
        Self {
            rules: host_rule_table(),
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .user_agent(BROWSER_USER_AGENT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Classify an input string into a ContentLocator.
    ///
    /// Rules are checked in table order; the first matching host pattern
    /// wins, so classification is deterministic. Unknown hosts classify as
    /// generic HTTP; anything that is not a URL is treated as a local path.
    pub fn classify(&self, input: &str) -> Result<ContentLocator, ResolutionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ResolutionError::Unrecognized(input.to_string()));
        }

        if !is_http_url(trimmed) {
            return Ok(ContentLocator::LocalPath {
                path: Path::new(trimmed).to_path_buf(),
            });
        }

        let host = match url_host(trimmed) {
            Some(host) => host,
            None => return Err(ResolutionError::Unrecognized(input.to_string())),
        };

        for rule in &self.rules {
            if rule.pattern.matches(&host) {
                return Ok(match rule.target {
                    RuleTarget::Sharing(platform) => ContentLocator::SharingService {
                        url: trimmed.to_string(),
                        platform,
                    },
                    RuleTarget::Video(platform) => ContentLocator::VideoHosting {
                        url: trimmed.to_string(),
                        platform,
                    },
                });
            }
        }

        Ok(ContentLocator::DirectUrl {
            url: trimmed.to_string(),
        })
    }

    /// Resolve a locator to a directly fetchable URL.
    ///
    /// Local paths pass through untouched (the fetcher handles them).
    #[instrument(skip(self), fields(locator = %locator))]
    pub async fn resolve(&self, locator: &ContentLocator) -> Result<ResolvedUrl, ResolutionError> {
        let url = match locator.url() {
            Some(url) => url.to_string(),
            None => {
                return Err(ResolutionError::Unrecognized(
                    "local paths are not resolved over the network".to_string(),
                ))
            }
        };

        // (a) peel security wrappers
        let unwrapped = unwrap_security_url(&url)?;
        if unwrapped != url {
            debug!(from = %url, to = %unwrapped, "Unwrapped security proxy URL");
        }

        // (b) follow redirect chains manually
        let followed = self.follow_redirects(&unwrapped).await?;

        // (c) apply the platform rewrite for wherever the URL landed
        let rewritten = self.rewrite_landed_url(&followed);

        // (d) confirm reachability before handing to the fetcher
        self.check_reachable(&rewritten).await?;

        Ok(ResolvedUrl(rewritten))
    }

    /// Platform rewrite keyed on the landed URL itself, not the original
    /// classification: a security-wrapped or redirected link lands on its
    /// real host only after steps (a) and (b)
    fn rewrite_landed_url(&self, url: &str) -> String {
        match self.classify(url) {
            Ok(ContentLocator::SharingService { platform, .. }) => {
                rewrite_sharing_url(url, platform)
            }
            _ => url.to_string(),
        }
    }

    /// Walk Location headers up to the hop limit
    async fn follow_redirects(&self, url: &str) -> Result<String, ResolutionError> {
        let mut current = url.to_string();

        for _ in 0..MAX_REDIRECT_HOPS {
            let response = self
                .client
                .head(&current)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await
                .map_err(|e| ResolutionError::Unreachable {
                    url: current.clone(),
                    reason: e.to_string(),
                })?;

            if !response.status().is_redirection() {
                return Ok(current);
            }

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok());

            match location {
                Some(next) => {
                    current = absolutize(&current, next);
                    debug!(next = %current, "Following redirect");
                }
                None => return Ok(current),
            }
        }

        Err(ResolutionError::TooManyRedirects {
            url: url.to_string(),
            limit: MAX_REDIRECT_HOPS,
        })
    }

    /// Lightweight existence check: HEAD, falling back to a ranged GET for
    /// hosts that reject HEAD
    async fn check_reachable(&self, url: &str) -> Result<(), ResolutionError> {
        let head = self
            .client
            .head(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        let status = match head {
            Ok(response) if !response.status().is_client_error() => return Ok(()),
            Ok(response) => response.status(),
            Err(e) => {
                return Err(ResolutionError::Unreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        // 405 and friends: retry with a one-byte GET
        let get = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ResolutionError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if get.status().is_client_error() {
            return Err(ResolutionError::Unreachable {
                url: url.to_string(),
                reason: format!("HEAD {} / GET {}", status, get.status()),
            });
        }

        Ok(())
    }
}

/// Ordered host rule table; first match wins
fn host_rule_table() -> Vec<HostRule> {
    fn rule(pattern: &str, target: RuleTarget) -> HostRule {
        HostRule {
            // Patterns in the table are static and valid
            pattern: Pattern::new(pattern).unwrap_or_else(|_| Pattern::new("-").unwrap()),
            target,
        }
    }

    vec![
        rule("*dropbox.com", RuleTarget::Sharing(SharingPlatform::Dropbox)),
        rule("drive.google.com", RuleTarget::Sharing(SharingPlatform::GoogleDrive)),
        rule("*onedrive.live.com", RuleTarget::Sharing(SharingPlatform::OneDrive)),
        rule("*box.com", RuleTarget::Sharing(SharingPlatform::Box)),
        rule("*wetransfer.com", RuleTarget::Sharing(SharingPlatform::WeTransfer)),
        rule("*youtube.com", RuleTarget::Video(VideoPlatform::YouTube)),
        rule("youtu.be", RuleTarget::Video(VideoPlatform::YouTube)),
        rule("*vimeo.com", RuleTarget::Video(VideoPlatform::Vimeo)),
        rule("*zoom.us", RuleTarget::Video(VideoPlatform::Zoom)),
        rule("*loom.com", RuleTarget::Video(VideoPlatform::Loom)),
    ]
}

pub(crate) fn is_http_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Host portion of a URL, lowercased, without auth/port
pub(crate) fn url_host(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1)?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Resolve a possibly-relative Location header against the current URL
fn absolutize(base: &str, location: &str) -> String {
    if is_http_url(location) {
        return location.to_string();
    }
    if let Some(rest) = location.strip_prefix("//") {
        return format!("https://{}", rest);
    }
    // Path-relative: keep scheme + host of the base
    let after_scheme = base.find("://").map(|i| i + 3).unwrap_or(0);
    let host_end = base[after_scheme..]
        .find('/')
        .map(|i| after_scheme + i)
        .unwrap_or(base.len());
    let origin = &base[..host_end];
    if location.starts_with('/') {
        format!("{}{}", origin, location)
    } else {
        format!("{}/{}", origin, location)
    }
}

/// Unwrap corporate security-proxy wrappers, recursively up to the hop
/// limit. The canonical (dedupe) form of a link is its fully unwrapped URL.
pub fn unwrap_security_url(url: &str) -> Result<String, ResolutionError> {
    let mut current = url.to_string();

    for _ in 0..MAX_UNWRAP_HOPS {
        match unwrap_once(&current) {
            Some(next) if next != current => current = next,
            _ => return Ok(current),
        }
    }

    // Still unwrapping after the limit means the wrappers loop
    if unwrap_once(&current).map_or(false, |next| next != current) {
        return Err(ResolutionError::UnwrapLoopDetected {
            url: url.to_string(),
            limit: MAX_UNWRAP_HOPS,
        });
    }

    Ok(current)
}

/// One unwrap step; None when the URL carries no known wrapper
fn unwrap_once(url: &str) -> Option<String> {
    // urldefense v3: https://urldefense.com/v3/__<encoded>__;!!...
    if url.contains("urldefense.com/v3/") {
        let inner = url.split("__").nth(1)?.split("__;").next().unwrap_or("");
        let percent_restored = inner.replace('*', "%");
        return Some(urlencoding::decode(&percent_restored).ok()?.into_owned());
    }

    // Proofpoint v2: wrapped target in the `u` query parameter with its own
    // substitution cipher
    if url.contains("urldefense.proofpoint.com") {
        let raw = query_param(url, "u")?;
        let restored = raw.replace('-', "%").replace('_', "/");
        return Some(urlencoding::decode(&restored).ok()?.into_owned());
    }

    // SafeLinks / Mimecast / urlscan carry the target in a well-known param
    for wrapper in [
        "safelinks.protection.outlook.com",
        "protect-us.mimecast.com",
        "urlscan.io",
    ] {
        if url.contains(wrapper) {
            for param in ["url", "u", "link", "target"] {
                if let Some(raw) = query_param(url, param) {
                    if let Ok(decoded) = urlencoding::decode(&raw) {
                        return Some(decoded.into_owned());
                    }
                }
            }
        }
    }

    None
}

/// First value of a query parameter, still percent-encoded
fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split('?').nth(1)?.split('#').next()?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            return Some(parts.next().unwrap_or("").to_string());
        }
    }
    None
}

/// Apply the platform-specific direct-download rewrite.
///
/// Rewrites are idempotent: applying one to an already-rewritten URL
/// changes nothing.
pub fn rewrite_sharing_url(url: &str, platform: SharingPlatform) -> String {
    match platform {
        SharingPlatform::Dropbox => rewrite_dropbox(url),
        SharingPlatform::GoogleDrive => rewrite_google_drive(url),
        // Other platforms serve direct downloads from their share links
        SharingPlatform::OneDrive | SharingPlatform::Box | SharingPlatform::WeTransfer => {
            url.to_string()
        }
    }
}

/// Force the Dropbox direct-download flag: dl=0 becomes dl=1, a missing
/// flag is appended, an existing dl=1 is left alone
fn rewrite_dropbox(url: &str) -> String {
    if url.contains("dl=1") {
        return url.to_string();
    }
    if url.contains("?dl=0") {
        return url.replace("?dl=0", "?dl=1");
    }
    if url.contains("&dl=0") {
        return url.replace("&dl=0", "&dl=1");
    }
    if url.contains('?') {
        format!("{}&dl=1", url)
    } else {
        format!("{}?dl=1", url)
    }
}

/// Transform a Drive "view" URL into the export/download endpoint
fn rewrite_google_drive(url: &str) -> String {
    if url.contains("uc?export=download") {
        return url.to_string();
    }
    if let Some(after) = url.split("/file/d/").nth(1) {
        let file_id = after.split(['/', '?']).next().unwrap_or("");
        if !file_id.is_empty() {
            return format!("https://drive.google.com/uc?export=download&id={}", file_id);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rule_table() {
        let resolver = LinkResolver::new();

        let dropbox = resolver
            .classify("https://www.dropbox.com/s/abc/call.mp3?dl=0")
            .unwrap();
        assert!(matches!(
            dropbox,
            ContentLocator::SharingService {
                platform: SharingPlatform::Dropbox,
                ..
            }
        ));

        let youtube = resolver
            .classify("https://youtu.be/dQw4w9WgXcQ")
            .unwrap();
        assert!(matches!(
            youtube,
            ContentLocator::VideoHosting {
                platform: VideoPlatform::YouTube,
                ..
            }
        ));

        let unknown = resolver
            .classify("https://cdn.example.net/audio/call.mp3")
            .unwrap();
        assert!(matches!(unknown, ContentLocator::DirectUrl { .. }));

        let local = resolver.classify("/tmp/call.wav").unwrap();
        assert!(matches!(local, ContentLocator::LocalPath { .. }));
    }

    #[test]
    fn test_dropbox_rewrite_is_idempotent() {
        let once = rewrite_dropbox("https://dropbox.com/s/abc123/call.mp3?dl=0");
        assert_eq!(once, "https://dropbox.com/s/abc123/call.mp3?dl=1");

        let twice = rewrite_dropbox(&once);
        assert_eq!(twice, once);

        let bare = rewrite_dropbox("https://dropbox.com/s/abc123/call.mp3");
        assert_eq!(bare, "https://dropbox.com/s/abc123/call.mp3?dl=1");
    }

    #[test]
    fn test_google_drive_rewrite() {
        let rewritten = rewrite_google_drive(
            "https://drive.google.com/file/d/1AbCdEf/view?usp=sharing",
        );
        assert_eq!(
            rewritten,
            "https://drive.google.com/uc?export=download&id=1AbCdEf"
        );
        assert_eq!(rewrite_google_drive(&rewritten), rewritten);
    }

    #[test]
    fn test_unwrap_safelinks() {
        let wrapped = format!(
            "https://nam02.safelinks.protection.outlook.com/?url={}&data=05",
            urlencoding::encode("https://dropbox.com/s/abc/call.mp3?dl=0")
        );
        let unwrapped = unwrap_security_url(&wrapped).unwrap();
        assert_eq!(unwrapped, "https://dropbox.com/s/abc/call.mp3?dl=0");
    }

    #[test]
    fn test_unwrap_urldefense_v3() {
        let wrapped = "https://urldefense.com/v3/__https://example.com/call.mp3__;!!token$";
        let unwrapped = unwrap_security_url(wrapped).unwrap();
        assert_eq!(unwrapped, "https://example.com/call.mp3");
    }

    #[test]
    fn test_unwrap_loop_detection() {
        // Each unwrap yields another SafeLinks layer pointing at itself
        let mut url = "https://example.com/a.mp3".to_string();
        for _ in 0..(MAX_UNWRAP_HOPS + 2) {
            url = format!(
                "https://nam02.safelinks.protection.outlook.com/?url={}",
                urlencoding::encode(&url)
            );
        }
        let err = unwrap_security_url(&url).unwrap_err();
        assert!(matches!(err, ResolutionError::UnwrapLoopDetected { .. }));
    }

    #[test]
    fn test_wrapped_sharing_link_still_gets_its_rewrite() {
        let resolver = LinkResolver::new();

        // A SafeLinks-wrapped Dropbox URL classifies as DirectUrl (the
        // visible host is the wrapper), so the rewrite has to key on the
        // unwrapped URL instead
        let wrapped = format!(
            "https://nam02.safelinks.protection.outlook.com/?url={}",
            urlencoding::encode("https://www.dropbox.com/s/abc/call.mp3?dl=0")
        );
        assert!(matches!(
            resolver.classify(&wrapped).unwrap(),
            ContentLocator::DirectUrl { .. }
        ));

        let unwrapped = unwrap_security_url(&wrapped).unwrap();
        assert_eq!(
            resolver.rewrite_landed_url(&unwrapped),
            "https://www.dropbox.com/s/abc/call.mp3?dl=1"
        );

        let drive = unwrap_security_url(&format!(
            "https://nam02.safelinks.protection.outlook.com/?url={}",
            urlencoding::encode("https://drive.google.com/file/d/1AbCdEf/view")
        ))
        .unwrap();
        assert_eq!(
            resolver.rewrite_landed_url(&drive),
            "https://drive.google.com/uc?export=download&id=1AbCdEf"
        );

        // Non-sharing hosts pass through untouched
        assert_eq!(
            resolver.rewrite_landed_url("https://cdn.example.net/call.mp3"),
            "https://cdn.example.net/call.mp3"
        );
    }

    #[test]
    fn test_url_host_extraction() {
        assert_eq!(
            url_host("https://www.Dropbox.com/s/abc?dl=0"),
            Some("www.dropbox.com".to_string())
        );
        assert_eq!(
            url_host("http://user@host.example:8080/x"),
            Some("host.example".to_string())
        );
        assert_eq!(url_host("not a url"), None);
    }

    #[test]
    fn test_absolutize_location() {
        assert_eq!(
            absolutize("https://a.example/x/y", "/z"),
            "https://a.example/z"
        );
        assert_eq!(
            absolutize("https://a.example/x", "https://b.example/y"),
            "https://b.example/y"
        );
        assert_eq!(
            absolutize("https://a.example/x", "//c.example/y"),
            "https://c.example/y"
        );
    }
}
