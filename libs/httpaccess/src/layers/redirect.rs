//! Redirect policy of the pooled client
//!
//! Redirects are followed transparently, to any host, up to a limit. Method
//! rewriting (301/302/303 → GET, 307/308 replay) is left to tower-http's
//! standard handling; this policy only decides whether to follow and cleans up
//! credentials when a hop leaves the original origin. A body streamed from
//! files cannot be replayed, so a 307/308 answer to it is returned unfollowed.

use crate::body::OutgoingBody;
use crate::config::RedirectConfig;
use http::{Request, Uri, header};
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

/// Headers removed once a redirect chain has crossed origins
const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Follow-everything redirect policy with a hop limit.
///
/// A fresh clone is used for each request, so the counters are per request.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    config: RedirectConfig,
    redirect_count: usize,
    cross_origin_detected: bool,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(config: RedirectConfig) -> Self {
        Self {
            config,
            redirect_count: 0,
            cross_origin_detected: false,
        }
    }

    fn should_follow(&mut self, previous: &Uri, target: &Uri) -> bool {
        self.redirect_count += 1;
        if self.redirect_count > self.config.max_redirects {
            tracing::debug!(
                count = self.redirect_count,
                max = self.config.max_redirects,
                "Redirect limit reached"
            );
            return false;
        }

        if !self.config.allow_https_downgrade && is_https_downgrade(previous, target) {
            tracing::warn!(
                previous = %crate::security::redact_url(&previous.to_string()),
                target = %crate::security::redact_url(&target.to_string()),
                "Blocking HTTPS to HTTP downgrade redirect"
            );
            return false;
        }

        if !is_same_origin(previous, target) {
            self.cross_origin_detected = true;
        }
        true
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "https" => 443,
        _ => 0,
    }
}

/// Same scheme, host and port. Missing schemes count as `https`.
fn is_same_origin(original: &Uri, target: &Uri) -> bool {
    let orig_scheme = original.scheme_str().unwrap_or("https");
    let target_scheme = target.scheme_str().unwrap_or("https");

    let orig_port = original
        .port_u16()
        .unwrap_or_else(|| default_port(orig_scheme));
    let target_port = target
        .port_u16()
        .unwrap_or_else(|| default_port(target_scheme));

    orig_scheme == target_scheme
        && original.host().unwrap_or("") == target.host().unwrap_or("")
        && orig_port == target_port
}

fn is_https_downgrade(original: &Uri, target: &Uri) -> bool {
    original.scheme_str() == Some("https") && target.scheme_str() == Some("http")
}

impl<E> Policy<OutgoingBody, E> for RedirectPolicy {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        if self.should_follow(attempt.previous(), attempt.location()) {
            Ok(Action::Follow)
        } else {
            Ok(Action::Stop)
        }
    }

    fn on_request(&mut self, request: &mut Request<OutgoingBody>) {
        if self.cross_origin_detected && self.config.strip_sensitive_headers {
            let headers = request.headers_mut();
            for name in SENSITIVE_HEADERS {
                if headers.remove(name).is_some() {
                    tracing::debug!(header = %name, "Stripped sensitive header on cross-origin redirect");
                }
            }
        }
    }

    fn clone_body(&self, body: &OutgoingBody) -> Option<OutgoingBody> {
        body.try_clone()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_follows_cross_origin_and_marks_it() {
        let mut policy = RedirectPolicy::new(RedirectConfig::default());
        assert!(policy.should_follow(&uri("http://a.example/x"), &uri("http://a.example/y")));
        assert!(!policy.cross_origin_detected);

        assert!(policy.should_follow(&uri("http://a.example/y"), &uri("http://b.example/z")));
        assert!(policy.cross_origin_detected);
    }

    #[test]
    fn test_limit_is_enforced() {
        let mut policy = RedirectPolicy::new(RedirectConfig {
            max_redirects: 2,
            ..Default::default()
        });
        let from = uri("http://a.example/1");
        let to = uri("http://a.example/2");
        assert!(policy.should_follow(&from, &to));
        assert!(policy.should_follow(&from, &to));
        assert!(!policy.should_follow(&from, &to));
    }

    #[test]
    fn test_disabled_never_follows() {
        let mut policy = RedirectPolicy::new(RedirectConfig::disabled());
        assert!(!policy.should_follow(&uri("http://a.example/1"), &uri("http://a.example/2")));
    }

    #[test]
    fn test_downgrade_blocked_unless_allowed() {
        let from = uri("https://a.example/");
        let to = uri("http://a.example/");

        let mut strict = RedirectPolicy::new(RedirectConfig::default());
        assert!(!strict.should_follow(&from, &to));

        let mut lax = RedirectPolicy::new(RedirectConfig {
            allow_https_downgrade: true,
            ..Default::default()
        });
        assert!(lax.should_follow(&from, &to));
    }

    #[test]
    fn test_same_origin_rules() {
        assert!(is_same_origin(
            &uri("https://example.com/foo"),
            &uri("https://example.com:443/bar")
        ));
        assert!(!is_same_origin(
            &uri("https://example.com/foo"),
            &uri("https://example.com:8443/bar")
        ));
        assert!(!is_same_origin(
            &uri("https://example.com/foo"),
            &uri("http://example.com/foo")
        ));
    }

    #[test]
    fn test_sensitive_headers_stripped_after_cross_origin() {
        let mut policy = RedirectPolicy::new(RedirectConfig::default());
        assert!(policy.should_follow(&uri("http://a.example/"), &uri("http://b.example/")));

        let mut request = Request::builder()
            .header(header::AUTHORIZATION, "Bearer t")
            .header(header::COOKIE, "s=1")
            .header("x-keep", "1")
            .body(OutgoingBody::empty())
            .unwrap();
        Policy::<OutgoingBody, ()>::on_request(&mut policy, &mut request);

        assert!(request.headers().get(header::AUTHORIZATION).is_none());
        assert!(request.headers().get(header::COOKIE).is_none());
        assert_eq!(request.headers()["x-keep"], "1");
    }

    #[test]
    fn test_only_buffered_bodies_are_replayed() {
        let policy = RedirectPolicy::new(RedirectConfig::default());
        let buffered = OutgoingBody::buffered(&b"payload"[..]);
        assert!(Policy::<OutgoingBody, ()>::clone_body(&policy, &buffered).is_some());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.bin");
        std::fs::write(&path, "x").unwrap();
        let mut segments = crate::body::SegmentedBody::new();
        segments.push_file(std::fs::File::open(&path).unwrap().into(), 1);
        let streamed = segments.finish();
        assert!(Policy::<OutgoingBody, ()>::clone_body(&policy, &streamed).is_none());
    }
}
