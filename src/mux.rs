//! Hierarchical `(scheme, host, path)` request routing with wildcard hosts,
//! path canonicalization, and trailing-slash subtree redirects.
//!
//! Registration (`Mux::handle`) only ever runs at setup time under an
//! exclusive lock; lookups (`Mux::resolve`, and `Handler::handle` through
//! it) take the shared lock and treat the pattern set as effectively
//! immutable.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use futures_core::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::handler::Handler;
use crate::response_writer::Sink;
use crate::types::{Meta, Request, Status};

type Key = (String, String, String);

struct Entry {
    scheme: String,
    host: String,
    path: String,
    handler: Arc<dyn Handler>,
}

#[derive(Default)]
struct Patterns {
    exact: HashMap<Key, Arc<dyn Handler>>,
    /// Subtree (trailing-`/`) entries, kept sorted longest-path-first (ties
    /// broken by longer scheme then longer host) so the first match in
    /// iteration order is the most specific one.
    subtrees: Vec<Entry>,
}

/// A request multiplexer: routes `(scheme, host, path)` to a registered
/// [`Handler`], canonicalizing paths and redirecting to canonical form or
/// to a matching subtree as needed.
pub struct Mux {
    patterns: RwLock<Patterns>,
}

impl Mux {
    /// An empty multiplexer.
    pub fn new() -> Self {
        Self { patterns: RwLock::new(Patterns::default()) }
    }

    /// Registers `handler` at `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is already registered — this is a programming
    /// error, not a runtime condition.
    pub fn handle(&self, pattern: &str, handler: impl Handler + 'static) {
        self.try_handle(pattern, handler).expect("sextant: invalid or duplicate mux pattern");
    }

    /// Fallible form of [`Self::handle`], for callers that build patterns
    /// dynamically and want to handle a malformed pattern as a recoverable
    /// error instead of a panic.
    pub fn try_handle(&self, pattern: &str, handler: impl Handler + 'static) -> Result<(), Error> {
        let (scheme, host, path) = parse_pattern(pattern)?;
        let key = (scheme.clone(), host.clone(), path.clone());
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let mut patterns = self.patterns.write().expect("mux lock poisoned");

        if patterns.exact.contains_key(&key) {
            return Err(Error::InvalidRequest(format!("pattern {:?} already registered", pattern)));
        }

        patterns.exact.insert(key, handler.clone());

        if path.ends_with('/') {
            patterns.subtrees.push(Entry { scheme, host, path, handler });
            patterns.subtrees.sort_by(|a, b| {
                b.path.len().cmp(&a.path.len())
                    .then_with(|| b.scheme.len().cmp(&a.scheme.len()))
                    .then_with(|| b.host.len().cmp(&a.host.len()))
            });
        }

        Ok(())
    }

    /// Resolves `req` to a dispatch decision without performing any I/O.
    pub fn resolve(&self, req: &Request) -> Dispatch {
        let scheme = req.url().scheme().map(|s| s.as_str().to_ascii_lowercase()).unwrap_or_default();
        let host = req
            .url()
            .authority()
            .map(|authority| authority.host().to_string().to_ascii_lowercase())
            .unwrap_or_default();
        let raw_path = req.url().path().to_string();

        let canonical = clean_path(&raw_path);
        if canonical != raw_path {
            return Dispatch::Redirect(canonical);
        }

        let patterns = self.patterns.read().expect("mux lock poisoned");

        if let Some((handler, trailing)) = lookup_exact(&patterns.exact, &scheme, &host, &canonical, &[]) {
            return Dispatch::Handler(handler, trailing);
        }

        if let Some((handler, trailing)) = lookup_subtree(&patterns.subtrees, &scheme, &host, &canonical) {
            return Dispatch::Handler(handler, trailing);
        }

        if !is_ip_literal(&host) {
            if let Some(suffix) = host.split_once('.').map(|(_, rest)| rest) {
                let wildcard_host = format!("*.{}", suffix);

                if let Some((handler, trailing)) = lookup_exact(&patterns.exact, &scheme, &wildcard_host, &canonical, &[]) {
                    return Dispatch::Handler(handler, trailing);
                }
                if let Some((handler, trailing)) = lookup_subtree(&patterns.subtrees, &scheme, &wildcard_host, &canonical) {
                    return Dispatch::Handler(handler, trailing);
                }
            }
        }

        if !canonical.ends_with('/') {
            let with_slash = format!("{}/", canonical);
            let exists = [
                (scheme.as_str(), host.as_str()),
                ("", host.as_str()),
                (scheme.as_str(), ""),
                ("", ""),
            ]
            .iter()
            .any(|(s, h)| patterns.exact.contains_key(&(s.to_string(), h.to_string(), with_slash.clone())));

            if exists {
                return Dispatch::Redirect(with_slash);
            }
        }

        Dispatch::NotFound
    }
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of resolving a request against a [`Mux`].
pub enum Dispatch {
    /// A handler matched; `trailing` holds the path segments past the
    /// matched subtree prefix (empty for an exact match).
    Handler(Arc<dyn Handler>, Vec<String>),
    /// The canonical location to redirect to with `31`.
    Redirect(String),
    /// Nothing matched; respond `51 Not found`.
    NotFound,
}

impl Handler for Mux {
    fn handle<'a>(
        &'a self,
        mut req: Request,
        writer: &'a mut dyn Sink,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        let dispatch = self.resolve(&req);

        Box::pin(async move {
            match dispatch {
                Dispatch::Handler(handler, trailing) => {
                    req.set_trailing_segments(trailing);
                    handler.handle(req, writer, cancel).await
                }
                Dispatch::Redirect(location) => {
                    writer.write_header(Status::REDIRECT_PERMANENT, Meta::new_lossy(location)).await
                }
                Dispatch::NotFound => writer.write_header(Status::NOT_FOUND, Meta::new_lossy("Not found")).await,
            }
        })
    }
}

fn lookup_exact(
    exact: &HashMap<Key, Arc<dyn Handler>>,
    scheme: &str,
    host: &str,
    path: &str,
    trailing: &[String],
) -> Option<(Arc<dyn Handler>, Vec<String>)> {
    [
        (scheme, host),
        ("", host),
        (scheme, ""),
        ("", ""),
    ]
    .iter()
    .find_map(|(s, h)| exact.get(&(s.to_string(), h.to_string(), path.to_string())))
    .cloned()
    .map(|handler| (handler, trailing.to_vec()))
}

fn lookup_subtree(
    subtrees: &[Entry],
    scheme: &str,
    host: &str,
    path: &str,
) -> Option<(Arc<dyn Handler>, Vec<String>)> {
    subtrees
        .iter()
        .find(|entry| {
            (entry.scheme.is_empty() || entry.scheme == scheme)
                && (entry.host.is_empty() || entry.host == host)
                && path.starts_with(entry.path.as_str())
        })
        .map(|entry| {
            let trailing = path[entry.path.len()..]
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            (entry.handler.clone(), trailing)
        })
}

fn is_ip_literal(host: &str) -> bool {
    IpAddr::from_str(host).is_ok()
}

/// Parses a registration pattern into its `(scheme, host, path)` key.
/// `""` stands for "any" in `scheme`/`host`; a bare `/path` pattern
/// defaults `scheme` to `"gemini"` rather than `""` (an unqualified
/// pattern is assumed to be a Gemini route, not a truly scheme-agnostic
/// one — use `///path` for that).
fn parse_pattern(pattern: &str) -> Result<(String, String, String), Error> {
    if pattern.is_empty() {
        return Err(Error::InvalidRequest("pattern must not be empty".into()));
    }

    if let Some(idx) = pattern.find("://") {
        let scheme = pattern[..idx].to_string();
        let (host, path) = split_host_path(&pattern[idx + 3..])?;
        return Ok((scheme, host, path));
    }

    if let Some(rest) = pattern.strip_prefix("//") {
        let (host, path) = split_host_path(rest)?;
        return Ok((String::new(), host, path));
    }

    if pattern.starts_with('/') {
        return Ok(("gemini".to_string(), String::new(), pattern.to_string()));
    }

    let (host, path) = split_host_path(pattern)?;
    Ok(("gemini".to_string(), host, path))
}

fn split_host_path(rest: &str) -> Result<(String, String), Error> {
    let idx = rest.find('/').ok_or_else(|| Error::InvalidRequest(format!("pattern {:?} has no path", rest)))?;
    let host = strip_port(&rest[..idx]);
    Ok((host, rest[idx..].to_string()))
}

fn strip_port(host: &str) -> String {
    match host.rfind(':') {
        Some(idx) if !host[idx + 1..].is_empty() && host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => {
            host[..idx].to_string()
        }
        _ => host.to_string(),
    }
}

/// Lexically cleans `path`: ensures a leading `/`, collapses `.`, `..`, and
/// duplicate slashes, and preserves a trailing `/` from the input unless
/// the cleaned path is just `/`.
///
/// This is deliberately not a purely numeric clean that drops trailing
/// slashes — trailing-slash-ness determines subtree dispatch.
pub fn clean_path(path: &str) -> String {
    let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };

    let had_trailing_slash = path.len() > 1 && path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut cleaned = format!("/{}", segments.join("/"));
    if had_trailing_slash && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_path() {
        assert_eq!(parse_pattern("/x").unwrap(), ("gemini".into(), "".into(), "/x".into()));
    }

    #[test]
    fn parses_host_path() {
        assert_eq!(parse_pattern("example.com/x").unwrap(), ("gemini".into(), "example.com".into(), "/x".into()));
    }

    #[test]
    fn parses_scheme_host_path() {
        assert_eq!(
            parse_pattern("titan://example.com/x").unwrap(),
            ("titan".into(), "example.com".into(), "/x".into())
        );
    }

    #[test]
    fn parses_host_wildcard() {
        assert_eq!(parse_pattern("//example.com/x").unwrap(), ("".into(), "example.com".into(), "/x".into()));
    }

    #[test]
    fn parses_scheme_wildcard_host() {
        assert_eq!(parse_pattern("gemini:///x").unwrap(), ("gemini".into(), "".into(), "/x".into()));
    }

    #[test]
    fn parses_fully_wildcard() {
        assert_eq!(parse_pattern("///x").unwrap(), ("".into(), "".into(), "/x".into()));
    }

    #[test]
    fn strips_port_from_pattern_host() {
        assert_eq!(parse_pattern("example.com:1965/x").unwrap().1, "example.com");
    }

    #[test]
    fn clean_path_collapses_dot_segments() {
        assert_eq!(clean_path("/a/../b"), "/b");
        assert_eq!(clean_path("//a//b"), "/a/b");
        assert_eq!(clean_path("/.."), "/");
    }

    #[test]
    fn clean_path_preserves_trailing_slash() {
        assert_eq!(clean_path("/a/"), "/a/");
        assert_eq!(clean_path("/a/.."), "/");
    }

    struct Noop;

    impl Handler for Noop {
        fn handle<'a>(
            &'a self,
            _req: Request,
            _writer: &'a mut dyn Sink,
            _cancel: CancellationToken,
        ) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn req(url: &str) -> Request {
        use std::convert::TryFrom;
        Request::from_url(crate::types::URIReference::try_from(url).unwrap().into_owned()).unwrap()
    }

    fn dispatch_kind(mux: &Mux, url: &str) -> &'static str {
        match mux.resolve(&req(url)) {
            Dispatch::Handler(..) => "handler",
            Dispatch::Redirect(_) => "redirect",
            Dispatch::NotFound => "not_found",
        }
    }

    fn built_mux() -> Mux {
        let mux = Mux::new();
        mux.handle("/a", Noop);
        mux.handle("/b/", Noop);
        mux.handle("/b/c/d", Noop);
        mux.handle("/b/c/d/", Noop);
        mux
    }

    #[test]
    fn matches_spec_table() {
        let mux = built_mux();

        assert_eq!(dispatch_kind(&mux, "gemini://example.com"), "redirect");
        assert_eq!(dispatch_kind(&mux, "gemini://example.com/c"), "not_found");
        assert_eq!(dispatch_kind(&mux, "gemini://example.com/a"), "handler");
        assert_eq!(dispatch_kind(&mux, "gemini://example.com/a/"), "not_found");
        assert_eq!(dispatch_kind(&mux, "gemini://example.com/b"), "redirect");
        assert_eq!(dispatch_kind(&mux, "gemini://example.com/b/c"), "handler");
        assert_eq!(dispatch_kind(&mux, "gemini://example.com/b/c/d"), "handler");
        assert_eq!(dispatch_kind(&mux, "gemini://example.com/b/c/d/e/"), "handler");

        match mux.resolve(&req("gemini://example.com/b")) {
            Dispatch::Redirect(location) => assert_eq!(location, "/b/"),
            _ => panic!("expected redirect"),
        }
    }

    #[test]
    fn deepest_subtree_wins() {
        let mux = built_mux();

        let trailing = match mux.resolve(&req("gemini://example.com/b/c/d/e/")) {
            Dispatch::Handler(_, trailing) => trailing,
            _ => panic!("expected handler"),
        };
        assert_eq!(trailing, vec!["e"]);
    }

    #[test]
    fn wildcard_host_matches_single_label() {
        let mux = Mux::new();
        mux.handle("*.example.com/", Noop);

        assert!(matches!(mux.resolve(&req("gemini://mail.example.com/")), Dispatch::Handler(..)));
        assert!(matches!(mux.resolve(&req("gemini://example.com/")), Dispatch::NotFound));
        assert!(matches!(mux.resolve(&req("gemini://a.b.example.com/")), Dispatch::NotFound));
    }

    #[test]
    fn wildcard_host_respects_pattern_scheme() {
        let mux = Mux::new();
        mux.handle("*.example.com/", Noop);

        assert!(matches!(mux.resolve(&req("titan://mail.example.com/")), Dispatch::NotFound));
    }
}
