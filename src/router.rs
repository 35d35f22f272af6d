//! Fingerprint-addressed request router: a small hot table backed by hash
//! buckets, with `:param` path segments for everything that doesn't fit in
//! the hot table.
//!
//! The router never boxes a handler. It is generic over a `T: Clone` route
//! value (typically a small `enum RouteId` or a plain `usize`) that a single
//! [`crate::Handler`] implementation looks up and dispatches on itself —
//! there is exactly one `Handler` per server (per the crate's design), and
//! the router's job is only to turn `(method, path)` into "which route, with
//! which captured params", not to own per-route callbacks.

use crate::http::types::Method;

/// The route value [`crate::Handler::handle`] receives: "a small
/// integer/route-id" per this router's design, looked up once and matched
/// against in the handler's own dispatch (a `match route_id { .. }`) rather
/// than the router owning a per-route callback.
pub type RouteId = u32;

/// Number of slots in the hot table before routes spill into hash buckets
/// only.
const HOT_TABLE_CAPACITY: usize = 16;

/// Number of hash buckets probed on a hot-table miss.
const BUCKET_COUNT: usize = 64;

/// Maximum number of `:param` captures per matched route.
const MAX_PARAMS: usize = 16;

/// A matched route: the registered value and any captured `:param` segments.
#[derive(Debug, Clone)]
pub struct RouteMatch<'a, T> {
    /// The value passed to [`Router::insert`] for the matched route.
    pub value: T,
    /// `(name, captured value)` pairs, in path order. Only populated for
    /// parameterized routes.
    pub params: RouteParams<'a>,
}

/// Inline, zero-allocation storage for up to [`MAX_PARAMS`] captured path
/// segments.
///
/// Parameter names borrow from the [`Router`]'s compiled patterns and values
/// borrow from the matched request path, so a `RouteParams` cannot outlive
/// either.
#[derive(Debug, Clone, Default)]
pub struct RouteParams<'a> {
    entries: [(&'a str, &'a str); MAX_PARAMS],
    len: usize,
}

impl<'a> RouteParams<'a> {
    #[inline]
    fn push(&mut self, name: &'a str, value: &'a str) -> bool {
        if self.len >= MAX_PARAMS {
            return false;
        }
        self.entries[self.len] = (name, value);
        self.len += 1;
        true
    }

    /// Looks up a captured parameter by name.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries[..self.len]
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    /// Iterates over all captured `(name, value)` pairs.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries[..self.len].iter().map(|(n, v)| (*n, *v))
    }

    /// Number of captured parameters.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no parameters were captured.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
enum Pattern {
    /// No `:` segments; compared with a plain byte-slice equality.
    Static(String),
    /// At least one `:param` segment; compared segment-by-segment.
    Segmented(Vec<Segment>),
}

impl Pattern {
    fn compile(path: &str) -> Self {
        if !path.contains(':') {
            return Pattern::Static(path.to_string());
        }

        let segments = path
            .split('/')
            .map(|seg| match seg.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(seg.to_string()),
            })
            .collect();

        Pattern::Segmented(segments)
    }

    fn matches<'a>(&'a self, path: &'a str) -> Option<RouteParams<'a>> {
        match self {
            Pattern::Static(pattern) => (pattern == path).then(RouteParams::default),
            Pattern::Segmented(segments) => {
                let mut params = RouteParams::default();
                let mut request_segments = path.split('/');

                for segment in segments {
                    let piece = request_segments.next()?;
                    match segment {
                        Segment::Literal(lit) => {
                            if lit != piece {
                                return None;
                            }
                        }
                        Segment::Param(name) => {
                            if piece.is_empty() {
                                return None;
                            }
                            if !params.push(name.as_str(), piece) {
                                return None;
                            }
                        }
                    }
                }

                (request_segments.next().is_none()).then_some(params)
            }
        }
    }

    fn is_static(&self) -> bool {
        matches!(self, Pattern::Static(_))
    }
}

struct Entry<T> {
    method: Option<Method>,
    pattern: Pattern,
    value: T,
}

struct HotEntry<T> {
    method: Option<Method>,
    path: String,
    value: T,
}

/// A fingerprint-addressed router mapping `(method, path)` to a registered
/// value of type `T`.
///
/// Registration inserts static routes into a hash bucket keyed by
/// `fnv1a(path)` (method plays no part in the bucket address — it's filtered
/// for during the scan via [`method_matches`], exactly like the hot table);
/// the first [`HOT_TABLE_CAPACITY`] of them are additionally copied into a
/// flat hot table scanned linearly before falling back to the bucket.
/// Parameterized routes (containing a `:name` segment) can't be addressed by
/// the hash of their own pattern — the request path that must find them at
/// lookup time hashes to something else entirely — so they live in their own
/// list, scanned linearly after the static-path hash bucket comes up empty.
pub struct Router<T> {
    hot: Vec<HotEntry<T>>,
    buckets: Vec<Vec<Entry<T>>>,
    params: Vec<Entry<T>>,
    fallback: Option<T>,
}

impl<T: Clone> Router<T> {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            hot: Vec::with_capacity(HOT_TABLE_CAPACITY),
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            params: Vec::new(),
            fallback: None,
        }
    }

    /// Registers `value` for `method` at `path` (e.g. `/users/:id`).
    ///
    /// `method = None` registers an `ANY`-method route, matched only when no
    /// method-qualified route occupies the same slot. Last registration wins
    /// on an exact `(method, path)` duplicate.
    pub fn insert(&mut self, method: Option<Method>, path: &str, value: T) {
        let pattern = Pattern::compile(path);

        if !pattern.is_static() {
            self.params.push(Entry {
                method,
                pattern,
                value,
            });
            return;
        }

        match self.hot.iter_mut().find(|e| e.method == method && e.path == path) {
            Some(existing) => existing.value = value.clone(),
            None if self.hot.len() < HOT_TABLE_CAPACITY => self.hot.push(HotEntry {
                method,
                path: path.to_string(),
                value: value.clone(),
            }),
            None => {}
        }

        let bucket = &mut self.buckets[fnv1a(path.as_bytes()) as usize % BUCKET_COUNT];
        bucket.push(Entry {
            method,
            pattern,
            value,
        });
    }

    /// Registers the fallback value returned by [`Self::find`] when no route
    /// matches (the `/*` sugar from the router's spec).
    pub fn fallback(&mut self, value: T) {
        self.fallback = Some(value);
    }

    /// Looks up the route matching `method` and `path`.
    ///
    /// Static exact matches beat parameterized matches; within each class, a
    /// method-qualified route beats an `ANY` route in the same slot.
    pub fn find<'a>(&'a self, method: Method, path: &'a str) -> Option<RouteMatch<'a, T>> {
        let mut hot_any: Option<&HotEntry<T>> = None;
        for entry in &self.hot {
            if entry.path != path || !method_matches(entry.method, method) {
                continue;
            }
            if entry.method.is_some() {
                // A method-qualified hot entry is unique per (method, path) after
                // `insert`'s dedup, so it's an immediate, unambiguous match.
                return Some(RouteMatch {
                    value: entry.value.clone(),
                    params: RouteParams::default(),
                });
            }
            hot_any = Some(entry);
        }
        if let Some(entry) = hot_any {
            return Some(RouteMatch {
                value: entry.value.clone(),
                params: RouteParams::default(),
            });
        }

        let bucket = &self.buckets[fnv1a(path.as_bytes()) as usize % BUCKET_COUNT];
        if let Some(found) = best_match(bucket.iter(), method, path) {
            return Some(found);
        }

        if let Some(found) = best_match(self.params.iter(), method, path) {
            return Some(found);
        }

        self.fallback.clone().map(|value| RouteMatch {
            value,
            params: RouteParams::default(),
        })
    }
}

/// Scans `entries` (either a static-path hash bucket or the parameterized
/// route list — never a mix of both, so static-beats-parameterized falls out
/// of trying the bucket before the param list rather than needing to be
/// judged here) for the best match: a method-qualified route beats an `ANY`
/// route, and among entries tied on that, the later registration wins
/// (registrations are scanned in insertion order).
fn best_match<'a, T: Clone>(
    entries: impl Iterator<Item = &'a Entry<T>>,
    method: Method,
    path: &'a str,
) -> Option<RouteMatch<'a, T>> {
    let mut best: Option<RouteMatch<'a, T>> = None;
    let mut best_qualified = false;

    for entry in entries {
        if !method_matches(entry.method, method) {
            continue;
        }
        let Some(params) = entry.pattern.matches(path) else {
            continue;
        };

        let is_qualified = entry.method.is_some();

        let better = match best {
            None => true,
            Some(_) if is_qualified != best_qualified => is_qualified,
            Some(_) => true,
        };

        if better {
            best_qualified = is_qualified;
            best = Some(RouteMatch {
                value: entry.value.clone(),
                params,
            });
        }
    }

    best
}

impl<T: Clone> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn method_matches(route_method: Option<Method>, request_method: Method) -> bool {
    match route_method {
        Some(m) => m == request_method,
        None => true,
    }
}

/// FNV-1a 64-bit hash, hand-rolled (no dependency pulls in a hasher just for
/// short, ASCII path strings).
#[inline]
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::Method;

    #[test]
    fn static_route_hits_hot_table() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(Some(Method::Get), "/users", "list_users");

        let found = router.find(Method::Get, "/users").unwrap();
        assert_eq!(found.value, "list_users");
        assert!(found.params.is_empty());
    }

    #[test]
    fn wrong_method_misses() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(Some(Method::Get), "/users", "list_users");

        assert!(router.find(Method::Post, "/users").is_none());
    }

    #[test]
    fn any_method_matches_when_no_qualified_route() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(None, "/health", "health_check");

        assert_eq!(router.find(Method::Get, "/health").unwrap().value, "health_check");
        assert_eq!(router.find(Method::Post, "/health").unwrap().value, "health_check");
    }

    #[test]
    fn qualified_method_beats_any_in_same_slot() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(None, "/thing", "any_handler");
        router.insert(Some(Method::Get), "/thing", "get_handler");

        assert_eq!(router.find(Method::Get, "/thing").unwrap().value, "get_handler");
        assert_eq!(router.find(Method::Post, "/thing").unwrap().value, "any_handler");
    }

    #[test]
    fn param_capture() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(Some(Method::Get), "/users/:id", "get_user");

        let found = router.find(Method::Get, "/users/42").unwrap();
        assert_eq!(found.value, "get_user");
        assert_eq!(found.params.get("id"), Some("42"));
    }

    #[test]
    fn multiple_params() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(Some(Method::Get), "/users/:id/posts/:post_id", "get_post");

        let found = router.find(Method::Get, "/users/7/posts/99").unwrap();
        assert_eq!(found.params.get("id"), Some("7"));
        assert_eq!(found.params.get("post_id"), Some("99"));
    }

    #[test]
    fn static_beats_parameterized() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(Some(Method::Get), "/users/:id", "get_user");
        router.insert(Some(Method::Get), "/users/me", "get_self");

        assert_eq!(router.find(Method::Get, "/users/me").unwrap().value, "get_self");
        assert_eq!(router.find(Method::Get, "/users/123").unwrap().value, "get_user");
    }

    #[test]
    fn param_segment_count_must_match() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(Some(Method::Get), "/users/:id", "get_user");

        assert!(router.find(Method::Get, "/users").is_none());
        assert!(router.find(Method::Get, "/users/1/extra").is_none());
    }

    #[test]
    fn fallback_used_on_miss() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(Some(Method::Get), "/users", "list_users");
        router.fallback("not_found");

        assert_eq!(router.find(Method::Get, "/nope").unwrap().value, "not_found");
    }

    #[test]
    fn last_registration_wins_on_exact_duplicate() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(Some(Method::Get), "/thing", "first");
        router.insert(Some(Method::Get), "/thing", "second");

        assert_eq!(router.find(Method::Get, "/thing").unwrap().value, "second");
    }

    #[test]
    fn more_than_hot_table_capacity_still_resolves() {
        let mut router: Router<usize> = Router::new();
        for i in 0..40 {
            router.insert(Some(Method::Get), &format!("/route{i}"), i);
        }

        for i in 0..40 {
            assert_eq!(router.find(Method::Get, &format!("/route{i}")).unwrap().value, i);
        }
    }

    #[test]
    fn any_method_route_past_hot_table_capacity_still_resolves() {
        let mut router: Router<usize> = Router::new();
        for i in 0..16 {
            router.insert(Some(Method::Get), &format!("/route{i}"), i);
        }
        router.insert(None, "/overflow-any", 999);

        assert_eq!(router.find(Method::Get, "/overflow-any").unwrap().value, 999);
        assert_eq!(router.find(Method::Post, "/overflow-any").unwrap().value, 999);
    }

    #[test]
    fn any_method_parameterized_route_resolves() {
        let mut router: Router<&'static str> = Router::new();
        router.insert(None, "/items/:id", "any_item");

        let found = router.find(Method::Delete, "/items/7").unwrap();
        assert_eq!(found.value, "any_item");
        assert_eq!(found.params.get("id"), Some("7"));
    }
}
