//! Bounded in-memory LRU cache and static-file responder.
//!
//! [`Cache`] resolves a request path against a served directory, guards
//! against path traversal, and answers with conditional-GET-aware `200`/`304`
//! responses out of a least-recently-used file cache. Entries above
//! [`CacheLimits::sendfile_threshold`] are read straight off disk into the
//! response buffer rather than held in the LRU (large files churn the cache
//! without meaningfully speeding up repeat hits).

mod mime;
mod rfc1123;

use crate::http::request::Request;
use crate::http::response::{Handled, Response};
use crate::http::types::{Method, StatusCode};
use crate::limits::CacheLimits;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Instant, SystemTime};

struct Entry {
    body: Vec<u8>,
    mime: &'static str,
    etag: String,
    last_modified: String,
    cached_at: Instant,
    prev: Option<PathBuf>,
    next: Option<PathBuf>,
}

/// A bounded LRU cache of served files, backing [`crate::ServerBuilder::serve_static`].
pub struct Cache {
    root: PathBuf,
    limits: CacheLimits,
    inner: RefCell<Inner>,
}

struct Inner {
    entries: HashMap<PathBuf, Entry>,
    total_bytes: usize,
    head: Option<PathBuf>,
    tail: Option<PathBuf>,
}

impl Inner {
    fn detach(&mut self, key: &Path) {
        let (prev, next) = match self.entries.get(key) {
            Some(e) => (e.prev.clone(), e.next.clone()),
            None => return,
        };

        match &prev {
            Some(p) => self.entries.get_mut(p).unwrap().next = next.clone(),
            None => self.head = next.clone(),
        }
        match &next {
            Some(n) => self.entries.get_mut(n).unwrap().prev = prev.clone(),
            None => self.tail = prev.clone(),
        }
    }

    fn push_front(&mut self, key: PathBuf) {
        let old_head = self.head.take();
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.prev = None;
            entry.next = old_head.clone();
        }
        if let Some(old_head) = &old_head {
            self.entries.get_mut(old_head).unwrap().prev = Some(key.clone());
        }
        self.head = Some(key.clone());
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    fn touch(&mut self, key: &Path) {
        if self.head.as_deref() == Some(key) {
            return;
        }
        self.detach(key);
        self.push_front(key.to_path_buf());
    }

    fn insert(&mut self, key: PathBuf, entry: Entry, max_bytes: usize, max_entries: usize) {
        if self.entries.contains_key(&key) {
            self.detach(&key);
            if let Some(old) = self.entries.remove(&key) {
                self.total_bytes -= old.body.len();
            }
        }

        self.total_bytes += entry.body.len();
        self.entries.insert(key.clone(), entry);
        self.push_front(key);

        while (self.total_bytes > max_bytes || self.entries.len() > max_entries)
            && self.entries.len() > 1
        {
            let Some(lru) = self.tail.clone() else { break };
            self.detach(&lru);
            if let Some(evicted) = self.entries.remove(&lru) {
                self.total_bytes -= evicted.body.len();
            }
        }
    }
}

/// Outcome of resolving a request against the served directory.
enum Resolved {
    /// Path escaped the root, was absolute, or otherwise unsafe; fall through
    /// to the user's handler untouched.
    Unsafe,
    /// No file at that path; fall through.
    Miss,
    /// A real file under the root.
    File(PathBuf),
}

impl Cache {
    /// Creates a cache serving files rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, limits: CacheLimits) -> Self {
        Self {
            root: root.into(),
            limits,
            inner: RefCell::new(Inner {
                entries: HashMap::new(),
                total_bytes: 0,
                head: None,
                tail: None,
            }),
        }
    }

    /// Attempts to answer `request` from the static file tree.
    ///
    /// Returns `Some(Handled)` when the request was fully answered (a `200`
    /// body, a `304`, or a `403`/`404` for an unsafe/missing path under a
    /// configured static root); `None` means the caller should fall through
    /// to its own [`crate::Handler`].
    pub fn respond(&self, request: &Request, response: &mut Response) -> Option<Handled> {
        if !matches!(request.method(), Method::Get | Method::Head) {
            return None;
        }

        match self.resolve(request.url().path()) {
            Resolved::Unsafe => {
                Some(response.status(StatusCode::Forbidden).body("forbidden"))
            }
            Resolved::Miss => None,
            Resolved::File(path) => self.serve_file(&path, request, response),
        }
    }

    /// Joins `raw_path` onto `root`, rejecting absolute paths, `..`
    /// segments, and any resolution that would otherwise escape `root` —
    /// the safety check shared by file and directory resolution alike. An
    /// empty path joins to `root` itself (callers that want the `index.html`
    /// default for a bare `/` request apply that before calling this).
    fn safe_join(&self, raw_path: &[u8]) -> Option<PathBuf> {
        let path_str = std::str::from_utf8(raw_path).ok()?;
        let relative = path_str.trim_start_matches('/');

        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }

        if !resolved.starts_with(&self.root) {
            return None;
        }
        Some(resolved)
    }

    fn resolve(&self, raw_path: &[u8]) -> Resolved {
        let raw_path: &[u8] = if raw_path.iter().all(|&b| b == b'/') {
            b"index.html"
        } else {
            raw_path
        };
        let Some(resolved) = self.safe_join(raw_path) else {
            return Resolved::Unsafe;
        };

        match fs::metadata(&resolved) {
            Ok(meta) if meta.is_file() => Resolved::File(resolved),
            _ => Resolved::Miss,
        }
    }

    fn serve_file(
        &self,
        path: &Path,
        request: &Request,
        response: &mut Response,
    ) -> Option<Handled> {
        let meta = fs::metadata(path).ok()?;
        let size = meta.len() as usize;
        let modified = meta.modified().ok()?;
        let etag = format!("\"{}-{}\"", system_time_tag(modified), size);
        let last_modified = rfc1123::format(modified);

        if conditional_hit(request, &etag, modified) {
            return Some(
                response
                    .status(StatusCode::NotModified)
                    .header("etag", etag.clone())
                    .header("last-modified", last_modified.clone())
                    .body(""),
            );
        }

        let mime = mime::guess(path);

        if size > self.limits.sendfile_threshold {
            let body = fs::read(path).ok()?;
            return Some(
                response
                    .status(StatusCode::Ok)
                    .header("content-type", mime)
                    .header("etag", etag)
                    .header("last-modified", last_modified)
                    .body(body),
            );
        }

        let mut inner = self.inner.borrow_mut();

        if let Some(entry) = inner.entries.get(path) {
            if entry.etag == etag && entry.cached_at.elapsed() < self.limits.ttl {
                inner.touch(path);
                let entry = inner.entries.get(path).unwrap();
                return Some(
                    response
                        .status(StatusCode::Ok)
                        .header("content-type", entry.mime)
                        .header("etag", entry.etag.clone())
                        .header("last-modified", entry.last_modified.clone())
                        .body(entry.body.clone()),
                );
            }
        }

        let body = fs::read(path).ok()?;
        let entry = Entry {
            body: body.clone(),
            mime,
            etag: etag.clone(),
            last_modified: last_modified.clone(),
            cached_at: Instant::now(),
            prev: None,
            next: None,
        };
        inner.insert(
            path.to_path_buf(),
            entry,
            self.limits.max_bytes,
            self.limits.max_entries,
        );

        Some(
            response
                .status(StatusCode::Ok)
                .header("content-type", mime)
                .header("etag", etag)
                .header("last-modified", last_modified)
                .body(body),
        )
    }

    /// Invalidates all cached entries, e.g. after the served tree changes on
    /// disk underneath a long-running server.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.entries.clear();
        inner.total_bytes = 0;
        inner.head = None;
        inner.tail = None;
    }

    /// Reads `path` and inserts it into the LRU ahead of its first request,
    /// the same population the miss path of [`Cache::serve_file`] performs.
    /// Files above [`CacheLimits::sendfile_threshold`] are deliberately
    /// skipped — they never enter the cache on a real request either.
    fn warm(&self, path: &Path) -> bool {
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        let size = meta.len() as usize;
        if !meta.is_file() || size > self.limits.sendfile_threshold {
            return false;
        }
        let Ok(modified) = meta.modified() else {
            return false;
        };
        let Ok(body) = fs::read(path) else {
            return false;
        };

        let entry = Entry {
            body,
            mime: mime::guess(path),
            etag: format!("\"{}-{}\"", system_time_tag(modified), size),
            last_modified: rfc1123::format(modified),
            cached_at: Instant::now(),
            prev: None,
            next: None,
        };
        self.inner.borrow_mut().insert(
            path.to_path_buf(),
            entry,
            self.limits.max_bytes,
            self.limits.max_entries,
        );
        true
    }

    /// Eagerly loads the file a request for `request_path` would resolve to,
    /// so the first real request is already a cache hit. Returns `false` if
    /// the path is unsafe, missing, a directory, or too large to cache.
    pub fn prewarm(&self, request_path: &str) -> bool {
        match self.safe_join(request_path.as_bytes()) {
            Some(path) => self.warm(&path),
            None => false,
        }
    }

    /// Eagerly loads up to `max_files` files directly inside the directory
    /// `request_path` resolves to (non-recursive — a directory tree is a
    /// sequence of individual `prewarm` calls by design, so a caller can cap
    /// total work across many directories from the outside). Returns the
    /// number of files actually warmed.
    pub fn prewarm_directory(&self, request_path: &str, max_files: usize) -> usize {
        let Some(dir) = self.safe_join(request_path.as_bytes()) else {
            return 0;
        };
        let Ok(entries) = fs::read_dir(&dir) else {
            return 0;
        };

        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .take(max_files)
            .filter(|path| self.warm(path))
            .count()
    }
}

#[inline]
fn conditional_hit(request: &Request, etag: &str, modified: SystemTime) -> bool {
    if let Some(if_none_match) = request.header(b"if-none-match") {
        if if_none_match == etag.as_bytes() || if_none_match == b"*" {
            return true;
        }
    }
    if let Some(if_modified_since) = request.header(b"if-modified-since") {
        if let Ok(since) = std::str::from_utf8(if_modified_since) {
            if let Some(since) = rfc1123::parse(since) {
                return system_time_tag(since) >= system_time_tag(modified);
            }
        }
    }
    false
}

#[inline]
fn system_time_tag(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::CacheLimits;

    fn tmp_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("reactorweb_cache_test_{name}_{:p}", &name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tmp_dir("traversal");
        let cache = Cache::new(dir.clone(), CacheLimits::default());

        match cache.resolve(b"/../../../etc/passwd") {
            Resolved::Unsafe => {}
            _ => panic!("expected traversal to be rejected"),
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn serves_existing_file() {
        let dir = tmp_dir("serve");
        fs::write(dir.join("hello.txt"), b"hi there").unwrap();
        let cache = Cache::new(dir.clone(), CacheLimits::default());

        match cache.resolve(b"/hello.txt") {
            Resolved::File(p) => assert!(p.ends_with("hello.txt")),
            _ => panic!("expected a hit"),
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_a_miss() {
        let dir = tmp_dir("miss");
        let cache = Cache::new(dir.clone(), CacheLimits::default());
        match cache.resolve(b"/nope.txt") {
            Resolved::Miss => {}
            _ => panic!("expected a miss"),
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn prewarm_populates_the_lru_before_any_request() {
        let dir = tmp_dir("prewarm");
        fs::write(dir.join("hello.txt"), b"hi there").unwrap();
        let cache = Cache::new(dir.clone(), CacheLimits::default());

        assert!(cache.prewarm("/hello.txt"));
        assert_eq!(cache.inner.borrow().entries.len(), 1);
        assert!(!cache.prewarm("/missing.txt"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn prewarm_directory_loads_up_to_max_files() {
        let dir = tmp_dir("prewarm_dir");
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(dir.join(name), b"contents").unwrap();
        }
        let cache = Cache::new(dir.clone(), CacheLimits::default());

        let warmed = cache.prewarm_directory("/", 2);
        assert_eq!(warmed, 2);
        assert_eq!(cache.inner.borrow().entries.len(), 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn prewarm_rejects_traversal_outside_root() {
        let dir = tmp_dir("prewarm_traversal");
        let cache = Cache::new(dir.clone(), CacheLimits::default());
        assert!(!cache.prewarm("/../../../etc/passwd"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn conditional_hit_on_exact_etag_match() {
        use crate::server::connection::HttpConnection;
        let mut conn = HttpConnection::from_req("GET / HTTP/1.1\r\nif-none-match: \"abc\"\r\n\r\n");
        conn.parse().unwrap();
        assert!(conditional_hit(&conn.request, "\"abc\"", SystemTime::now()));
    }

    #[test]
    fn conditional_hit_on_if_modified_since_at_or_after_mtime() {
        use crate::server::connection::HttpConnection;
        let modified = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(784_111_777);

        let mut conn = HttpConnection::from_req(
            "GET / HTTP/1.1\r\nif-modified-since: Sun, 06 Nov 1994 08:49:37 GMT\r\n\r\n",
        );
        conn.parse().unwrap();
        assert!(conditional_hit(&conn.request, "\"x\"", modified));

        let mut conn = HttpConnection::from_req(
            "GET / HTTP/1.1\r\nif-modified-since: Mon, 07 Nov 1994 08:49:37 GMT\r\n\r\n",
        );
        conn.parse().unwrap();
        assert!(conditional_hit(&conn.request, "\"x\"", modified));
    }

    #[test]
    fn conditional_miss_when_if_modified_since_predates_mtime() {
        use crate::server::connection::HttpConnection;
        let modified = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(784_111_777);

        let mut conn = HttpConnection::from_req(
            "GET / HTTP/1.1\r\nif-modified-since: Sat, 05 Nov 1994 08:49:37 GMT\r\n\r\n",
        );
        conn.parse().unwrap();
        assert!(!conditional_hit(&conn.request, "\"x\"", modified));
    }
}
