use crate::{
    cache::Cache,
    errors::ErrorKind,
    http::{
        request::Request,
        response::{Handled, Response},
    },
    limits::{
        CacheLimits, ConnLimits, Http09Limits, RateLimiterLimits, ReqLimits, RespLimits,
        ServerLimits, WsLimits,
    },
    rate_limiter::RateLimiter,
    router::{RouteId, RouteMatch, Router},
    server::connection::{ConnectionData, HttpConnection},
    websocket::{auth::TokenValidator, WsAuthPolicy, WsConnection},
    ConnectionFilter, Version,
};
use std::{
    cell::Cell,
    future::Future,
    marker::PhantomData,
    path::PathBuf,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::Instrument;

/// Monotonically increasing id handed to each accepted connection, carried
/// in its `tracing` span for the life of the socket.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A trait for handling HTTP requests and generating responses.
///
/// You can use:
/// - `&self` for shared immutable data (e.g. router configuration, a cache handle)
/// - `&mut S` for connection-specific mutable state (e.g. authentication tokens, session data)
///
/// # Examples
///
/// Basic Request Handler
/// ```
/// use reactorweb::{Handler, Request, Response, Handled, RouteMatch, StatusCode, router::RouteId};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(
///         &self,
///         _: &mut (),
///         _route: Option<&RouteMatch<'_, RouteId>>,
///         req: &Request,
///         resp: &mut Response,
///     ) -> Handled {
///         // Simple echo handler, routing by hand (no `Router` configured)
///         if req.url().target() == b"/echo" {
///             resp.status(StatusCode::Ok).body("Echo response")
///         } else {
///             resp.status(StatusCode::NotFound).body("Not found :(")
///         }
///     }
/// }
/// ```
/// Handler with [`ConnectionData`] and a configured [`crate::router::Router`]
/// ```
/// use reactorweb::{Handler, ConnectionData, Request, Response, Handled, RouteMatch, StatusCode, router::RouteId};
///
/// struct CountingHandler;
///
/// impl Handler<State> for CountingHandler {
///     async fn handle(
///         &self,
///         data: &mut State,
///         route: Option<&RouteMatch<'_, RouteId>>,
///         _req: &Request,
///         resp: &mut Response,
///     ) -> Handled {
///         data.request_count += 1;
///
///         match route.map(|r| r.value) {
///             Some(0) => resp.status(StatusCode::Ok)
///                 .body(format!("Request #{}", data.request_count)),
///             _ => resp.status(StatusCode::NotFound).body("Not found"),
///         }
///     }
/// }
///
/// struct State {
///     request_count: usize,
/// }
///
/// impl ConnectionData for State {
///     fn new() -> Self {
///         Self { request_count: 0 }
///     }
///
///     fn reset(&mut self) {
///         self.request_count = 0;
///     }
/// }
/// ```
///
/// # Single-threaded handlers
///
/// The server drives every connection from one OS thread (see the crate's
/// single-threaded reactor design), so `Handler` is not required to be
/// `Send`/`Sync`: it is perfectly fine to close over an `Rc<RefCell<..>>` or
/// a hand-rolled [`crate::router::Router`].
pub trait Handler<S = ()>
where
    Self: 'static,
    S: ConnectionData,
{
    /// Processes an HTTP request and generates a response.
    ///
    /// When a [`Router`] is attached to the server (via
    /// [`ServerBuilder::router`]) and the request's `(method, path)` matched
    /// a registered route, `route` carries that route's value (typically a
    /// small `RouteId`) and any captured `:param` segments. A route miss with
    /// no fallback registered never reaches `handle` at all — the connection
    /// answers with a `404` directly. When no `Router` is attached, `route`
    /// is always `None` and the handler is expected to dispatch on the
    /// request's URL itself, exactly as before routing existed.
    ///
    /// # Parameters
    ///
    /// - `connection_data`: Mutable reference to connection-specific state
    /// - `route`: The matched route, if a [`Router`] is configured and matched
    /// - `req`: Immutable reference to the parsed HTTP request
    /// - `resp`: Mutable response builder for constructing the response
    ///
    /// # Returns
    ///
    /// `Handled` indicating whether the request was fully processed or
    /// requires further handling by other middleware.
    ///
    /// # Errors
    ///
    /// Implementations should handle errors internally and set appropriate
    /// HTTP status codes on the response. Panics will terminate the connection.
    fn handle(
        &self,
        connection_data: &mut S,
        route: Option<&RouteMatch<'_, RouteId>>,
        request: &Request,
        response: &mut Response,
    ) -> impl Future<Output = Handled>;

    /// Runs once `handle` has answered a request with
    /// [`Response::websocket_upgrade`] and the `101` response has been
    /// flushed to the client.
    ///
    /// Given the now-upgraded connection, drive it with
    /// [`WsConnection::recv`]/`send_text`/`send_binary`/`close`. The
    /// connection closes (and the next keep-alive request loop, if any,
    /// never runs) once this future returns.
    ///
    /// The default implementation closes immediately with a normal close
    /// frame; override it to implement an actual WebSocket protocol.
    #[allow(unused_variables)]
    fn on_websocket(
        &self,
        connection_data: &mut S,
        request: &Request,
        ws: &mut WsConnection<'_, TcpStream>,
    ) -> impl Future<Output = ()> {
        async move {
            let _ = ws
                .close(crate::websocket::frame::CloseCode::Normal, "")
                .await;
        }
    }
}

/// An HTTP server that drives every accepted connection from a single
/// cooperative event loop.
///
/// Unlike a pre-spawned worker pool, there is no fixed set of tasks pulling
/// from a shared queue: each accepted socket becomes exactly one
/// [`tokio::task::spawn_local`] task for the lifetime of that connection.
/// Admission control happens once, at accept time (see [`ServerLimits`]).
///
/// # Examples
///
/// ```no_run
/// use reactorweb::{Server, Handler, Request, Response, Handled, RouteMatch, StatusCode, router::RouteId};
/// use tokio::{net::TcpListener, task::LocalSet};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(
///         &self, _: &mut (), _: Option<&RouteMatch<'_, RouteId>>, _: &Request, resp: &mut Response,
///     ) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     LocalSet::new()
///         .run_until(async {
///             Server::builder()
///                 .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///                 .handler(MyHandler)
///                 .build()
///                 .launch()
///                 .await
///         })
///         .await
/// }
/// ```
pub struct Server<H, S = (), F = ()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listener: TcpListener,
    handler: Rc<H>,
    connection_filter: Rc<F>,
    active_connections: Rc<Cell<usize>>,

    server_limits: ServerLimits,
    limits: AllLimits,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    _marker: PhantomData<S>,
}

/// A cloneable handle that requests an orderly stop of a running [`Server`].
///
/// Obtained from [`Server::handle`] before calling [`Server::launch`] (the
/// server is otherwise consumed by `launch`, so the handle must be taken
/// first). Calling [`Self::stop`] makes the next iteration of the accept
/// loop exit instead of calling `accept()` again; connections already being
/// served run to completion and are not interrupted.
#[derive(Clone)]
pub struct ServerHandle {
    stop_tx: watch::Sender<bool>,
}

impl ServerHandle {
    /// Signals the accept loop to stop after its current iteration.
    ///
    /// A no-op if the server has already stopped or been dropped.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl<H, S, F> Server<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder<H, S, ()>
    where
        H: Handler<S>,
        S: ConnectionData,
    {
        ServerBuilder {
            listener: None,
            handler: None,
            connection_filter: Rc::new(()),
            _marker: PhantomData,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
            http_09_limits: None,
            rate_limiter_limits: None,
            cache_limits: None,
            ws_limits: None,
            static_root: None,
            router: None,
            ws_auth: None,
            prewarm: Vec::new(),
        }
    }

    /// Returns a handle that can later call [`ServerHandle::stop`] to end
    /// [`Self::launch`]'s accept loop from elsewhere (another task, a signal
    /// handler, a test harness).
    #[inline]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Starts the server and begins accepting incoming connections.
    ///
    /// Must be run from inside a [`tokio::task::LocalSet`] — every accepted
    /// connection is spawned with [`tokio::task::spawn_local`], which panics
    /// outside of one.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # reactorweb::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use reactorweb::Server;
    /// use tokio::{net::TcpListener, task::LocalSet};
    ///
    /// LocalSet::new().run_until(async {
    ///     Server::builder()
    ///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///         .handler(MyStruct) // structure with Handler implementation
    ///         .build()
    ///         .launch()
    ///         .await
    /// }).await
    /// # }
    /// ```
    #[inline]
    pub async fn launch(mut self) {
        loop {
            let (mut stream, client_addr) = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    tracing::info!("stop signal received, accept loop exiting");
                    return;
                }
                accepted = self.listener.accept() => {
                    let Ok(pair) = accepted else { continue; };
                    pair
                }
            };

            // Admission: over capacity, the socket is accepted and then
            // immediately closed (optionally after a 503) rather than queued,
            // so the kernel's accept backlog never misleads waiting clients.
            if self.active_connections.get() >= self.server_limits.max_connections {
                tracing::warn!(
                    peer = %client_addr,
                    active = self.active_connections.get(),
                    "rejecting connection, at capacity"
                );
                if self.server_limits.send_503_on_overflow {
                    let _ = ConnLimits::default()
                        .send_error(
                            &mut stream,
                            ErrorKind::ServiceUnavailable,
                            Version::Http11,
                            self.server_limits.json_errors,
                        )
                        .await;
                }
                continue;
            }

            let Ok(server_addr) = stream.local_addr() else {
                continue;
            };

            let handler = self.handler.clone();
            let filter = self.connection_filter.clone();
            let active_connections = self.active_connections.clone();
            let limits = self.limits.clone();
            let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

            active_connections.set(active_connections.get() + 1);
            tracing::debug!(conn_id, peer = %client_addr, "accepted connection");

            let span = tracing::info_span!("connection", conn_id, peer = %client_addr);
            tokio::task::spawn_local(
                async move {
                    let mut conn = HttpConnection::new(handler, limits, conn_id);

                    let filtered = filter
                        .filter(client_addr, server_addr, &mut conn.response)
                        .is_ok()
                        && filter
                            .filter_async(client_addr, server_addr, &mut conn.response)
                            .await
                            .is_ok();

                    if filtered {
                        let _ = conn.run(&mut stream, client_addr).await;
                    } else {
                        tracing::warn!(conn_id, "connection filter rejected peer");
                        let _ = conn
                            .conn_limits
                            .write_bytes(&mut stream, conn.response.buffer())
                            .await;
                    }

                    active_connections.set(active_connections.get() - 1);
                }
                .instrument(span),
            );
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// # Protocol Support
///
/// - `HTTP/1.X` (HTTP/1.1 or HTTP/1.1): Always enabled
/// - [`HTTP/0.9+`](crate::limits::Http09Limits): Optional,
///   enabled by setting [`http_09_limits`](Self::http_09_limits)
pub struct ServerBuilder<H, S = (), F = ()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listener: Option<TcpListener>,
    handler: Option<Rc<H>>,
    connection_filter: Rc<F>,
    _marker: PhantomData<S>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
    http_09_limits: Option<Http09Limits>,
    rate_limiter_limits: Option<RateLimiterLimits>,
    cache_limits: Option<CacheLimits>,
    ws_limits: Option<WsLimits>,
    static_root: Option<PathBuf>,
    router: Option<Router<RouteId>>,
    ws_auth: Option<WsAuthPolicy<Box<dyn TokenValidator>>>,
    prewarm: Vec<PrewarmTask>,
}

/// A cache-warming request queued by [`ServerBuilder::prewarm_static`] /
/// [`ServerBuilder::prewarm_static_directory`], applied once
/// [`ServerBuilder::build`] has constructed the [`Cache`].
enum PrewarmTask {
    File(String),
    Directory(String, usize),
}

impl<H, S, F> ServerBuilder<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler that will process incoming requests.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Rc::new(handler));
        self
    }

    /// Installs a connection filter to check incoming TCP connections
    /// before using it.
    ///
    /// Allows early rejection of unwanted IP addresses (before the
    /// first read). Can be used for DDoS protection, geobanning, etc.
    ///
    /// For more information, see [ConnectionFilter](crate::ConnectionFilter)
    #[inline(always)]
    pub fn conn_filter<NewF>(self, filter: NewF) -> ServerBuilder<H, S, NewF>
    where
        NewF: ConnectionFilter,
    {
        ServerBuilder {
            listener: self.listener,
            handler: self.handler,
            connection_filter: Rc::new(filter),
            _marker: self._marker,
            server_limits: self.server_limits,
            request_limits: self.request_limits,
            response_limits: self.response_limits,
            connection_limits: self.connection_limits,
            http_09_limits: self.http_09_limits,
            rate_limiter_limits: self.rate_limiter_limits,
            cache_limits: self.cache_limits,
            ws_limits: self.ws_limits,
            static_root: self.static_root,
            router: self.router,
            ws_auth: self.ws_auth,
            prewarm: self.prewarm,
        }
    }

    /// Configures server-level admission and overload limits.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures per-connection timeouts and quotas.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Enables and configures [`HTTP/0.9+`](crate::limits::Http09Limits) protocol support.
    ///
    /// # Note
    ///
    /// Omitting this call will completely disable HTTP/0.9+ support. The server
    /// will reject any HTTP/0.9+ requests, returning an error to the client.
    #[inline(always)]
    pub fn http_09_limits(mut self, limits: Http09Limits) -> Self {
        self.http_09_limits = Some(limits);
        self
    }

    /// Configures request parsing and processing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response processing limits.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Enables the per-IP fixed-window rate limiter with the given limits.
    ///
    /// Omitting this call disables rate limiting entirely.
    #[inline(always)]
    pub fn rate_limiter(mut self, limits: RateLimiterLimits) -> Self {
        self.rate_limiter_limits = Some(limits);
        self
    }

    /// Configures the bounded LRU file cache used by the static responder.
    ///
    /// Has no effect unless [`Self::serve_static`] is also called.
    #[inline(always)]
    pub fn cache_limits(mut self, limits: CacheLimits) -> Self {
        self.cache_limits = Some(limits);
        self
    }

    /// Configures WebSocket framing limits.
    #[inline(always)]
    pub fn ws_limits(mut self, limits: WsLimits) -> Self {
        self.ws_limits = Some(limits);
        self
    }

    /// Enables the built-in static file responder, rooted at `dir`.
    ///
    /// Requests are resolved against `dir` before the handler runs; a hit
    /// (including a conditional `304`) is answered directly and the handler
    /// is not invoked. A miss (not found, unsafe path, not a regular file)
    /// falls through to the handler unchanged.
    #[inline(always)]
    pub fn serve_static(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_root = Some(dir.into());
        self
    }

    /// Eagerly loads `request_path` into the static cache at [`Self::build`]
    /// time, so the first real request for it is already a hit. No-op if
    /// [`Self::serve_static`] wasn't also called, or if the path doesn't
    /// resolve to a cacheable file.
    #[inline(always)]
    pub fn prewarm_static(mut self, request_path: impl Into<String>) -> Self {
        self.prewarm.push(PrewarmTask::File(request_path.into()));
        self
    }

    /// Eagerly loads up to `max_files` files directly inside the directory
    /// `request_path` resolves to (non-recursive), at [`Self::build`] time.
    #[inline(always)]
    pub fn prewarm_static_directory(
        mut self,
        request_path: impl Into<String>,
        max_files: usize,
    ) -> Self {
        self.prewarm
            .push(PrewarmTask::Directory(request_path.into(), max_files));
        self
    }

    /// Attaches a [`Router`] to resolve each request's `(method, path)` to a
    /// [`RouteId`] before the handler runs.
    ///
    /// A match is passed to [`Handler::handle`] as `route`. A miss with no
    /// fallback registered (see [`Router::fallback`]) answers `404` directly
    /// without invoking the handler at all. Omitting this call leaves
    /// `route` always `None`, and handlers are expected to dispatch on the
    /// request's URL themselves, exactly as without a `Router`.
    #[inline(always)]
    pub fn router(mut self, router: Router<RouteId>) -> Self {
        self.router = Some(router);
        self
    }

    /// Installs a [`WsAuthPolicy`] gate evaluated against every WebSocket
    /// upgrade before the `101` response is sent.
    ///
    /// A rejected upgrade never reaches [`Handler::on_websocket`]; the
    /// connection answers `401` (token rejected or missing) or `403` (IP
    /// blocked) instead. Omitting this call admits every upgrade the
    /// handler itself approved.
    #[inline(always)]
    pub fn ws_auth_policy<V>(mut self, policy: WsAuthPolicy<V>) -> Self
    where
        V: TokenValidator + 'static,
    {
        self.ws_auth = Some(policy.boxed());
        self
    }

    /// Applies a loaded [`crate::ServerConfig`] (see [`crate::config`]),
    /// splitting its flat key table into the individual limit structs.
    ///
    /// Call before the more specific `*_limits` setters if you want those to
    /// take precedence over the config file — the last call for a given
    /// component always wins. Does not itself enable the rate limiter (that
    /// remains an explicit opt-in via [`Self::rate_limiter`]); call
    /// `.rate_limiter(config.rate_limiter_limits())` alongside it if the
    /// config's `rate_limit_window` should take effect.
    #[inline]
    pub fn config(mut self, config: crate::ServerConfig) -> Self {
        let (server_limits, connection_limits, request_limits, response_limits, _) =
            config.into_limits();

        self.server_limits = Some(server_limits);
        self.connection_limits = Some(connection_limits);
        self.request_limits = Some(request_limits);
        self.response_limits = Some(response_limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Panics when:
    /// - The `listener` method was not called.
    /// - The `handler` method was not called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server<H, S, F> {
        let server_limits = self.server_limits.unwrap_or_default();

        let cache = self.static_root.map(|root| {
            let cache = Cache::new(root, self.cache_limits.unwrap_or_default());
            for task in &self.prewarm {
                match task {
                    PrewarmTask::File(path) => {
                        cache.prewarm(path);
                    }
                    PrewarmTask::Directory(path, max_files) => {
                        cache.prewarm_directory(path, *max_files);
                    }
                }
            }
            Rc::new(cache)
        });
        let rate_limiter = self
            .rate_limiter_limits
            .map(|limits| Rc::new(RateLimiter::new(limits)));

        let limits = (
            server_limits.clone(),
            self.connection_limits.unwrap_or_default(),
            self.http_09_limits,
            self.request_limits.unwrap_or_default().precalculate(),
            self.response_limits.unwrap_or_default(),
            self.ws_limits.unwrap_or_default(),
            rate_limiter,
            cache,
            self.router.map(Rc::new),
            self.ws_auth.map(Rc::new),
        );

        let (stop_tx, stop_rx) = watch::channel(false);

        Server {
            listener: self
                .listener
                .expect("The `listener` method must be called to create"),
            handler: self
                .handler
                .expect("The `handler` method must be called to create"),
            connection_filter: self.connection_filter,
            active_connections: Rc::new(Cell::new(0)),
            server_limits,
            limits,
            stop_tx,
            stop_rx,
            _marker: PhantomData,
        }
    }
}

pub(crate) type AllLimits = (
    ServerLimits,
    ConnLimits,
    Option<Http09Limits>,
    ReqLimits,
    RespLimits,
    WsLimits,
    Option<Rc<RateLimiter>>,
    Option<Rc<Cache>>,
    Option<Rc<Router<RouteId>>>,
    Option<Rc<WsAuthPolicy<Box<dyn TokenValidator>>>>,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Handled, StatusCode};
    use tokio::task::LocalSet;

    struct Pong;

    impl Handler<()> for Pong {
        async fn handle(
            &self,
            _: &mut (),
            _: Option<&RouteMatch<'_, RouteId>>,
            _: &Request,
            resp: &mut Response,
        ) -> Handled {
            resp.status(StatusCode::Ok).body("pong")
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stop_handle_ends_the_accept_loop() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let server = Server::builder()
                    .listener(listener)
                    .handler(Pong)
                    .build();
                let handle = server.handle();

                let launched = tokio::task::spawn_local(server.launch());
                handle.stop();

                tokio::time::timeout(std::time::Duration::from_secs(1), launched)
                    .await
                    .expect("launch() did not return after stop()")
                    .unwrap();
            })
            .await;
    }
}
