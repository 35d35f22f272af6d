//! reactorweb - embeddable single-threaded HTTP/1.1 and WebSocket server core
//!
//! Everything an application needs to accept TCP connections on one
//! cooperative event loop and serve them as HTTP/1.1 (with optional
//! [`HTTP/0.9+`](limits::Http09Limits)) and upgraded WebSocket traffic: an
//! incremental request parser, a fingerprint-addressed [`router::Router`], a
//! per-IP [rate limiter](rate_limiter), a bounded LRU static-file
//! [cache](cache), and an RFC 6455 frame codec with a token/IP
//! [auth gate](websocket::auth) on upgrade.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, keep-alive quota accounting
//! - **HTTP/1.0**: basic support for legacy clients
//! - **HTTP/0.9+**: optional, see [`limits::Http09Limits`]
//! - **WebSocket**: RFC 6455 handshake, masking, fragmentation, control frames
//!
//! # Design
//!
//! The server drives every accepted connection from a single OS thread (see
//! [`Server::launch`]): one [`tokio::task::spawn_local`] task per connection,
//! no worker pool, no cross-thread synchronization. [`Handler`] is the single
//! entry point an application implements; [`ConnectionData`] carries
//! per-connection state across a keep-alive session's requests, and
//! [`ConnectionFilter`] rejects unwanted peers before the first byte is read.
//!
//! # Quick Start
//!
//! ```toml
//! [dependencies]
//! reactorweb = "0.1"
//! tokio = { version = "1", features = ["rt", "net", "macros"] }
//! ```
//!
//! ```no_run
//! use reactorweb::{Server, Handler, Request, Response, Handled, StatusCode, RouteMatch, router::RouteId};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(
//!         &self,
//!         _: &mut (),
//!         _route: Option<&RouteMatch<'_, RouteId>>,
//!         _: &Request,
//!         resp: &mut Response,
//!     ) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!")
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     tokio::task::LocalSet::new()
//!         .run_until(async {
//!             Server::builder()
//!                 .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!                 .handler(MyHandler)
//!                 .build()
//!                 .launch()
//!                 .await;
//!         })
//!         .await;
//! }
//! ```
//!
//! See `demos/` in the repository for connection filtering, routing, the
//! static file cache, and WebSocket handling.
pub(crate) mod http {
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub(crate) mod cache;
pub mod config;
pub(crate) mod errors;
pub mod limits;
pub mod logging;
pub(crate) mod rate_limiter;
pub mod router;
pub mod websocket;

pub use crate::{
    config::ServerConfig,
    http::{
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Url, Version},
    },
    logging::LoggingConfig,
    router::{RouteId, RouteMatch, RouteParams, Router},
    server::{
        connection::{ConnectionData, ConnectionFilter},
        server_impl::{Handler, Server, ServerBuilder, ServerHandle},
    },
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    f(
        &Request::new(&crate::limits::ReqLimits::default()),
        &mut Response::new(&crate::limits::RespLimits::default()),
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use reactorweb::{router::RouteId, Handled, Handler, Request, Response, RouteMatch, StatusCode};
        struct $name;

        // `<()>` to check functionality
        impl Handler<()> for $name {
            async fn handle(
                &self,
                _: &mut (),
                _: Option<&RouteMatch<'_, RouteId>>,
                _: &Request,
                resp: &mut Response,
            ) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
