//! RFC 6455 WebSocket support: handshake, frame codec, and a small
//! message-oriented connection loop to run once a [`crate::Response`] has
//! called [`crate::Response::websocket_upgrade`].
//!
//! Grounded in the connection layer's own pattern of a fixed-size read
//! buffer driven by the Tokio reactor (see [`crate::server::connection`]):
//! a [`WsConnection`] owns a single growable `Vec<u8>` read buffer and
//! decodes frames out of it in place, same as the HTTP request parser reuses
//! its buffer across requests.

pub mod auth;
pub mod frame;

pub use auth::WsAuthPolicy;

use crate::limits::WsLimits;
use base64::Engine;
use frame::{CloseCode, DecodedFrame, Opcode};
use sha1::{Digest, Sha1};
use std::{cell::RefCell, collections::HashMap, io, rc::Rc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a given `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Whether an incoming request's headers constitute a valid WebSocket
/// upgrade request (RFC 6455 §4.2.1): `Upgrade: websocket`,
/// `Connection: Upgrade`, `Sec-WebSocket-Version: 13`, and a present
/// `Sec-WebSocket-Key`.
pub fn is_upgrade_request(request: &crate::Request) -> Option<&str> {
    let upgrade = request.header(b"upgrade")?;
    if !upgrade.eq_ignore_ascii_case(b"websocket") {
        return None;
    }

    let connection = request.header(b"connection")?;
    if !contains_token_ci(connection, b"upgrade") {
        return None;
    }

    let version = request.header(b"sec-websocket-version")?;
    if version != b"13" {
        return None;
    }

    let key = request.header(b"sec-websocket-key")?;
    std::str::from_utf8(key).ok()
}

fn contains_token_ci(header_value: &[u8], token: &[u8]) -> bool {
    header_value
        .split(|&b| b == b',')
        .map(|part| {
            let trimmed = part
                .iter()
                .copied()
                .skip_while(u8::is_ascii_whitespace)
                .collect::<Vec<u8>>();
            let end = trimmed
                .iter()
                .rposition(|b| !b.is_ascii_whitespace())
                .map(|i| i + 1)
                .unwrap_or(0);
            trimmed[..end].to_vec()
        })
        .any(|part| part.eq_ignore_ascii_case(token))
}

/// A message delivered to the caller of [`WsConnection::recv`].
#[derive(Debug, Clone)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// Why [`WsConnection::recv`] stopped delivering messages.
#[derive(Debug)]
pub enum WsError {
    Io(io::Error),
    Closed(CloseCode),
}

impl From<io::Error> for WsError {
    fn from(err: io::Error) -> Self {
        WsError::Io(err)
    }
}

/// A single-threaded fan-out table from WebSocket endpoint path to the set of
/// currently-connected [`WsConnection`]s subscribed under it.
///
/// Grounded in the same `Rc<RefCell<..>>` sharing idiom the rest of this
/// crate uses for loop-owned mutable state (the router, cache, and rate
/// limiter are all plain `Rc`s, never `Arc`s, since every connection lives on
/// the one reactor thread — see `server/connection.rs`). Holding onto a
/// `WsRegistry` (by cloning it; it's cheap, a single `Rc`) lets a [`Handler`]
/// implementation call [`WsRegistry::broadcast`] from an HTTP route (e.g. a
/// `POST /announce`) or from another WebSocket connection's message loop,
/// fanning a message out to everyone subscribed at a given path.
///
/// [`Handler`]: crate::Handler
#[derive(Clone, Default)]
pub struct WsRegistry {
    subscribers: Rc<RefCell<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>>,
}

impl WsRegistry {
    /// Creates an empty registry. Clone it into every `Handler` that needs to
    /// publish or subscribe; clones share the same subscriber table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `message` to every connection currently subscribed at `path`.
    ///
    /// Subscribers whose connection has since closed (detected by a failed
    /// send on their channel) are dropped from the table as a side effect,
    /// so a registry with no live readers at `path` quietly empties itself
    /// instead of growing forever.
    pub fn broadcast(&self, path: &str, message: Message) {
        let mut subscribers = self.subscribers.borrow_mut();
        let Some(senders) = subscribers.get_mut(path) else {
            return;
        };
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        if senders.is_empty() {
            subscribers.remove(path);
        }
    }

    /// Number of connections currently subscribed at `path`. Exposed mainly
    /// for tests and metrics; not load-bearing for correctness.
    pub fn subscriber_count(&self, path: &str) -> usize {
        self.subscribers
            .borrow()
            .get(path)
            .map_or(0, |senders| senders.len())
    }

    fn subscribe(&self, path: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .borrow_mut()
            .entry(path.to_string())
            .or_default()
            .push(tx);
        rx
    }
}

/// A live WebSocket connection, after the HTTP-to-WebSocket handshake has
/// completed.
///
/// Owns the read buffer used to reassemble fragmented messages and to
/// auto-reply to ping/close control frames; `recv` is the only entry point
/// callers need for the common request/response message loop.
pub struct WsConnection<'a, S> {
    stream: &'a mut S,
    read_buf: Vec<u8>,
    filled: usize,
    limits: WsLimits,
    closed: bool,
    broadcast_rx: Option<mpsc::UnboundedReceiver<Message>>,
}

impl<'a, S: AsyncReadExt + AsyncWriteExt + Unpin> WsConnection<'a, S> {
    pub fn new(stream: &'a mut S, limits: WsLimits) -> Self {
        Self {
            stream,
            read_buf: vec![0u8; 8 * 1024],
            filled: 0,
            limits,
            closed: false,
            broadcast_rx: None,
        }
    }

    /// Subscribes this connection to `registry` under `path`, so that any
    /// later call to `registry.broadcast(path, ..)` (from this connection's
    /// own message loop, another connection's, or an ordinary HTTP handler
    /// holding a clone of the same registry) is delivered out over this
    /// socket the next time [`recv`](Self::recv) is polled.
    ///
    /// A connection subscribes to at most one path at a time; calling this
    /// again replaces the previous subscription.
    pub fn subscribe(&mut self, registry: &WsRegistry, path: &str) {
        self.broadcast_rx = Some(registry.subscribe(path));
    }

    /// Reads until the next complete message is reassembled, transparently
    /// handling ping/pong/close control frames, fragmentation, and (if
    /// [`subscribe`](Self::subscribe) was called) broadcast delivery.
    pub async fn recv(&mut self) -> Result<Message, WsError> {
        if self.closed {
            return Err(WsError::Closed(CloseCode::Normal));
        }

        let mut assembling: Option<(Opcode, Vec<u8>)> = None;
        let mut fragment_count = 0usize;

        loop {
            while let Some((frame, consumed)) =
                frame::decode(&self.read_buf[..self.filled], self.limits.max_message_size)
                    .map_err(WsError::Closed)?
            {
                self.consume(consumed);

                match self.handle_frame(frame, &mut assembling, &mut fragment_count).await? {
                    Some(message) => return Ok(message),
                    None => continue,
                }
            }

            tokio::select! {
                biased;
                result = Self::fill_more(&mut *self.stream, &mut self.read_buf, &mut self.filled) => {
                    result?;
                }
                Some(message) = Self::next_broadcast(&mut self.broadcast_rx) => {
                    self.send_message(&message).await?;
                }
            }
        }
    }

    /// Resolves to the next broadcast message, or never resolves if this
    /// connection hasn't subscribed — letting it participate in a
    /// [`tokio::select!`] unconditionally.
    async fn next_broadcast(rx: &mut Option<mpsc::UnboundedReceiver<Message>>) -> Option<Message> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn send_message(&mut self, message: &Message) -> io::Result<()> {
        let bytes = match message {
            Message::Text(text) => frame::encode(Opcode::Text, true, text.as_bytes()),
            Message::Binary(data) => frame::encode(Opcode::Binary, true, data),
        };
        self.send_raw(bytes).await
    }

    async fn handle_frame(
        &mut self,
        frame: DecodedFrame,
        assembling: &mut Option<(Opcode, Vec<u8>)>,
        fragment_count: &mut usize,
    ) -> Result<Option<Message>, WsError> {
        match frame.opcode {
            Opcode::Ping => {
                self.send_raw(frame::encode(Opcode::Pong, true, &frame.payload))
                    .await?;
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Close => {
                self.closed = true;
                let (code, reason) = parse_close_payload(&frame.payload);
                self.send_raw(frame::encode_close(code, &reason)).await?;
                Err(WsError::Closed(code))
            }
            Opcode::Text | Opcode::Binary => {
                if assembling.is_some() {
                    return Err(WsError::Closed(CloseCode::ProtocolError));
                }
                if frame.fin {
                    return Ok(Some(self.finish_message(frame.opcode, frame.payload)?));
                }
                *assembling = Some((frame.opcode, frame.payload));
                *fragment_count = 1;
                Ok(None)
            }
            Opcode::Continuation => {
                let Some((opcode, buf)) = assembling else {
                    return Err(WsError::Closed(CloseCode::ProtocolError));
                };
                *fragment_count += 1;
                if *fragment_count > self.limits.max_fragments {
                    return Err(WsError::Closed(CloseCode::MessageTooBig));
                }
                buf.extend_from_slice(&frame.payload);
                if buf.len() > self.limits.max_message_size {
                    return Err(WsError::Closed(CloseCode::MessageTooBig));
                }

                if frame.fin {
                    let (opcode, buf) = assembling.take().unwrap();
                    Ok(Some(self.finish_message(opcode, buf)?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn finish_message(&self, opcode: Opcode, payload: Vec<u8>) -> Result<Message, WsError> {
        match opcode {
            Opcode::Text => String::from_utf8(payload)
                .map(Message::Text)
                .map_err(|_| WsError::Closed(CloseCode::InvalidFramePayloadData)),
            Opcode::Binary => Ok(Message::Binary(payload)),
            _ => unreachable!("only text/binary reach finish_message"),
        }
    }

    fn consume(&mut self, n: usize) {
        self.read_buf.copy_within(n..self.filled, 0);
        self.filled -= n;
    }

    /// Free function (not a `&mut self` method) so that, inside `recv`'s
    /// `tokio::select!`, it can borrow `stream`/`read_buf`/`filled` while the
    /// other branch independently borrows `broadcast_rx` — two disjoint
    /// partial borrows of `self`, which a method call on `&mut self` as a
    /// whole would not allow.
    async fn fill_more(stream: &mut S, read_buf: &mut Vec<u8>, filled: &mut usize) -> io::Result<()> {
        if *filled == read_buf.len() {
            read_buf.resize(read_buf.len() * 2, 0);
        }
        let n = stream.read(&mut read_buf[*filled..]).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
        }
        *filled += n;
        Ok(())
    }

    async fn send_raw(&mut self, bytes: Vec<u8>) -> io::Result<()> {
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }

    /// Sends a text message.
    pub async fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send_raw(frame::encode(Opcode::Text, true, text.as_bytes()))
            .await
    }

    /// Sends a binary message.
    pub async fn send_binary(&mut self, data: &[u8]) -> io::Result<()> {
        self.send_raw(frame::encode(Opcode::Binary, true, data)).await
    }

    /// Sends a close frame and marks the connection closed.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> io::Result<()> {
        self.closed = true;
        self.send_raw(frame::encode_close(code, reason)).await
    }
}

fn parse_close_payload(payload: &[u8]) -> (CloseCode, String) {
    if payload.len() < 2 {
        return (CloseCode::Normal, String::new());
    }
    let code_value = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    let code = match code_value {
        1000 => CloseCode::Normal,
        1001 => CloseCode::GoingAway,
        1002 => CloseCode::ProtocolError,
        1003 => CloseCode::UnsupportedData,
        1007 => CloseCode::InvalidFramePayloadData,
        1008 => CloseCode::PolicyViolation,
        1009 => CloseCode::MessageTooBig,
        1010 => CloseCode::MandatoryExtension,
        _ => CloseCode::InternalError,
    };
    (code, reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // The canonical example from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn contains_token_ci_matches_case_insensitively_and_with_commas() {
        assert!(contains_token_ci(b"Upgrade", b"upgrade"));
        assert!(contains_token_ci(b"keep-alive, Upgrade", b"upgrade"));
        assert!(!contains_token_ci(b"keep-alive", b"upgrade"));
    }

    #[test]
    fn parses_close_payload_with_reason() {
        let mut payload = vec![0x03, 0xE8]; // 1000
        payload.extend_from_slice(b"bye");
        let (code, reason) = parse_close_payload(&payload);
        assert_eq!(code, CloseCode::Normal);
        assert_eq!(reason, "bye");
    }

    #[test]
    fn empty_close_payload_defaults_to_normal() {
        let (code, reason) = parse_close_payload(&[]);
        assert_eq!(code, CloseCode::Normal);
        assert_eq!(reason, "");
    }

    #[test]
    fn registry_tracks_and_forgets_subscriber_count() {
        let registry = WsRegistry::new();
        assert_eq!(registry.subscriber_count("/chat"), 0);

        let rx = registry.subscribe("/chat");
        assert_eq!(registry.subscriber_count("/chat"), 1);

        // A send into a dropped receiver fails, so broadcasting prunes it.
        drop(rx);
        registry.broadcast("/chat", Message::Text("hi".into()));
        assert_eq!(registry.subscriber_count("/chat"), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_a_subscribed_connection_without_surfacing_as_a_message() {
        let (mut client, mut server_side) = tokio::io::duplex(4096);
        let registry = WsRegistry::new();

        let mut ws = WsConnection::new(&mut server_side, WsLimits::default());
        ws.subscribe(&registry, "/chat");
        registry.broadcast("/chat", Message::Text("hi".into()));

        // A broadcast is written straight to the wire; it's never handed back
        // to the caller as an inbound `Message`, so `recv` keeps waiting for
        // an actual client frame (none arrives, so it times out here).
        let recv_result =
            tokio::time::timeout(std::time::Duration::from_millis(50), ws.recv()).await;
        assert!(recv_result.is_err());

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(std::time::Duration::from_millis(50), client.read(&mut buf))
            .await
            .expect("broadcast frame should have been written")
            .unwrap();
        assert_eq!(&buf[..n], frame::encode(Opcode::Text, true, b"hi").as_slice());
    }

    #[tokio::test]
    async fn unrelated_path_broadcast_is_not_delivered() {
        let (mut client, mut server_side) = tokio::io::duplex(4096);
        let registry = WsRegistry::new();

        let mut ws = WsConnection::new(&mut server_side, WsLimits::default());
        ws.subscribe(&registry, "/chat");
        registry.broadcast("/other-room", Message::Text("hi".into()));

        let mut buf = [0u8; 64];
        let read_result =
            tokio::time::timeout(std::time::Duration::from_millis(50), client.read(&mut buf))
                .await;
        assert!(read_result.is_err(), "no frame should have been written");
    }
}
