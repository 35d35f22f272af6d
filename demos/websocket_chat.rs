// A WebSocket chat room: every connection to `/ws` joins the same room and
// every message one client sends is fanned out to all the others (including
// itself) via `WsRegistry::broadcast`.
use reactorweb::{
    limits::{CacheLimits, WsLimits},
    router::RouteId,
    websocket::{self, Message, WsAuthPolicy, WsConnection, WsRegistry},
    Handled, Handler, Request, Response, RouteMatch, Server, StatusCode,
};
use tokio::{net::TcpListener, task::LocalSet};

const ROOM: &str = "/ws";

struct ChatHandler {
    rooms: WsRegistry,
}

impl Handler for ChatHandler {
    async fn handle(
        &self,
        _: &mut (),
        _: Option<&RouteMatch<'_, RouteId>>,
        request: &Request,
        resp: &mut Response,
    ) -> Handled {
        if request.url().path() == ROOM.as_bytes() {
            return match websocket::is_upgrade_request(request) {
                Some(key) => resp.websocket_upgrade(websocket::accept_key(key)),
                None => resp
                    .status(StatusCode::BadRequest)
                    .body("expected a WebSocket upgrade"),
            };
        }

        resp.status(StatusCode::NotFound).body("not found")
    }

    async fn on_websocket(
        &self,
        _: &mut (),
        _: &Request,
        ws: &mut WsConnection<'_, tokio::net::TcpStream>,
    ) {
        // Every frame this connection receives is republished to the room
        // (including back to the sender, mirroring a typical chat UI); every
        // frame anyone else publishes to the room is delivered here too,
        // since `subscribe` wires the room's broadcasts into `ws.recv()`.
        ws.subscribe(&self.rooms, ROOM);

        loop {
            match ws.recv().await {
                Ok(Message::Text(text)) => self.rooms.broadcast(ROOM, Message::Text(text)),
                Ok(Message::Binary(data)) => self.rooms.broadcast(ROOM, Message::Binary(data)),
                Err(_) => break,
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    LocalSet::new()
        .run_until(async {
            Server::builder()
                .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
                .handler(ChatHandler {
                    rooms: WsRegistry::new(),
                })
                .serve_static("demos/static")
                .cache_limits(CacheLimits::default())
                .ws_limits(WsLimits::default())
                .ws_auth_policy(WsAuthPolicy {
                    enable_token_auth: true,
                    validator: Some(|token: &str| token == "secret123"),
                    ..Default::default()
                })
                .build()
                .launch()
                .await;
        })
        .await;
}
