use reactorweb::{router::RouteId, Handled, Handler, Request, Response, RouteMatch, Server, StatusCode};
use tokio::{net::TcpListener, task::LocalSet};

struct HelloWorld;

impl Handler<()> for HelloWorld {
    async fn handle(
        &self,
        _: &mut (),
        _: Option<&RouteMatch<'_, RouteId>>,
        _: &Request,
        resp: &mut Response,
    ) -> Handled {
        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body("Hello, world!")
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    LocalSet::new()
        .run_until(async {
            Server::builder()
                .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
                .handler(HelloWorld)
                .build()
                .launch()
                .await;
        })
        .await;
}
