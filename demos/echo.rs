use reactorweb::{router::RouteId, Handled, Handler, Request, Response, RouteMatch, Server, StatusCode};
use std::str::from_utf8;
use tokio::{net::TcpListener, task::LocalSet};

struct MyHandler;

impl Handler for MyHandler {
    async fn handle(
        &self,
        _: &mut (),
        _route: Option<&RouteMatch<'_, RouteId>>,
        req: &Request,
        resp: &mut Response,
    ) -> Handled {
        let result = format!(
            r#"{{"url": {:?}, "body": {:?}}}"#,
            from_utf8(req.url().path()).unwrap_or(""),
            from_utf8(req.body().unwrap_or(&[])).unwrap_or(""),
        );

        resp.status(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .body(result)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    LocalSet::new()
        .run_until(async {
            Server::builder()
                .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
                .handler(MyHandler)
                .build()
                .launch()
                .await;
        })
        .await;
}
