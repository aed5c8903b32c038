//! Multi-server routing: one proxy, several servers, deterministic
//! call-site selection by route key.

mod util;

use muxrpc::proxy::route_id;
use muxrpc::{App, Dispatch, Module, RpcClient, RpcError, RpcServer};
use serde_json::{json, Value};
use std::sync::Arc;
use util::SVC_PATH;

const ECHO: &str = "services.echo";

/// Reports which server instance answered.
struct EchoService {
    tag: &'static str,
}

impl Module for EchoService {
    fn dispatch(&self, method: &str, _args: Vec<Value>) -> Result<Dispatch, RpcError> {
        match method {
            "whoami" => Ok(Dispatch::Value(json!(self.tag))),
            _ => Err(muxrpc::module::unknown_method(ECHO, method)),
        }
    }
}

async fn serve_tagged(server_id: &str, tag: &'static str) -> (RpcServer, u16) {
    let url = format!("ws://127.0.0.1:0{SVC_PATH}?id={server_id}");
    let server = RpcServer::new(url.as_str()).unwrap();
    server.register(ECHO, move || EchoService { tag });
    server.open(true).await.unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

struct Mesh {
    server_a: RpcServer,
    server_b: RpcServer,
    client_a: RpcClient,
    client_b: RpcClient,
    echo: Arc<muxrpc::ModuleProxy>,
}

async fn build_mesh() -> Mesh {
    util::init_tracing();
    let (server_a, port_a) = serve_tagged("A", "alpha").await;
    let (server_b, port_b) = serve_tagged("B", "beta").await;

    let client_a = App::connect(format!("ws://127.0.0.1:{port_a}{SVC_PATH}?id=ca").as_str())
        .await
        .unwrap();
    let client_b = App::connect(format!("ws://127.0.0.1:{port_b}{SVC_PATH}?id=cb").as_str())
        .await
        .unwrap();

    let app = App::new();
    let echo = app.proxy(ECHO);
    client_a.register(&echo);
    client_b.register(&echo);

    Mesh {
        server_a,
        server_b,
        client_a,
        client_b,
        echo,
    }
}

impl Mesh {
    async fn teardown(self) {
        self.client_a.close().await;
        self.client_b.close().await;
        self.server_a.close().await;
        self.server_b.close().await;
    }
}

async fn whoami(mesh: &Mesh, args: Vec<Value>) -> String {
    mesh.echo
        .call("whoami", args)
        .unwrap()
        .result()
        .await
        .unwrap()
        .as_str()
        .unwrap()
        .to_owned()
}

#[tokio::test]
async fn string_route_matching_a_server_id_addresses_it_directly() {
    let mesh = build_mesh().await;

    assert_eq!(mesh.echo.server_ids(), vec!["A", "B"]);
    assert_eq!(whoami(&mesh, vec![json!("A")]).await, "alpha");
    assert_eq!(whoami(&mesh, vec![json!("B")]).await, "beta");

    mesh.teardown().await;
}

#[tokio::test]
async fn non_matching_routes_select_deterministically_among_ready() {
    let mesh = build_mesh().await;

    let expected_for = |route: &Value| {
        let index = (route_id(route) % 2) as usize;
        ["alpha", "beta"][index].to_owned()
    };

    // The empty route (no args) behaves like routing on "".
    let empty = Value::String(String::new());
    let picked = whoami(&mesh, vec![]).await;
    assert_eq!(picked, expected_for(&empty));
    for _ in 0..3 {
        assert_eq!(whoami(&mesh, vec![]).await, picked);
    }

    for route in [json!("shard-17"), json!(7), json!({"tenant": "acme"})] {
        let expected = expected_for(&route);
        for _ in 0..2 {
            assert_eq!(whoami(&mesh, vec![route.clone()]).await, expected);
        }
    }

    mesh.teardown().await;
}

#[tokio::test]
async fn paused_handles_are_excluded_from_selection() {
    let mesh = build_mesh().await;

    mesh.client_a.pause();
    // Every non-key route lands on the one ready handle.
    assert_eq!(whoami(&mesh, vec![]).await, "beta");
    assert_eq!(whoami(&mesh, vec![json!("anything")]).await, "beta");
    assert_eq!(whoami(&mesh, vec![json!(42)]).await, "beta");

    mesh.client_a.resume();
    mesh.client_b.pause();
    assert_eq!(whoami(&mesh, vec![]).await, "alpha");

    mesh.client_b.resume();
    mesh.client_a.pause();
    mesh.client_b.pause();
    let err = mesh.echo.call("whoami", vec![]).unwrap_err();
    assert!(matches!(err, RpcError::ServiceUnavailable(_)));

    mesh.teardown().await;
}
