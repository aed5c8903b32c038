//! Serving and connecting: handshake, unary calls, channel identity.

mod util;

use muxrpc::{App, RpcError, RpcServer};
use serde_json::json;
use util::{client_url, serve_detail, serve_detail_at, DetailService, DETAIL};

#[tokio::test]
async fn serving_and_connecting_rpc_service() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let app = App::new();
    let detail = app.proxy(DETAIL);
    client.register(&detail);

    detail
        .call("setName", vec![json!("Mr. Handsome")])
        .unwrap()
        .result()
        .await
        .unwrap();
    let name = detail.call("getName", vec![]).unwrap().result().await.unwrap();
    assert_eq!(name, json!("Mr. Handsome"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn serving_and_connecting_rpc_with_secret() {
    util::init_tracing();
    let (server, port) = serve_detail_at(0, "tesla").await;
    let url = format!("{}&secret=tesla", client_url(port, "c1"));
    let client = App::connect(url.as_str()).await.unwrap();

    let app = App::new();
    let detail = app.proxy(DETAIL);
    client.register(&detail);

    detail
        .call("setName", vec![json!("Mr. Handsome")])
        .unwrap()
        .result()
        .await
        .unwrap();
    let name = detail.call("getName", vec![]).unwrap().result().await.unwrap();
    assert_eq!(name, json!("Mr. Handsome"));

    client.close().await;
    server.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn serving_and_connecting_over_unix_domain_socket() {
    util::init_tracing();
    let path = std::env::temp_dir()
        .join(format!("muxrpc-test-{}.sock", std::process::id()))
        .to_string_lossy()
        .into_owned();

    let server = RpcServer::new(path.as_str()).unwrap();
    server.register(DETAIL, DetailService::default);
    server.open(true).await.unwrap();
    assert_eq!(server.dsn(), format!("ipc:{path}"));

    let client = App::connect(format!("{path}?id=c1").as_str()).await.unwrap();
    let name = client
        .invoke(DETAIL, "getName", vec![])
        .result()
        .await
        .unwrap();
    assert_eq!(name, json!("Mr. World"));

    client.close().await;
    server.close().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn client_learns_server_identity_from_connect_frame() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    assert!(client.connected());
    assert_eq!(client.server_id(), server.id());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn set_and_get_round_trips_structured_values() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let app = App::new();
    let detail = app.proxy(DETAIL);
    client.register(&detail);

    let payload = json!({
        "greeting": "Hello, World!",
        "nested": {"n": 3, "orgs": ["Mozilla", "GitHub", "Linux"]},
        "flag": true,
        "nil": null,
    });
    let echoed = detail
        .call("setAndGet", vec![payload.clone()])
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(echoed, payload);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn task_ids_are_unique_and_increasing() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let first = client.invoke(DETAIL, "getName", vec![]);
    let second = client.invoke(DETAIL, "getName", vec![]);
    assert!(second.task_id() > first.task_id());
    assert_eq!(first.result().await.unwrap(), json!("Mr. World"));
    assert_eq!(second.result().await.unwrap(), json!("Mr. World"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn remote_method_errors_flow_back_as_throw() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let err = client
        .invoke(DETAIL, "raiseError", vec![])
        .result()
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(obj) => {
            assert_eq!(obj.name, "TypeError");
            assert_eq!(obj.message, "something went wrong");
            assert_eq!(obj.kind(), muxrpc::ErrorKind::Type);
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    // The connection survives application errors.
    let name = client
        .invoke(DETAIL, "getName", vec![])
        .result()
        .await
        .unwrap();
    assert_eq!(name, json!("Mr. World"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn reopening_a_connected_channel_is_an_error() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    assert!(matches!(
        client.open().await,
        Err(RpcError::AlreadyOpen(_))
    ));

    client.close().await;
    assert!(matches!(
        client.open().await,
        Err(RpcError::ChannelClosed(_))
    ));
    server.close().await;
}
