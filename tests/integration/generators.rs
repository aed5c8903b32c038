//! Remote generator lifecycles: iteration, two-way send, explicit
//! shutdown, injected errors, and the wire-level step sequence.

mod util;

use mux_test_utils::RawClient;
use muxrpc::{App, ErrorObject, Event, Frame};
use serde_json::{json, Value};
use util::{client_url, serve_detail, DETAIL, SVC_PATH};

#[tokio::test]
async fn getting_result_from_remote_generator() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let app = App::new();
    let detail = app.proxy(DETAIL);
    client.register(&detail);

    let mut orgs = detail.call("getOrgs", vec![]).unwrap();
    let mut collected = Vec::new();
    while let Some(value) = orgs.next().await.unwrap() {
        collected.push(value);
    }
    assert_eq!(
        collected,
        vec![json!("Mozilla"), json!("GitHub"), json!("Linux")]
    );

    // A finished generator stays finished.
    assert_eq!(orgs.next().await.unwrap(), None);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn invoking_send_on_remote_generator() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let app = App::new();
    let detail = app.proxy(DETAIL);
    client.register(&detail);

    let mut echo = detail.call("repeatAfterMe", vec![]).unwrap();
    assert_eq!(echo.next().await.unwrap(), Some(Value::Null));
    assert_eq!(
        echo.send_value(json!("Google")).await.unwrap(),
        Some(json!("Google"))
    );
    assert_eq!(echo.send_value(json!("break")).await.unwrap(), None);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn invoking_stop_on_remote_generator() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let app = App::new();
    let detail = app.proxy(DETAIL);
    client.register(&detail);

    let mut echo = detail.call("repeatAfterMe", vec![]).unwrap();
    echo.stop().await.unwrap();
    // Operations on a stopped handle are no-ops.
    assert_eq!(echo.next().await.unwrap(), None);
    echo.stop().await.unwrap();

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn invoking_throw_on_remote_generator() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let app = App::new();
    let detail = app.proxy(DETAIL);
    client.register(&detail);

    let mut echo = detail.call("repeatAfterMe", vec![]).unwrap();
    let err = echo
        .throw(ErrorObject::new("Error", "test athrow method"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "test athrow method");

    // The task terminated on both ends.
    assert_eq!(echo.next().await.unwrap(), None);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn wire_level_yield_sequence() {
    util::init_tracing();
    let (server, port) = serve_detail().await;

    let url = format!("ws://127.0.0.1:{port}{SVC_PATH}?id=probe");
    let mut probe = RawClient::connect_ok(&url).await;
    let _connect = probe.recv_frame().await.unwrap();

    probe
        .send_frame(&Frame::call(Event::Invoke, 1, DETAIL, "getOrgs", vec![]))
        .await
        .unwrap();

    // Generator invocations are acked with an INVOKE frame.
    let ack = probe.recv_frame().await.unwrap();
    assert_eq!(ack.event, Event::Invoke);
    assert_eq!(ack.data(), Value::Null);

    let mut steps = Vec::new();
    loop {
        probe
            .send_frame(&Frame::call(
                Event::Yield,
                1,
                DETAIL,
                "getOrgs",
                vec![Value::Null],
            ))
            .await
            .unwrap();
        let reply = probe.recv_frame().await.unwrap();
        assert_eq!(reply.event, Event::Yield);
        let step = reply.data();
        let done = step.get("done").and_then(Value::as_bool) == Some(true);
        steps.push(step);
        if done {
            break;
        }
    }
    assert_eq!(
        steps,
        vec![
            json!({"done": false, "value": "Mozilla"}),
            json!({"done": false, "value": "GitHub"}),
            json!({"done": false, "value": "Linux"}),
            json!({"done": true}),
        ]
    );

    // Driving a deleted generator reports the failed callee.
    probe
        .send_frame(&Frame::call(
            Event::Yield,
            1,
            DETAIL,
            "getOrgs",
            vec![Value::Null],
        ))
        .await
        .unwrap();
    let reply = probe.recv_frame().await.unwrap();
    assert_eq!(reply.event, Event::Throw);
    let err = ErrorObject::from_value(&reply.data());
    assert_eq!(err.name, "ReferenceError");
    assert_eq!(
        err.message,
        format!("Failed to call {DETAIL}(route).getOrgs()")
    );

    probe.close().await.unwrap();
    server.close().await;
}
