//! Topic broadcast: subscription bookkeeping, fan-out, targeted
//! delivery, and handler failure isolation.

mod util;

use muxrpc::{App, RpcError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use util::{client_url, serve_detail};

fn capture() -> (Arc<Mutex<Option<Value>>>, impl Fn(Value) -> Result<(), RpcError> + Clone) {
    let cell = Arc::new(Mutex::new(None));
    let writer = cell.clone();
    (cell, move |data: Value| {
        *writer.lock().unwrap() = Some(data);
        Ok(())
    })
}

#[tokio::test]
async fn getting_all_clients() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "abc").as_str()).await.unwrap();

    assert_eq!(client.id(), "abc");
    util::wait_for("client to appear in the table", Duration::from_secs(2), || {
        server.clients() == vec!["abc".to_owned()]
    })
    .await;

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn subscribing_and_publishing_topic() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let (data, handler) = capture();
    client.subscribe("set-data", handler);
    server.publish("set-data", json!("Mr. World"), &[]);

    util::wait_for("publish to arrive", Duration::from_secs(2), || {
        data.lock().unwrap().is_some()
    })
    .await;
    assert_eq!(*data.lock().unwrap(), Some(json!("Mr. World")));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn subscribing_and_publishing_multiple_topics() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let (data1, handler1) = capture();
    let (data2, handler2) = capture();
    let (data3, handler3) = capture();
    client.subscribe("set-data", handler1);
    client.subscribe("set-data", handler2);
    client.subscribe("set-data-2", handler3);

    server.publish("set-data", json!("Mr. World"), &[]);
    server.publish("set-data-2", json!("Mr. World"), &[]);

    util::wait_for("all handlers to fire", Duration::from_secs(2), || {
        data1.lock().unwrap().is_some()
            && data2.lock().unwrap().is_some()
            && data3.lock().unwrap().is_some()
    })
    .await;

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn unsubscribing_topic_handlers() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let listener1 = client.subscribe("set-data", |_| Ok(()));
    let _listener2 = client.subscribe("set-data", |_| Ok(()));
    let listener3 = client.subscribe("set-data-2", |_| Ok(()));
    let _listener4 = client.subscribe("set-data-2", |_| Ok(()));

    assert!(client.unsubscribe_handler("set-data", &listener1));
    assert!(!client.unsubscribe_handler("set-data", &listener3));
    assert!(client.unsubscribe("set-data-2"));
    assert!(!client.unsubscribe("set-data-2"));

    assert_eq!(client.topic_handlers("set-data"), 1);
    assert_eq!(client.topic_handlers("set-data-2"), 0);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn publishing_topic_to_specified_clients() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let target = App::connect(client_url(port, "abc").as_str()).await.unwrap();
    let other = App::connect(client_url(port, "xyz").as_str()).await.unwrap();

    let (hit, hit_handler) = capture();
    let (miss, miss_handler) = capture();
    target.subscribe("set-data", hit_handler);
    other.subscribe("set-data", miss_handler);

    util::wait_for("both clients connected", Duration::from_secs(2), || {
        server.clients().len() == 2
    })
    .await;
    assert!(server.publish("set-data", json!("Mr. World"), &["abc".to_owned()]));

    util::wait_for("targeted publish to arrive", Duration::from_secs(2), || {
        hit.lock().unwrap().is_some()
    })
    .await;
    // Best-effort negative: the untargeted client saw nothing.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*miss.lock().unwrap(), None);

    target.close().await;
    other.close().await;
    server.close().await;
}

#[tokio::test]
async fn handler_failures_do_not_stop_later_handlers() {
    util::init_tracing();
    let (server, port) = serve_detail().await;
    let client = App::connect(client_url(port, "c1").as_str()).await.unwrap();

    let reported = Arc::new(AtomicUsize::new(0));
    let reports = reported.clone();
    client.on_error(Arc::new(move |_err| {
        reports.fetch_add(1, Ordering::SeqCst);
        None
    }));

    let (data, ok_handler) = capture();
    client.subscribe("set-data", |_| {
        Err(RpcError::Config("boom in handler".to_owned()))
    });
    client.subscribe("set-data", ok_handler);

    server.publish("set-data", json!("Mr. World"), &[]);
    util::wait_for("second handler to fire", Duration::from_secs(2), || {
        data.lock().unwrap().is_some()
    })
    .await;
    assert_eq!(reported.load(Ordering::SeqCst), 1);

    client.close().await;
    server.close().await;
}
