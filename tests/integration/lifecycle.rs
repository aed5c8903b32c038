//! Module lifecycle: init/destroy hook ordering, readiness gating,
//! and failure isolation during teardown.

mod util;

use futures_util::future::BoxFuture;
use muxrpc::{App, Dispatch, Module, RpcError, RpcServer};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use util::SVC_PATH;

type Log = Arc<Mutex<Vec<String>>>;

/// Records its lifecycle transitions into a shared log.
struct TracedService {
    name: &'static str,
    log: Log,
    fail_destroy: bool,
}

impl Module for TracedService {
    fn dispatch(&self, method: &str, _args: Vec<Value>) -> Result<Dispatch, RpcError> {
        match method {
            "ping" => Ok(Dispatch::Value(json!(format!("pong from {}", self.name)))),
            _ => Err(muxrpc::module::unknown_method(self.name, method)),
        }
    }

    fn init(&self) -> BoxFuture<'static, Result<(), RpcError>> {
        let log = self.log.clone();
        let name = self.name;
        Box::pin(async move {
            log.lock().unwrap().push(format!("init:{name}"));
            Ok(())
        })
    }

    fn destroy(&self) -> BoxFuture<'static, Result<(), RpcError>> {
        let log = self.log.clone();
        let name = self.name;
        let fail = self.fail_destroy;
        Box::pin(async move {
            log.lock().unwrap().push(format!("destroy:{name}"));
            if fail {
                Err(RpcError::Config(format!("destroy of {name} failed")))
            } else {
                Ok(())
            }
        })
    }
}

fn traced(name: &'static str, log: &Log, fail_destroy: bool) -> impl Fn() -> TracedService + use<> {
    let log = log.clone();
    move || TracedService {
        name,
        log: log.clone(),
        fail_destroy,
    }
}

#[tokio::test]
async fn init_and_destroy_run_in_registration_order() {
    util::init_tracing();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let server = RpcServer::new(format!("ws://127.0.0.1:0{SVC_PATH}").as_str()).unwrap();
    server.register("services.a", traced("a", &log, false));
    server.register("services.b", traced("b", &log, false));
    server.open(true).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["init:a".to_owned(), "init:b".to_owned()]
    );

    server.close().await;
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "init:a".to_owned(),
            "init:b".to_owned(),
            "destroy:a".to_owned(),
            "destroy:b".to_owned(),
        ]
    );
}

#[tokio::test]
async fn destroy_failures_do_not_stop_later_destroys() {
    util::init_tracing();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let server = RpcServer::new(format!("ws://127.0.0.1:0{SVC_PATH}").as_str()).unwrap();
    server.register("services.a", traced("a", &log, true));
    server.register("services.b", traced("b", &log, false));
    server.open(true).await.unwrap();
    server.close().await;

    let entries = log.lock().unwrap().clone();
    assert!(entries.contains(&"destroy:a".to_owned()));
    assert!(entries.contains(&"destroy:b".to_owned()));
}

#[tokio::test]
async fn serving_without_lifecycle_still_dispatches() {
    util::init_tracing();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let server = RpcServer::new(format!("ws://127.0.0.1:0{SVC_PATH}").as_str()).unwrap();
    server.register("services.a", traced("a", &log, false));
    server.open(false).await.unwrap();
    let port = server.local_addr().unwrap().port();

    // No lifecycle phase ran, yet dispatch is not gated.
    assert!(log.lock().unwrap().is_empty());

    let client = App::connect(util::client_url(port, "c1").as_str())
        .await
        .unwrap();
    let reply = client
        .invoke("services.a", "ping", vec![])
        .result()
        .await
        .unwrap();
    assert_eq!(reply, json!("pong from a"));

    client.close().await;
    server.close().await;
    // Destroy hooks only run when the lifecycle phase was enabled.
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn modules_registered_while_listening_become_ready() {
    util::init_tracing();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let server = RpcServer::new(format!("ws://127.0.0.1:0{SVC_PATH}").as_str()).unwrap();
    server.open(true).await.unwrap();
    let port = server.local_addr().unwrap().port();
    server.register("services.late", traced("late", &log, false));

    let client = App::connect(util::client_url(port, "c1").as_str())
        .await
        .unwrap();
    let reply = client
        .invoke("services.late", "ping", vec![])
        .result()
        .await
        .unwrap();
    assert_eq!(reply, json!("pong from late"));

    client.close().await;
    server.close().await;
}
