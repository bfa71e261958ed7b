//! Control socket round trips against a live server task.

use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;

use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde_json::{json, Value};
use serial_test::serial;

use rtcr::ipc::server::{spawn_ipc_server, ControlState};
use rtcr::kernel::sim::SimKernel;
use rtcr::GlobalConfig;

use super::test_helpers::Harness;

fn send_line(ipc_name: &str, line: &str) -> Value {
    let name = ipc_name
        .to_ns_name::<GenericNamespaced>()
        .expect("valid socket name");
    let mut stream = Stream::connect(name).expect("connect");
    stream
        .write_all(format!("{line}\n").as_bytes())
        .expect("write request");
    stream.flush().expect("flush");

    let mut reader = BufReader::new(&stream);
    let mut response = String::new();
    reader.read_line(&mut response).expect("read response");
    serde_json::from_str(response.trim()).expect("json response")
}

async fn send(ipc_name: &str, request: Value) -> Value {
    let ipc_name = ipc_name.to_owned();
    tokio::task::spawn_blocking(move || send_line(&ipc_name, &request.to_string()))
        .await
        .expect("client task")
}

async fn send_raw(ipc_name: &str, line: &str) -> Value {
    let ipc_name = ipc_name.to_owned();
    let line = line.to_owned();
    tokio::task::spawn_blocking(move || send_line(&ipc_name, &line))
        .await
        .expect("client task")
}

fn error_of(response: &Value) -> &str {
    assert_eq!(response["ok"], json!(false), "expected failure: {response}");
    response["error"].as_str().expect("error message")
}

fn data_of(response: &Value) -> &Value {
    assert_eq!(response["ok"], json!(true), "expected success: {response}");
    &response["data"]
}

fn harness(tag: &str) -> (Harness, String) {
    let ipc_name = format!("rtcr-test-{}-{tag}", std::process::id());
    let config = GlobalConfig {
        ipc_name: ipc_name.clone(),
        ..GlobalConfig::default()
    };
    (Harness::with(SimKernel::new(), config), ipc_name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn commands_drive_the_checkpointer() {
    let (h, ipc_name) = harness("flow");
    let _child = h.launch("app", 1, 1);
    let pd_badge = h.child("app").pd().expect("pd").badge();
    let state = Arc::new(ControlState {
        supervisor: Arc::clone(&h.supervisor),
        checkpointer: Arc::clone(&h.checkpointer),
    });
    let server = spawn_ipc_server(state, h.ct.clone()).expect("server starts");

    let list = send(&ipc_name, json!({ "command": "list" })).await;
    let data = data_of(&list);
    assert_eq!(data["epoch"], json!(0));
    assert_eq!(data["mode"], json!("sequential"));
    assert_eq!(data["children"][0]["child"], json!("app"));
    assert_eq!(data["children"][0]["bootstrapping"], json!(false));
    let sessions = data["children"][0]["sessions"]
        .as_array()
        .expect("session list");
    assert!(sessions.contains(&json!("PD")));
    assert!(sessions.contains(&json!("Timer")));

    let idle = send(&ipc_name, json!({ "command": "checkpoint" })).await;
    assert!(error_of(&idle).starts_with("invalid state:"));

    let paused = send(&ipc_name, json!({ "command": "pause" })).await;
    assert_eq!(data_of(&paused)["status"], json!("paused"));
    let report = send(&ipc_name, json!({ "command": "checkpoint" })).await;
    assert_eq!(data_of(&report)["epoch"], json!(1));
    let resumed = send(&ipc_name, json!({ "command": "resume" })).await;
    assert_eq!(data_of(&resumed)["status"], json!("resumed"));

    let cycle = send(&ipc_name, json!({ "command": "cycle" })).await;
    let data = data_of(&cycle);
    assert_eq!(data["epoch"], json!(2));
    assert_eq!(data["children"][0]["child"], json!("app"));

    let snapshot = send(&ipc_name, json!({ "command": "snapshot", "child": "app" })).await;
    let data = data_of(&snapshot);
    assert_eq!(data["child"], json!("app"));
    assert_eq!(data["threads"].as_array().map(Vec::len), Some(1));

    let kcap = send(
        &ipc_name,
        json!({ "command": "kcap", "child": "app", "badge": pd_badge.raw() }),
    )
    .await;
    let data = data_of(&kcap);
    assert_eq!(data["kcap"], json!(1 << 12));
    assert_eq!(data["valid"], json!(true));

    h.ct.cancel();
    server.await.expect("server task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn malformed_requests_are_rejected() {
    let (h, ipc_name) = harness("errors");
    let state = Arc::new(ControlState {
        supervisor: Arc::clone(&h.supervisor),
        checkpointer: Arc::clone(&h.checkpointer),
    });
    let server = spawn_ipc_server(state, h.ct.clone()).expect("server starts");

    let unknown = send(&ipc_name, json!({ "command": "bogus" })).await;
    assert_eq!(error_of(&unknown), "unknown command: bogus");

    let missing = send(&ipc_name, json!({ "command": "snapshot" })).await;
    assert_eq!(error_of(&missing), "missing required 'child' field");

    let missing = send(&ipc_name, json!({ "command": "kcap", "child": "app" })).await;
    assert_eq!(error_of(&missing), "missing required 'badge' field");

    let ghost = send(&ipc_name, json!({ "command": "snapshot", "child": "ghost" })).await;
    assert_eq!(error_of(&ghost), "not found: child 'ghost'");

    let garbage = send_raw(&ipc_name, "{not json").await;
    assert!(error_of(&garbage).starts_with("invalid json:"));

    h.ct.cancel();
    server.await.expect("server task");
}
