//! Integration tests for IPC command dispatch and authentication.

use std::sync::Arc;

use trace_engine::ipc::server::dispatch_line;
use trace_engine::ipc::state::AppState;

use tokio::sync::Notify;

use super::test_helpers::{
    engine_with, eventually, fast_timings, ready_sequence, ChannelPlan, FakeCompiler,
    ScriptedFactory, SubmitScript,
};

const TOKEN: &str = "secret-token";

fn state_with(factory: Arc<ScriptedFactory>) -> AppState {
    let (engine, _listener) = engine_with(FakeCompiler::ok(32), factory, fast_timings());
    AppState::new(engine, "trace-test".into(), Some(TOKEN.into()))
}

fn request(body: serde_json::Value) -> String {
    let mut body = body;
    body["auth_token"] = TOKEN.into();
    body.to_string()
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let state = state_with(ScriptedFactory::new(Vec::new()));
    let response = dispatch_line(&state, r#"{"command":"list"}"#).await;
    assert!(!response.ok);
    assert!(response.error.expect("error").starts_with("unauthorized"));
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let state = state_with(ScriptedFactory::new(Vec::new()));
    let response = dispatch_line(&state, r#"{"command":"list","auth_token":"nope"}"#).await;
    assert!(!response.ok);
}

#[tokio::test]
async fn invalid_json_is_reported() {
    let state = state_with(ScriptedFactory::new(Vec::new()));
    let response = dispatch_line(&state, "{not json").await;
    assert!(!response.ok);
    assert!(response.error.expect("error").contains("invalid json"));
}

#[tokio::test]
async fn unknown_command_is_reported() {
    let state = state_with(ScriptedFactory::new(Vec::new()));
    let response = dispatch_line(&state, &request(serde_json::json!({"command": "pause"}))).await;
    assert!(!response.ok);
    assert!(response.error.expect("error").contains("unknown command: pause"));
}

#[tokio::test]
async fn start_list_event_stop_round_trip() {
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![SubmitScript::hold(
        ready_sequence(4),
    )])]);
    let state = state_with(factory.clone());

    let started = dispatch_line(
        &state,
        &request(serde_json::json!({
            "command": "start",
            "pid": 4242,
            "script": "trace { }",
            "properties": {"agent.port": "41000"},
        })),
    )
    .await;
    assert!(started.ok, "start failed: {:?}", started.error);
    let data = started.data.expect("data");
    assert_eq!(data["state"], "running");
    assert_eq!(data["instr_classes"], 4);
    assert_eq!(data["registered"], true);
    let task_id = data["task_id"].as_str().expect("task id").to_owned();
    assert_eq!(factory.channel(0).endpoint_port(), 41000);

    let listed = dispatch_line(&state, &request(serde_json::json!({"command": "list"}))).await;
    let tasks = listed.data.expect("data")["tasks"].clone();
    assert_eq!(tasks.as_array().map(Vec::len), Some(1));
    assert_eq!(tasks[0]["pid"], 4242);

    let event = dispatch_line(
        &state,
        &request(serde_json::json!({"command": "event", "task_id": task_id, "name": "dump"})),
    )
    .await;
    assert!(event.ok);
    assert_eq!(factory.channel(0).count("event:dump"), 1);

    let stopped = dispatch_line(
        &state,
        &request(serde_json::json!({"command": "stop", "task_id": task_id})),
    )
    .await;
    assert!(stopped.ok);
    assert_eq!(stopped.data.expect("data")["state"], "stopped");

    let listed = dispatch_line(&state, &request(serde_json::json!({"command": "list"}))).await;
    assert_eq!(listed.data.expect("data")["tasks"], serde_json::json!([]));
}

#[tokio::test]
async fn failed_start_is_reported_and_forgotten() {
    let factory = ScriptedFactory::new(vec![ChannelPlan {
        fail_attach: true,
        ..ChannelPlan::default()
    }]);
    let state = state_with(factory);

    let response = dispatch_line(
        &state,
        &request(serde_json::json!({"command": "start", "pid": 4242, "script": "trace { }"})),
    )
    .await;
    assert!(!response.ok);
    assert!(response.error.expect("error").contains("failed to start"));
    assert!(state.tasks.snapshot().is_empty());
}

#[tokio::test]
async fn start_requires_pid_and_script() {
    let state = state_with(ScriptedFactory::new(Vec::new()));

    let no_pid = dispatch_line(
        &state,
        &request(serde_json::json!({"command": "start", "script": "x"})),
    )
    .await;
    assert!(no_pid.error.expect("error").contains("'pid'"));

    let no_script = dispatch_line(
        &state,
        &request(serde_json::json!({"command": "start", "pid": 1})),
    )
    .await;
    assert!(no_script.error.expect("error").contains("'script'"));
}

#[tokio::test]
async fn stop_unknown_task_is_not_found() {
    let state = state_with(ScriptedFactory::new(Vec::new()));
    let response = dispatch_line(
        &state,
        &request(serde_json::json!({"command": "stop", "task_id": "missing"})),
    )
    .await;
    assert!(response.error.expect("error").starts_with("not found"));
}

#[tokio::test]
async fn stop_all_stops_registered_tasks() {
    let factory = ScriptedFactory::new(vec![
        ChannelPlan::scripts(vec![SubmitScript::hold(ready_sequence(1))]),
        ChannelPlan::scripts(vec![SubmitScript::hold(ready_sequence(1))]),
    ]);
    let state = state_with(factory.clone());

    for (pid, port) in [(1001, "41001"), (1002, "41002")] {
        let response = dispatch_line(
            &state,
            &request(serde_json::json!({
                "command": "start",
                "pid": pid,
                "script": "trace { }",
                "properties": {"agent.port": port},
            })),
        )
        .await;
        assert!(response.ok);
    }

    assert_eq!(state.stop_all().await, 2);
    assert!(state.engine.registered_task_ids().is_empty());
    assert_eq!(factory.channel(0).count("close"), 1);
    assert_eq!(factory.channel(1).count("close"), 1);
}

fn gated_pair(gate: &Arc<Notify>) -> Arc<ScriptedFactory> {
    ScriptedFactory::new(vec![
        ChannelPlan {
            exit_gate: Some(Arc::clone(gate)),
            ..ChannelPlan::scripts(vec![SubmitScript::hold(ready_sequence(1))])
        },
        ChannelPlan::scripts(vec![SubmitScript::hold(ready_sequence(1))]),
    ])
}

async fn start_over_ipc(state: &AppState, pid: u32, port: &str) -> String {
    let response = dispatch_line(
        state,
        &request(serde_json::json!({
            "command": "start",
            "pid": pid,
            "script": "trace { }",
            "properties": {"agent.port": port},
        })),
    )
    .await;
    assert!(response.ok, "start failed: {:?}", response.error);
    response.data.expect("data")["task_id"]
        .as_str()
        .expect("task id")
        .to_owned()
}

#[tokio::test]
async fn stop_losing_the_gate_keeps_task_tracked() {
    let gate = Arc::new(Notify::new());
    let factory = gated_pair(&gate);
    let state = Arc::new(state_with(factory.clone()));
    let first = start_over_ipc(&state, 1001, "41001").await;
    let second = start_over_ipc(&state, 1002, "41002").await;

    let stopping = {
        let state = Arc::clone(&state);
        let first = first.clone();
        tokio::spawn(async move {
            dispatch_line(
                &state,
                &request(serde_json::json!({"command": "stop", "task_id": first})),
            )
            .await
        })
    };
    let blocked = factory.channel(0);
    assert!(eventually(|| blocked.count("exit") == 1).await, "first stop holds the gate");

    let refused = dispatch_line(
        &state,
        &request(serde_json::json!({"command": "stop", "task_id": second})),
    )
    .await;
    assert!(!refused.ok);
    assert!(refused.error.expect("error").contains("retry"));
    assert!(state.tasks.get(&second).is_some(), "task stays addressable");

    gate.notify_one();
    assert!(stopping.await.expect("stop task").ok);

    let retried = dispatch_line(
        &state,
        &request(serde_json::json!({"command": "stop", "task_id": second})),
    )
    .await;
    assert!(retried.ok, "retry failed: {:?}", retried.error);
    assert!(state.engine.registered_task_ids().is_empty());
    assert_eq!(factory.channel(1).count("close"), 1);
}

#[tokio::test]
async fn stop_all_waits_out_an_in_flight_stop() {
    let gate = Arc::new(Notify::new());
    let factory = gated_pair(&gate);
    let state = Arc::new(state_with(factory.clone()));
    let first = start_over_ipc(&state, 1001, "41001").await;
    let second = start_over_ipc(&state, 1002, "41002").await;

    let stopping = {
        let engine = state.engine.clone();
        let task = state.tasks.get(&first).expect("tracked");
        tokio::spawn(async move { engine.stop(&task).await })
    };
    let blocked = factory.channel(0);
    assert!(eventually(|| blocked.count("exit") == 1).await, "first stop holds the gate");

    let shutdown = {
        let state = Arc::clone(&state);
        tokio::spawn(async move { state.stop_all().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(state.engine.is_registered(&state.tasks.get(&second).expect("tracked")));

    gate.notify_one();
    assert!(stopping.await.expect("stop task"));
    assert_eq!(shutdown.await.expect("shutdown task"), 1);
    assert!(state.engine.registered_task_ids().is_empty());
    assert!(state.tasks.get(&second).is_none());
    assert_eq!(factory.channel(1).count("close"), 1);
}
