//! End-to-end engine tests over real loopback TCP channels.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use trace_engine::agent::channel::TcpChannelFactory;
use trace_engine::config::AttachConfig;
use trace_engine::models::task::TaskState;

use super::test_helpers::{engine_with, eventually, fast_timings, task_on_port, FakeCompiler};

#[tokio::test]
async fn engine_runs_full_session_against_loopback_agent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let agent = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();

        let mut seen = Vec::new();
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout(Duration::from_secs(5), lines.next_line()).await
        {
            let value: serde_json::Value = serde_json::from_str(&line).expect("json");
            let method = value["method"].as_str().unwrap_or_default().to_owned();
            if method == "instrument" {
                write
                    .write_all(b"{\"method\":\"retransform/start\",\"params\":{\"numClasses\":7}}\n{\"method\":\"success\"}\n")
                    .await
                    .expect("write");
            }
            let done = method == "exit";
            seen.push(method);
            if done {
                break;
            }
        }
        seen
    });

    let factory = Arc::new(TcpChannelFactory::new(AttachConfig {
        cli: "true".into(),
        args: Vec::new(),
        timeout_seconds: 5,
    }));
    let (engine, listener_probe) = engine_with(FakeCompiler::ok(64), factory, fast_timings());
    let task = task_on_port(&engine, 4242, port);

    assert!(engine.start(&task).await);
    assert_eq!(task.state(), TaskState::Running);
    assert_eq!(task.instr_classes(), 7);
    assert!(engine.is_registered(&task));

    assert!(engine.stop(&task).await);
    assert_eq!(task.state(), TaskState::Stopped);
    assert!(!engine.is_registered(&task));

    let seen = agent.await.expect("agent task");
    assert_eq!(seen, vec!["instrument".to_owned(), "exit".to_owned()]);
    assert!(eventually(|| listener_probe.stop_count() == 1).await);
    assert_eq!(listener_probe.start_count(), 1);
}
