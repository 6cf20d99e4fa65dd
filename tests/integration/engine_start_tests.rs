//! Integration tests for the engine start sequence against scripted agents.

use std::time::Duration;

use trace_engine::models::command::AgentCommand;
use trace_engine::models::task::{TaskEvent, TaskState};

use super::test_helpers::{
    engine_with, eventually, fast_timings, ready_sequence, task_on_port, ChannelPlan,
    FakeCompiler, ScriptedFactory, SubmitScript,
};

#[tokio::test]
async fn ready_agent_starts_and_registers_task() {
    let compiler = FakeCompiler::ok(512);
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![SubmitScript::hold(
        ready_sequence(3),
    )])]);
    let (engine, listener) = engine_with(compiler.clone(), factory.clone(), fast_timings());
    let task = task_on_port(&engine, 1234, 41000);

    assert!(engine.start(&task).await);

    assert_eq!(task.state(), TaskState::Running);
    assert_eq!(task.instr_classes(), 3);
    assert!(engine.is_registered(&task));
    assert_eq!(listener.start_count(), 1);
    assert_eq!(listener.stop_count(), 0);

    let channel = factory.channel(0);
    assert_eq!(channel.endpoint_port(), 41000);
    assert_eq!(channel.entries(), vec!["attach".to_owned(), "submit:512".to_owned()]);

    let attach = channel.last_attach.lock().unwrap().clone().expect("attached");
    assert_eq!(attach.pid, 1234);
    assert!(attach.agent_path.ends_with("trace-agent.jar"));
}

#[tokio::test]
async fn state_transitions_are_published_in_order() {
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![SubmitScript::hold(
        ready_sequence(2),
    )])]);
    let (engine, _listener) = engine_with(FakeCompiler::ok(16), factory, fast_timings());
    let task = task_on_port(&engine, 1234, 41000);
    let mut events = task.subscribe();

    assert!(engine.start(&task).await);

    let mut states = Vec::new();
    let mut commands = Vec::new();
    while commands.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event arrives")
            .expect("event channel open");
        match event {
            TaskEvent::StateChanged(state) => states.push(state),
            TaskEvent::Command(command) => commands.push(command),
            TaskEvent::Diagnostic(_) => {}
        }
    }

    assert_eq!(
        states,
        vec![
            TaskState::Compiling,
            TaskState::Compiled,
            TaskState::Instrumenting,
            TaskState::Running
        ]
    );
    assert_eq!(commands, ready_sequence(2), "every command is forwarded");
}

#[tokio::test]
async fn compile_failure_reports_diagnostics_and_returns_false() {
    let compiler = FakeCompiler::failing(&["line 1: unexpected token"]);
    let factory = ScriptedFactory::new(Vec::new());
    let (engine, listener) = engine_with(compiler, factory.clone(), fast_timings());
    let task = task_on_port(&engine, 1234, 41000);
    let mut events = task.subscribe();

    assert!(!engine.start(&task).await);

    assert_eq!(task.state(), TaskState::Compiling, "no advance past compiling");
    assert_eq!(factory.opened_count(), 0, "no channel is opened");
    assert_eq!(listener.start_count(), 0);

    let mut diagnostics = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TaskEvent::Diagnostic(line) = event {
            diagnostics.push(line);
        }
    }
    assert!(diagnostics.contains(&"line 1: unexpected token".to_owned()));
}

#[tokio::test]
async fn attach_failure_returns_false_without_registration() {
    let factory = ScriptedFactory::new(vec![ChannelPlan {
        fail_attach: true,
        ..ChannelPlan::default()
    }]);
    let (engine, listener) = engine_with(FakeCompiler::ok(64), factory.clone(), fast_timings());
    let task = task_on_port(&engine, 1234, 41000);

    assert!(!engine.start(&task).await);

    assert_eq!(task.state(), TaskState::Compiled);
    assert!(!engine.is_registered(&task));
    assert_eq!(listener.start_count(), 0);
    assert_eq!(factory.channel(0).count("submit"), 0, "submit never runs");
}

#[tokio::test]
async fn submit_failure_closes_the_fresh_channel() {
    let factory = ScriptedFactory::new(vec![ChannelPlan {
        fail_submit: true,
        ..ChannelPlan::default()
    }]);
    let (engine, listener) = engine_with(FakeCompiler::ok(64), factory.clone(), fast_timings());
    let task = task_on_port(&engine, 1234, 41000);

    assert!(!engine.start(&task).await);

    assert!(!engine.is_registered(&task));
    assert_eq!(listener.start_count(), 0);
    assert_eq!(factory.channel(0).count("close"), 1);
}

#[tokio::test]
async fn exit_before_ready_runs_stop_and_returns_false() {
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![
        SubmitScript::disconnect(vec![AgentCommand::Exit { code: 1 }]),
    ])]);
    let (engine, listener) = engine_with(FakeCompiler::ok(64), factory.clone(), fast_timings());
    let task = task_on_port(&engine, 1234, 41000);

    assert!(!engine.start(&task).await);

    assert!(eventually(|| listener.stop_count() == 1).await, "stop sequence ran");
    assert_eq!(task.state(), TaskState::Stopped);
    assert!(!engine.is_registered(&task));
    assert_eq!(listener.start_count(), 0);

    let channel = factory.channel(0);
    assert!(eventually(|| channel.count("close") == 1).await);
    assert_eq!(channel.count("exit"), 0, "nothing registered to send exit to");
}

#[tokio::test]
async fn compile_ack_alone_is_not_ready() {
    let mut timings = fast_timings();
    timings.ready_timeout_seconds = 1;
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![SubmitScript::hold(vec![
        AgentCommand::Success,
        AgentCommand::Message { text: "loaded".into() },
    ])])]);
    let (engine, listener) = engine_with(FakeCompiler::ok(64), factory, timings);
    let task = task_on_port(&engine, 1234, 41000);

    let started = tokio::time::timeout(Duration::from_secs(5), engine.start(&task))
        .await
        .expect("ready timeout bounds the wait");

    assert!(!started);
    assert!(!engine.is_registered(&task));
    assert_eq!(listener.start_count(), 0);
}

#[tokio::test]
async fn late_ready_after_timeout_is_not_registered() {
    let mut timings = fast_timings();
    timings.ready_timeout_seconds = 1;
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![SubmitScript::hold(
        Vec::new(),
    )])]);
    let (engine, _listener) = engine_with(FakeCompiler::ok(64), factory.clone(), timings);
    let task = task_on_port(&engine, 1234, 41000);

    assert!(!engine.start(&task).await);
    let channel = factory.channel(0);
    assert_eq!(channel.count("close"), 0, "session still waiting");

    for command in ready_sequence(2) {
        channel.inject(command).await;
    }

    assert!(eventually(|| channel.count("close") == 1).await, "late session is closed");
    assert!(!engine.is_registered(&task));
    assert_ne!(task.state(), TaskState::Running);
}

#[tokio::test]
async fn resubmit_reuses_registered_channel() {
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![
        SubmitScript::hold(ready_sequence(3)),
        SubmitScript::hold(ready_sequence(5)),
    ])]);
    let (engine, listener) = engine_with(FakeCompiler::ok(128), factory.clone(), fast_timings());
    let task = task_on_port(&engine, 1234, 41000);

    assert!(engine.start(&task).await);
    assert!(engine.start(&task).await);

    assert_eq!(factory.opened_count(), 1, "second start reuses the channel");
    assert_eq!(task.instr_classes(), 5);
    assert!(engine.is_registered(&task));
    assert_eq!(listener.start_count(), 2);
    assert_eq!(listener.stop_count(), 0, "replaced session queue is not a disconnect");
    assert_eq!(factory.channel(0).count("submit"), 2);
}

#[tokio::test]
async fn lost_connection_after_ready_stops_the_task() {
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![
        SubmitScript::disconnect(ready_sequence(1)),
    ])]);
    let (engine, listener) = engine_with(FakeCompiler::ok(64), factory, fast_timings());
    let task = task_on_port(&engine, 1234, 41000);

    assert!(engine.start(&task).await);

    assert!(eventually(|| listener.stop_count() == 1).await);
    assert_eq!(task.state(), TaskState::Stopped);
    assert!(!engine.is_registered(&task));
    assert_eq!(listener.start_count(), 1);
}

#[tokio::test]
async fn allocated_port_is_used_without_override() {
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![SubmitScript::hold(
        ready_sequence(1),
    )])]);
    let (engine, _listener) = engine_with(FakeCompiler::ok(8), factory.clone(), fast_timings());
    let task = engine.create_task(1234).expect("eligible");
    task.set_script("trace { }");

    assert!(engine.start(&task).await);
    assert_ne!(factory.channel(0).endpoint_port(), 0);
}

#[tokio::test]
async fn compile_request_carries_task_inputs() {
    let compiler = FakeCompiler::ok(8);
    let factory = ScriptedFactory::new(vec![ChannelPlan::scripts(vec![SubmitScript::hold(
        ready_sequence(1),
    )])]);
    let (engine, _listener) = engine_with(compiler.clone(), factory, fast_timings());
    let task = task_on_port(&engine, 1234, 41000);
    task.set_classpath(vec!["/app/classes".into()]);
    task.set_unsafe(true);

    assert!(engine.start(&task).await);

    let request = compiler.last_request.lock().unwrap().clone().expect("compiled");
    assert!(request.script.contains("onEntry"));
    assert_eq!(request.classpath, vec![std::path::PathBuf::from("/app/classes")]);
    assert!(request.unsafe_mode);
    assert_eq!(request.aux_classpath, None, "no toolchain properties available");
}

#[tokio::test]
async fn racing_starts_close_the_replaced_channel() {
    let factory = ScriptedFactory::new(vec![
        ChannelPlan::scripts(vec![SubmitScript::hold(Vec::new())]),
        ChannelPlan::scripts(vec![SubmitScript::hold(Vec::new())]),
    ]);
    let (engine, _listener) = engine_with(FakeCompiler::ok(16), factory.clone(), fast_timings());
    let task = task_on_port(&engine, 1234, 41000);

    let spawn_start = || {
        let engine = engine.clone();
        let task = task.clone();
        tokio::spawn(async move { engine.start(&task).await })
    };
    let first = spawn_start();
    let second = spawn_start();
    assert!(
        eventually(|| factory.opened_count() == 2
            && factory.channel(0).count("submit") == 1
            && factory.channel(1).count("submit") == 1)
        .await,
        "both starts opened a fresh channel"
    );

    for command in ready_sequence(1) {
        factory.channel(0).inject(command).await;
    }
    assert!(first.await.expect("first start"));
    for command in ready_sequence(2) {
        factory.channel(1).inject(command).await;
    }
    assert!(second.await.expect("second start"));

    assert!(eventually(|| factory.channel(0).count("close") == 1).await);
    assert_eq!(factory.channel(1).count("close"), 0);
    assert!(engine.is_registered(&task));
}
