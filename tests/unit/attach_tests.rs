//! Unit tests for attach option rendering and attach tool invocation.

use std::path::PathBuf;

use trace_engine::agent::attach::{render_agent_options, render_attach_args, run_attach};
use trace_engine::config::{AttachConfig, TraceSettings};
use trace_engine::driver::{AttachRequest, Endpoint};
use trace_engine::AppError;

fn request() -> AttachRequest {
    AttachRequest {
        pid: 1234,
        agent_path: PathBuf::from("/opt/trace/trace-agent.jar"),
        aux_classpath: None,
        unsafe_mode: false,
        extra_options: None,
    }
}

#[test]
fn renders_minimal_options() {
    let options = render_agent_options(&Endpoint::local(41000), &TraceSettings::default(), &request());
    assert_eq!(options, "port=41000,debug=false,unsafe=false,dumpClasses=false");
}

#[test]
fn renders_dump_dir_aux_and_extras() {
    let settings = TraceSettings {
        debug: true,
        dump_classes: true,
        dump_class_path: Some(PathBuf::from("/tmp/dump")),
    };
    let mut req = request();
    req.unsafe_mode = true;
    req.aux_classpath = Some(PathBuf::from("/jdk/lib/tools.jar"));
    req.extra_options = Some(" noServer=true ".into());

    let options = render_agent_options(&Endpoint::local(7), &settings, &req);
    assert_eq!(
        options,
        "port=7,debug=true,unsafe=true,dumpClasses=true,dumpDir=/tmp/dump,\
         systemClassPath=/jdk/lib/tools.jar,noServer=true"
    );
}

#[test]
fn dump_dir_is_omitted_when_dumping_is_off() {
    let settings = TraceSettings {
        debug: false,
        dump_classes: false,
        dump_class_path: Some(PathBuf::from("/tmp/dump")),
    };
    let options = render_agent_options(&Endpoint::local(7), &settings, &request());
    assert!(!options.contains("dumpDir"));
}

#[test]
fn substitutes_every_placeholder() {
    let template: Vec<String> = ["{pid}", "load", "{agent}={options}", "--port={port}", "{aux}"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();

    let args = render_attach_args(&template, &Endpoint::local(41000), &TraceSettings::default(), &request());

    assert_eq!(args[0], "1234");
    assert_eq!(args[1], "load");
    assert!(args[2].starts_with("/opt/trace/trace-agent.jar=port=41000,"));
    assert_eq!(args[3], "--port=41000");
    assert_eq!(args[4], "", "missing aux renders empty");
}

#[cfg(unix)]
#[tokio::test]
async fn successful_tool_exit_attaches() {
    let config = AttachConfig {
        cli: "true".into(),
        args: vec!["{pid}".into()],
        timeout_seconds: 5,
    };
    run_attach(&config, &Endpoint::local(41000), &TraceSettings::default(), &request())
        .await
        .expect("attach succeeds");
}

#[cfg(unix)]
#[tokio::test]
async fn failing_tool_is_an_attach_error() {
    let config = AttachConfig {
        cli: "false".into(),
        args: Vec::new(),
        timeout_seconds: 5,
    };
    let err = run_attach(&config, &Endpoint::local(41000), &TraceSettings::default(), &request())
        .await
        .expect_err("non-zero exit");
    assert!(matches!(err, AppError::Attach(ref msg) if msg.contains("exited with")));
}

#[tokio::test]
async fn missing_tool_is_an_attach_error() {
    let config = AttachConfig {
        cli: "/nonexistent/attach-tool".into(),
        args: Vec::new(),
        timeout_seconds: 5,
    };
    let err = run_attach(&config, &Endpoint::local(41000), &TraceSettings::default(), &request())
        .await
        .expect_err("spawn fails");
    assert!(matches!(err, AppError::Attach(ref msg) if msg.contains("failed to spawn")));
}
