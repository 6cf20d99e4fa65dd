#![forbid(unsafe_code)]

//! `trace-engine-ctl`: local CLI companion for `trace-engine`.
//!
//! Connects to the IPC socket, sends one JSON command, and prints the
//! server's response.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "trace-engine-ctl",
    about = "Local CLI for the trace-engine server",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name`).
    #[arg(long, default_value = "trace-engine")]
    ipc_name: String,

    /// File holding the server's auth token.
    #[arg(long)]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List tracked tasks.
    List,

    /// Compile a script and attach it to a process.
    Start {
        /// Target process id.
        pid: u32,
        /// Script source file.
        script: PathBuf,
        /// Classpath entry; repeatable.
        #[arg(long = "classpath", short = 'c')]
        classpath: Vec<PathBuf>,
        /// Compile in unsafe mode.
        #[arg(long = "unsafe")]
        unsafe_mode: bool,
        /// Task property as `key=value`; repeatable.
        #[arg(long = "property", short = 'D', value_parser = parse_property)]
        properties: Vec<(String, String)>,
        /// Arguments passed to the script.
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Stop a running task.
    Stop {
        /// Task id.
        task_id: String,
    },

    /// Fire an event in a running task.
    Event {
        /// Task id.
        task_id: String,
        /// Event name; omitted fires the anonymous event.
        name: Option<String>,
    },
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn main() {
    let args = Cli::parse();

    let mut request_json = match build_request(&args.command) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(2);
        }
    };

    if let Some(ref path) = args.token_file {
        match std::fs::read_to_string(path) {
            Ok(token) => {
                request_json["auth_token"] = serde_json::Value::String(token.trim().to_owned());
            }
            Err(err) => {
                eprintln!("Failed to read token file {}: {err}", path.display());
                std::process::exit(2);
            }
        }
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is trace-engine running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

fn build_request(command: &Command) -> std::io::Result<serde_json::Value> {
    let request = match command {
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Start {
            pid,
            script,
            classpath,
            unsafe_mode,
            properties,
            args,
        } => {
            let source = std::fs::read_to_string(script)?;
            let properties: HashMap<&str, &str> = properties
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            serde_json::json!({
                "command": "start",
                "pid": pid,
                "script": source,
                "classpath": classpath,
                "unsafe": unsafe_mode,
                "properties": properties,
                "args": args,
            })
        }
        Command::Stop { task_id } => serde_json::json!({ "command": "stop", "task_id": task_id }),
        Command::Event { task_id, name } => {
            serde_json::json!({ "command": "event", "task_id": task_id, "name": name })
        }
    };
    Ok(request)
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
