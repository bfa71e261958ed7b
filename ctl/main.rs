#![forbid(unsafe_code)]

//! `rtcr-ctl`: local CLI companion for `rtcr`.
//!
//! Connects to the IPC socket and sends JSON commands to the supervisor.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "rtcr-ctl",
    about = "Local CLI for the rtcr supervisor",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the supervisor's `ipc_name` config).
    #[arg(long, default_value = "rtcr")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List children and their sessions.
    List,

    /// Suspend every child thread.
    Pause,

    /// Checkpoint paused children.
    Checkpoint,

    /// Continue every child thread.
    Resume,

    /// Pause, checkpoint and resume in one step.
    Cycle,

    /// Dump the last snapshot of a child.
    Snapshot {
        /// Child name.
        child: String,
    },

    /// Translate a badge to its kcap.
    Kcap {
        /// Child name.
        child: String,
        /// Badge to look up.
        badge: u64,
    },
}

fn main() {
    let args = Cli::parse();

    let request_json = match &args.command {
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Pause => serde_json::json!({ "command": "pause" }),
        Command::Checkpoint => serde_json::json!({ "command": "checkpoint" }),
        Command::Resume => serde_json::json!({ "command": "resume" }),
        Command::Cycle => serde_json::json!({ "command": "cycle" }),
        Command::Snapshot { child } => {
            serde_json::json!({ "command": "snapshot", "child": child })
        }
        Command::Kcap { child, badge } => {
            serde_json::json!({ "command": "kcap", "child": child, "badge": badge })
        }
    };

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
            eprintln!("Failed to connect to supervisor: {err}");
            eprintln!("Is rtcr running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
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
