//! Toolbrain echo server - reference tool server for local testing.
//!
//! Speaks newline-delimited JSON-RPC 2.0 on stdin/stdout and exposes a few
//! tools that exercise the supervisor: `ping`, `echo`, `fail`, `sleep` and
//! `exit`. Requests are handled concurrently, so a slow `sleep` call does
//! not hold up others. `--hang-list` answers the first `tools/list` and
//! leaves every later one unanswered, which looks like a hung server to a
//! liveness probe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

use toolbrain::mcp_client::types::{error_codes, JsonRpcResponse};

const ALL_TOOLS: [&str; 5] = ["ping", "echo", "fail", "sleep", "exit"];

#[derive(Parser, Debug, Clone)]
#[command(name = "toolbrain-echo-server")]
#[command(about = "Reference tool server speaking JSON-RPC over stdio", long_about = None)]
#[command(version)]
struct Args {
    /// Answer `initialize` with an error
    #[arg(long)]
    fail_handshake: bool,

    /// Stop answering `tools/list` after the handshake
    #[arg(long)]
    hang_list: bool,

    /// Comma-separated subset of tools to expose
    #[arg(long, value_delimiter = ',')]
    tools: Option<Vec<String>>,

    /// Name reported in `serverInfo`
    #[arg(long, default_value = "echo")]
    name: String,
}

impl Args {
    fn exposed_tools(&self) -> Vec<String> {
        match &self.tools {
            Some(tools) => tools
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            None => ALL_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

type SharedStdout = Arc<Mutex<Stdout>>;

/// `tools/list` requests seen so far.
static LIST_CALLS: AtomicUsize = AtomicUsize::new(0);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arc::new(Args::parse());
    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));

    eprintln!("{} ready, tools: {}", args.name, args.exposed_tools().join(","));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("ignoring malformed line: {e}");
                continue;
            }
        };

        // Notifications carry no id and get no reply.
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            continue;
        };
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let args = Arc::clone(&args);
        let stdout = Arc::clone(&stdout);
        tokio::spawn(async move {
            let response = handle(&args, id, &method, params).await;
            if let Err(e) = write_response(&stdout, &response).await {
                eprintln!("write failed: {e}");
            }
        });
    }

    eprintln!("stdin closed, exiting");
    Ok(())
}

async fn handle(args: &Args, id: u64, method: &str, params: Value) -> JsonRpcResponse {
    match method {
        "initialize" if args.fail_handshake => {
            JsonRpcResponse::failure(id, error_codes::INTERNAL_ERROR, "handshake refused")
        }
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": params
                    .get("protocolVersion")
                    .cloned()
                    .unwrap_or(json!("2024-11-05")),
                "capabilities": { "tools": {} },
                "serverInfo": { "name": args.name, "version": env!("CARGO_PKG_VERSION") },
            }),
        ),
        "tools/list" => {
            if LIST_CALLS.fetch_add(1, Ordering::SeqCst) > 0 && args.hang_list {
                eprintln!("hanging on tools/list");
                std::future::pending::<()>().await;
            }
            let tools: Vec<Value> = args
                .exposed_tools()
                .iter()
                .map(|name| tool_definition(name))
                .collect();
            JsonRpcResponse::success(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !args.exposed_tools().iter().any(|t| t == name) {
                return JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("unknown tool: {name}"),
                );
            }
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            JsonRpcResponse::success(id, call_tool(name, &arguments).await)
        }
        other => JsonRpcResponse::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        ),
    }
}

fn tool_definition(name: &str) -> Value {
    let (description, properties) = match name {
        "ping" => ("Reply with pong", json!({})),
        "echo" => (
            "Return the given text, or the arguments as JSON",
            json!({ "text": { "type": "string" } }),
        ),
        "fail" => ("Always report a tool error", json!({})),
        "sleep" => (
            "Wait before replying",
            json!({ "ms": { "type": "integer", "minimum": 0 } }),
        ),
        "exit" => ("Terminate the server process without replying", json!({})),
        _ => ("Custom tool that echoes its arguments", json!({})),
    };
    json!({
        "name": name,
        "description": description,
        "inputSchema": { "type": "object", "properties": properties },
    })
}

fn text_content(text: impl Into<String>) -> Value {
    json!([{ "type": "text", "text": text.into() }])
}

async fn call_tool(name: &str, arguments: &Value) -> Value {
    match name {
        "ping" => json!({ "content": text_content("pong") }),
        "echo" => {
            let text = match arguments.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => arguments.to_string(),
            };
            json!({ "content": text_content(text) })
        }
        "fail" => json!({
            "content": text_content("requested failure"),
            "isError": true,
        }),
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            json!({ "content": text_content(format!("slept {ms}ms")) })
        }
        "exit" => {
            eprintln!("exit requested");
            std::process::exit(3);
        }
        _ => json!({ "content": text_content(arguments.to_string()) }),
    }
}

async fn write_response(stdout: &SharedStdout, response: &JsonRpcResponse) -> Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    let mut out = stdout.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}
