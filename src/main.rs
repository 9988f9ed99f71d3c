mod backup;
mod calc;
mod db;
mod formula;
mod grading;
mod ipc;

use std::io::{self, BufRead, Write};
use std::time::Instant;

const LOG_ENV: &str = "ASSESSD_LOG";

// stdout carries the protocol, so logs go to stderr.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("assessd=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn main() {
    init_logging();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "assessd started");

    let mut state = ipc::AppState::default();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => {
                let method = req.method.clone();
                let started = Instant::now();
                let resp = ipc::handle_request(&mut state, req);
                tracing::debug!(
                    method = %method,
                    ok = resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request handled"
                );
                resp
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                ipc::err("", "bad_json", e.to_string(), None)
            }
        };

        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    tracing::info!("stdin closed, exiting");
}
