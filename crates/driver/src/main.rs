//! Standalone driver binary (§5 ambient addition): connects to the device
//! over the configured transport, wires up the dispatcher, job engine and
//! MMM engine, and serves one [`Client`] against newline-delimited JSON on
//! stdio. The real external client is the excluded websocket façade; this
//! loop is the in-process stand-in the test binary and local tooling drive
//! instead.

mod cache;
mod client;
mod codec;
mod config;
mod dispatcher;
mod error;
mod graph;
mod jobs;
mod mmm;
mod transport_impl;

use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use shared::protocol::{BleProtocol, ClassicProtocol, MessageProtocol};
use shared::rpc::{DriverRequest, DriverResponse, ProgressUpdate};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use client::Client;
use config::{Cli, TransportKind};
use dispatcher::spawn_dispatcher;
use jobs::spawn_job_engine;
use transport_impl::{spawn_hid_transport, spawn_stream_transport};

/// Export file schema version stamped into every export this binary writes.
const BUNDLE_VERSION: u32 = 1;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), DriverBinError> {
    let cli = Cli::parse();
    let config = cli.driver_config();
    let failure_threshold = config.mmm_failure_threshold;

    let stream = UnixStream::connect(&cli.socket_path).await?;
    let (dispatcher, sizes, limits) = match cli.transport {
        TransportKind::Hid => {
            let (writer, events) = spawn_hid_transport(stream);
            let protocol: Arc<dyn MessageProtocol> = Arc::new(ClassicProtocol);
            let sizes = protocol.node_sizes();
            let limits = protocol.limits();
            (spawn_dispatcher(writer, events, protocol, config), sizes, limits)
        }
        TransportKind::Stream => {
            let (writer, events) = spawn_stream_transport(stream);
            let protocol: Arc<dyn MessageProtocol> = Arc::new(BleProtocol);
            let sizes = protocol.node_sizes();
            let limits = protocol.limits();
            (spawn_dispatcher(writer, events, protocol, config), sizes, limits)
        }
    };

    let jobs = spawn_job_engine(dispatcher.clone());
    let mut client = Client::new(dispatcher, jobs, sizes, limits, failure_threshold, BUNDLE_VERSION);

    run_stdio_loop(&mut client).await
}

/// One line of stdout output: either a progress tick for a still-running
/// request, or its final response. `reqid` lets a caller multiplex several
/// in-flight requests over the one stream (MMM sessions and the job-engine
/// chunked [`DriverRequest::GetRandom`] notwithstanding, only one request is
/// actually processed at a time by this loop).
#[derive(Debug, Serialize)]
#[serde(tag = "kind")]
enum OutputLine {
    Progress {
        reqid: String,
        update: ProgressUpdate,
    },
    Response {
        reqid: String,
        response: DriverResponse,
    },
}

async fn run_stdio_loop(client: &mut Client) -> Result<(), DriverBinError> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: DriverRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(error) => {
                write_line(&mut stdout, &format!("{{\"kind\":\"ParseError\",\"detail\":{:?}}}", error.to_string())).await?;
                continue;
            }
        };
        let reqid = request.reqid().to_string();

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let response = client
            .handle(request, |update| {
                let _ = progress_tx.send(update);
            })
            .await;
        drop(progress_tx);

        while let Ok(update) = progress_rx.try_recv() {
            let line = OutputLine::Progress {
                reqid: reqid.clone(),
                update,
            };
            write_line(&mut stdout, &serde_json::to_string(&line)?).await?;
        }

        let line = OutputLine::Response { reqid, response };
        write_line(&mut stdout, &serde_json::to_string(&line)?).await?;
    }
    Ok(())
}

async fn write_line(stdout: &mut (impl AsyncWriteExt + Unpin), line: &str) -> Result<(), DriverBinError> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum DriverBinError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}
