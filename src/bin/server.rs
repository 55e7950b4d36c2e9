//! shttp demo server
//!
//! Answers every request on an `"http"` channel with `Hello, world!`.
//!
//! Usage:
//!   shttp-server [--address 127.0.0.1:8080] [--identity FILE] [--config FILE]

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use shttp::{Connection, ListenOptions, ListenSettings, Listener};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const REPLY: &[u8] = b"Hello, world!";

/// shttp demo server
#[derive(Parser)]
#[command(name = "shttp-server")]
#[command(about = "Serve a hello-world HTTP response over shttp")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Host identity file (PKCS#8); created if missing, throwaway if omitted
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// JSON listener settings
    #[arg(short, long)]
    config: Option<PathBuf>,
}

async fn handle(mut conn: Connection) {
    let (head, _body) = match common::read_head(&mut conn).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(error = %e, "Invalid request");
            return;
        }
    };

    let request_line = head.lines().next().unwrap_or_default();
    info!(
        request = %request_line,
        user_agent = common::header(&head, "User-Agent").unwrap_or("-"),
        peer = %conn.peer_fingerprint(),
        "Request"
    );

    let mut response = format!(
        "HTTP/1.0 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n",
        REPLY.len()
    )
    .into_bytes();
    response.extend_from_slice(REPLY);

    if let Err(e) = conn.write_all(&response).await {
        warn!(error = %e, "Failed to write response");
    }
    conn.close();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::init_tracing(&["shttp=info", "shttp_server=info"])?;
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => ListenSettings::load(path)
            .with_context(|| format!("loading settings {:?}", path))?,
        None => ListenSettings::default(),
    };

    let identity = common::load_or_create_identity(args.identity.as_deref())?;
    let signer = identity.signer();
    info!(host_key = %signer.fingerprint(), "Host identity loaded");

    let options = ListenOptions::new(args.address, signer).with_settings(&settings);
    let listener = Arc::new(Listener::setup(options, handle).await?);

    let stopper = listener.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            stopper.close();
        }
    });

    listener.accept().await?;
    Ok(())
}
