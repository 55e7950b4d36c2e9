//! shttp demo client
//!
//! Sends `GET /` over an `"http"` channel and prints the status and body.
//!
//! Usage:
//!   shttp-client [--address 127.0.0.1:8080] [--network tcp] [--timeout-secs 10]
//!                [--identity FILE] [--config FILE]

mod common;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use shttp::{dial, DialOptions, DialSettings, Network};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// shttp demo client
#[derive(Parser)]
#[command(name = "shttp-client")]
#[command(about = "Fetch / from an shttp server")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Address family: tcp, tcp4 or tcp6
    #[arg(short, long)]
    network: Option<Network>,

    /// Connect and handshake timeout in seconds, 0 for none
    #[arg(short, long)]
    timeout_secs: Option<u64>,

    /// Client identity file (PKCS#8); created if missing, throwaway if omitted
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// JSON dial settings
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::init_tracing(&["shttp=warn", "shttp_client=info"])?;
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => DialSettings::load(path)
            .with_context(|| format!("loading settings {:?}", path))?,
        None => DialSettings::default(),
    };

    let identity = common::load_or_create_identity(args.identity.as_deref())?;
    let mut options =
        DialOptions::new(args.address.clone(), identity.signer()).with_settings(&settings);
    if let Some(network) = args.network {
        options = options.network(network);
    }
    if let Some(secs) = args.timeout_secs {
        options = options.timeout(Duration::from_secs(secs));
    }

    let mut conn = dial(options)
        .await
        .with_context(|| format!("dialing {}", args.address))?;

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: shttpclient/1.0\r\n\r\n",
        args.address
    );
    conn.write_all(request.as_bytes()).await?;

    let (head, mut body) = common::read_head(&mut conn).await?;
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_once(' '))
        .map(|(_, status)| status.to_string())
        .ok_or_else(|| anyhow!("missing status line"))?;

    match common::header(&head, "Content-Length") {
        Some(len) => {
            let len: usize = len.parse().context("bad Content-Length")?;
            if body.len() < len {
                let mut rest = vec![0u8; len - body.len()];
                conn.read_exact(&mut rest).await?;
                body.extend_from_slice(&rest);
            }
            body.truncate(len);
        }
        None => {
            conn.read_to_end(&mut body).await?;
        }
    }

    println!("{}\n{}", status, String::from_utf8_lossy(&body));
    conn.close();
    Ok(())
}
