//! Helpers shared by the demo binaries

use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use shttp::Identity;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::info;

/// Largest request or response head the demos accept
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Install the fmt subscriber, honoring `RUST_LOG`
pub fn init_tracing(directives: &[&str]) -> anyhow::Result<()> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in directives {
        filter = filter.add_directive(directive.parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Load the identity at `path`, creating it if missing; no path means a throwaway key
pub fn load_or_create_identity(path: Option<&Path>) -> anyhow::Result<Identity> {
    let path = match path {
        Some(path) => path,
        None => return Ok(Identity::generate()?),
    };

    if path.exists() {
        let bytes = fs::read(path).with_context(|| format!("reading identity {:?}", path))?;
        let identity = Identity::from_bytes(bytes);
        identity
            .try_signer()
            .with_context(|| format!("invalid identity file {:?}", path))?;
        return Ok(identity);
    }

    let identity = Identity::generate()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, identity.as_bytes()).with_context(|| format!("writing identity {:?}", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    info!(path = ?path, "Generated new identity");
    Ok(identity)
}

/// Read up to the blank line ending an HTTP head
///
/// Returns the head as text and any bytes read past it.
pub async fn read_head<R>(reader: &mut R) -> anyhow::Result<(String, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok((String::from_utf8(buf)?, rest));
        }
        if buf.len() > MAX_HEAD_SIZE {
            bail!("head exceeds {} bytes", MAX_HEAD_SIZE);
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            bail!("stream ended before end of head");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Value of header `name` in `head`, matched case-insensitively
pub fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}
