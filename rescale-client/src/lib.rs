//! Client side of the launcher's in-pod control protocol.
//!
//! A running launcher listens on a TCP control port. To resize its process
//! group we send a `set_bitmap` request: one byte per existing rank (`1` =
//! keep, `0` = drop), the new process count as a little-endian `int32`, and
//! a terminating NUL. Any reply within the timeout means the launcher
//! accepted the new configuration.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const RESCALE_COMMAND: &str = "set_bitmap";
pub const DEFAULT_PORT: u16 = 1234;
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(180);

const COMMAND_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescaleOutcome {
    /// The launcher acknowledged the new process group
    Applied,
    /// Old and new counts are equal, nothing was sent
    Noop,
}

#[derive(Debug, Error)]
pub enum RescaleError {
    #[error("invalid process count {0}")]
    InvalidProcCount(i32),
    #[error("connecting to launcher control port: {0}")]
    Connect(std::io::Error),
    #[error("exchanging rescale request: {0}")]
    Io(#[from] std::io::Error),
    #[error("launcher did not reply within {0:?}")]
    Timeout(Duration),
}

/// Tell the launcher at `host:port` to go from `old_procs` to `new_procs`
/// ranks. Blocks until the launcher replies or `timeout` expires.
pub async fn rescale(
    host: &str,
    port: u16,
    old_procs: i32,
    new_procs: i32,
    timeout: Duration,
) -> Result<RescaleOutcome, RescaleError> {
    if old_procs == new_procs {
        return Ok(RescaleOutcome::Noop);
    }
    let old = usize::try_from(old_procs).map_err(|_| RescaleError::InvalidProcCount(old_procs))?;
    if new_procs < 0 {
        return Err(RescaleError::InvalidProcCount(new_procs));
    }

    let request = encode_request(old, new_procs);
    tokio::time::timeout(timeout, exchange(host, port, &request))
        .await
        .map_err(|_| RescaleError::Timeout(timeout))?
}

async fn exchange(
    host: &str,
    port: u16,
    request: &[u8],
) -> Result<RescaleOutcome, RescaleError> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(RescaleError::Connect)?;
    stream.write_all(request).await?;
    stream.flush().await?;

    // the launcher replies with a length-prefixed message; its content does
    // not matter, receiving one at all means the rescale was accepted
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).await?;
    Ok(RescaleOutcome::Applied)
}

/// Request frame: body length and target processor as big-endian `u32`s,
/// the NUL-padded command name, then the bitmap body.
fn encode_request(old_procs: usize, new_procs: i32) -> Vec<u8> {
    let body = rescale_body(old_procs, new_procs);
    let mut request = Vec::with_capacity(8 + COMMAND_NAME_LEN + body.len());
    request.extend((body.len() as u32).to_be_bytes());
    request.extend(0u32.to_be_bytes());
    let mut name = [0u8; COMMAND_NAME_LEN];
    name[..RESCALE_COMMAND.len()].copy_from_slice(RESCALE_COMMAND.as_bytes());
    request.extend(name);
    request.extend(body);
    request
}

/// Rank-retention bitmap followed by the new count and a NUL terminator.
/// On expansion every existing rank survives; on shrink the first
/// `new_procs` ranks survive and the tail is dropped.
pub fn rescale_body(old_procs: usize, new_procs: i32) -> Vec<u8> {
    let retained = (new_procs as usize).min(old_procs);
    let mut body = Vec::with_capacity(old_procs + 5);
    body.extend((0..old_procs).map(|rank| u8::from(rank < retained)));
    body.extend(new_procs.to_le_bytes());
    body.push(0);
    body
}
