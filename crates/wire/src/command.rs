//! Null-terminated JSON command envelopes.
//!
//! Commands are the small control half of the protocol: a session opens
//! with a request command, record frames follow (for upload/remove), and
//! after the zero-length terminator the receiving side answers with one
//! `ack` or `error` command. The payload codec is JSON; the `\0`
//! delimiter is fixed.

use conflux_core::{CompressionMethod, Error, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one encoded command.
pub const MAX_COMMAND_LEN: usize = 64 * 1024;

/// A control message. Unknown fields are ignored; unknown types are
/// `Malformed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Open a record upload; the stream that follows uses the named
    /// compression method.
    Upload {
        /// Outer framing of the record stream.
        #[serde(default)]
        compression: CompressionMethod,
    },
    /// Request a record download.
    Download {
        /// Only state visible at or after this timestamp.
        #[serde(default)]
        cutoff: Option<Timestamp>,
        /// Outer framing of the record stream.
        #[serde(default)]
        compression: CompressionMethod,
    },
    /// Open a tombstone upload.
    Remove,
    /// End-of-stream acknowledgement.
    Ack,
    /// End-of-stream failure, with a human-readable message.
    Error {
        /// What went wrong on the sending side.
        message: String,
    },
}

/// Write one command followed by the `\0` delimiter, and flush.
pub async fn write_command<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    command: &Command,
) -> Result<()> {
    // serde_json escapes control characters, so the encoded body never
    // contains a raw NUL.
    let body = serde_json::to_vec(command)?;
    writer.write_all(&body).await?;
    writer.write_all(&[0u8]).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one command. EOF anywhere before the delimiter is `Malformed`.
pub async fn read_command<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Command> {
    match try_read_command(reader).await? {
        Some(command) => Ok(command),
        None => Err(Error::malformed("connection closed before a command")),
    }
}

/// Read one command, or `None` on a clean EOF before the first byte.
/// Servers use this to detect an orderly close between keep-alive
/// requests.
pub async fn try_read_command<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
) -> Result<Option<Command>> {
    let mut body = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                if body.is_empty() {
                    return Ok(None);
                }
                return Err(Error::malformed("connection closed inside a command"));
            }
            Err(e) => return Err(e.into()),
        };
        if byte == 0 {
            break;
        }
        body.push(byte);
        if body.len() > MAX_COMMAND_LEN {
            return Err(Error::malformed("command exceeds length limit"));
        }
    }
    let command = serde_json::from_slice(&body)?;
    Ok(Some(command))
}

/// Interpret the closing command of a stream: `Ack` succeeds, `Error`
/// surfaces the remote failure as transient (the quorum layer decides
/// whether to retry elsewhere), anything else is a protocol violation.
pub fn require_ack(command: Command) -> Result<()> {
    match command {
        Command::Ack => Ok(()),
        Command::Error { message } => Err(Error::transient(format!("remote error: {message}"))),
        other => Err(Error::malformed(format!(
            "expected ack or error, got {other:?}"
        ))),
    }
}
