//! Length-prefixed framing.
//!
//! Every message in either direction is a 4-byte little-endian length `N`
//! followed by `N` bytes of UTF-8 JSON.
//!
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ N (u32 LE) │ N bytes JSON                 │
//! └────────────┴──────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest body accepted from the peer (hierarchy dumps can be large).
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

// ============================================================================
// Encoding
// ============================================================================

/// Builds the 4-byte header for a body of `len` bytes.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if `len` does not fit in a `u32`.
pub fn encode_header(len: usize) -> Result<[u8; HEADER_LEN]> {
    let len = u32::try_from(len)
        .map_err(|_| Error::protocol(format!("frame of {len} bytes exceeds u32 length")))?;
    Ok(len.to_le_bytes())
}

/// Writes one frame: header, then body.
///
/// # Errors
///
/// Returns [`Error::Io`] on any write failure.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(body.len())?;
    writer.write_all(&header).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    trace!(len = body.len(), "Frame written");
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Reads one frame and returns its body.
///
/// # Errors
///
/// - [`Error::Io`] if the header cannot be read
/// - [`Error::Protocol`] if the body is shorter than announced or too large
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!(
            "frame length {len} exceeds limit {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::protocol(format!("incomplete frame: expected {len} bytes"))
        } else {
            Error::Io(e)
        }
    })?;

    trace!(len, "Frame read");
    Ok(body)
}

// ============================================================================
// Tests
// ============================================================================
