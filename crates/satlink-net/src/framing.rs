//! `Start`/`End` framing for the receiver's TCP stream.
//!
//! Every application-level message on the wire carries an ASCII header:
//!
//! ```text
//! +---------+---------------------+-------+------------------+
//! | "Start" | length (7 digits)   | "End" |   body           |
//! | 5 bytes | decimal, zero-padded| 3 b.  |   (length bytes) |
//! +---------+---------------------+-------+------------------+
//! ```
//!
//! The length counts body bytes only. Because the field is seven decimal
//! digits, the largest representable body is 9,999,999 bytes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Leading marker of every frame.
pub const FRAME_START: &[u8; 5] = b"Start";

/// Marker closing the length field.
pub const FRAME_END: &[u8; 3] = b"End";

/// Number of decimal digits in the length field.
pub const LENGTH_DIGITS: usize = 7;

/// Total header size: `Start` + 7 digits + `End`.
pub const HEADER_LEN: usize = FRAME_START.len() + LENGTH_DIGITS + FRAME_END.len();

/// Largest body the 7-digit length field can describe.
pub const MAX_BODY_LEN: usize = 9_999_999;

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The body does not fit in the 7-digit length field.
    #[error("body size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual body size.
        size: usize,
        /// The largest encodable size.
        max: usize,
    },

    /// The data does not begin with `Start`.
    #[error("frame does not begin with \"Start\"")]
    MissingStart,

    /// The length field contains something other than seven ASCII digits.
    #[error("invalid length field {0:?}")]
    InvalidLength(String),

    /// The length field is not followed by `End`.
    #[error("length field is not terminated by \"End\"")]
    MissingEnd,

    /// The declared length disagrees with the number of body bytes.
    #[error("declared length {declared} does not match body length {actual}")]
    LengthMismatch {
        /// Length written in the header.
        declared: usize,
        /// Bytes actually following the header.
        actual: usize,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the 15-byte header for a body of `len` bytes.
fn header_for(len: usize) -> Result<[u8; HEADER_LEN], FrameError> {
    if len > MAX_BODY_LEN {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: MAX_BODY_LEN,
        });
    }

    let mut header = [0u8; HEADER_LEN];
    let digits = format!("{len:0width$}", width = LENGTH_DIGITS);
    header[..FRAME_START.len()].copy_from_slice(FRAME_START);
    header[FRAME_START.len()..FRAME_START.len() + LENGTH_DIGITS].copy_from_slice(digits.as_bytes());
    header[FRAME_START.len() + LENGTH_DIGITS..].copy_from_slice(FRAME_END);
    Ok(header)
}

/// Frame `body` for transmission.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let header = header_for(body.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Parse a frame header at the start of `buf`.
///
/// Returns `Ok(None)` while fewer than [`HEADER_LEN`] bytes are available,
/// otherwise the declared body length. The body itself is not required to be
/// present.
pub fn parse_header(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    let start_len = FRAME_START.len().min(buf.len());
    if buf[..start_len] != FRAME_START[..start_len] {
        return Err(FrameError::MissingStart);
    }
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let digits = &buf[FRAME_START.len()..FRAME_START.len() + LENGTH_DIGITS];
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::InvalidLength(
            String::from_utf8_lossy(digits).into_owned(),
        ));
    }
    if &buf[FRAME_START.len() + LENGTH_DIGITS..HEADER_LEN] != FRAME_END {
        return Err(FrameError::MissingEnd);
    }

    // Seven ASCII digits always fit in usize.
    let declared = digits
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));
    Ok(Some(declared))
}

/// Strictly decode a complete frame, returning its body.
///
/// The header length must equal the number of bytes after the header.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], FrameError> {
    let declared = match parse_header(frame)? {
        Some(len) => len,
        None => return Err(FrameError::MissingEnd),
    };
    let body = &frame[HEADER_LEN..];
    if body.len() != declared {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(body)
}

/// Read a single frame from the stream and return its body.
///
/// Returns [`FrameError::ConnectionClosed`] if the peer closes the connection
/// before the frame is complete.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(eof_as_closed)?;

    let len = parse_header(&header)?.unwrap_or_default();
    let mut body = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut body).await.map_err(eof_as_closed)?;
    }
    Ok(body)
}

/// Frame `body` and write it to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), FrameError> {
    let header = header_for(body.len())?;
    writer.write_all(&header).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    writer.flush().await?;
    Ok(())
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}
