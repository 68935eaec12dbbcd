//! Zlib handling for compressed receiver payloads.
//!
//! The receiver compresses large responses (channel lists in particular) with
//! zlib. Inbound reads are frequently partial, so inflation never reports an
//! error: a `None` result means "not a complete compressed block yet".

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

/// The two leading bytes of a default-level zlib stream.
pub const ZLIB_MAGIC: [u8; 2] = [0x78, 0x9c];

/// Upper bound on inflated output. Larger streams are treated as invalid.
pub const MAX_INFLATED_LEN: usize = 64 * 1024 * 1024;

/// Inflate a complete zlib stream into text.
///
/// Returns `None` if `data` is not zlib, is corrupt, or ends before the
/// stream terminator. Invalid UTF-8 is replaced lossily.
pub fn decompress(data: &[u8]) -> Option<String> {
    let mut inflater = Decompress::new(true);
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).max(256));

    loop {
        if out.len() == out.capacity() {
            if out.len() >= MAX_INFLATED_LEN {
                return None;
            }
            out.reserve(out.capacity());
        }

        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();
        let status = inflater
            .decompress_vec(&data[consumed..], &mut out, FlushDecompress::None)
            .ok()?;

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                // Out of input with room to spare: the stream is truncated.
                let stalled = inflater.total_in() as usize == consumed
                    && inflater.total_out() == produced;
                if stalled {
                    return None;
                }
            }
        }
    }

    Some(String::from_utf8_lossy(&out).into_owned())
}

/// Compress `text` into a zlib stream starting with [`ZLIB_MAGIC`].
pub fn compress(text: &str) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(text.as_bytes());
    encoder.finish().unwrap_or_default()
}
