//! Stream demultiplexing: turns an accumulating byte buffer into payloads.
//!
//! The receiver mixes several encodings on one TCP stream and none of them is
//! self-describing, so payloads are recognised by their leading bytes. The
//! checks run in a fixed priority order:
//!
//! 0. `Start` frame header: strip the frame and classify its body
//! 1. `GCDH` vendor header: strip 16 bytes, emit nothing
//! 2. zlib stream (`78 9c`): inflate, clear the buffer, classify as JSON
//! 3. `[[` vendor block: complete when shorter than 500 bytes
//! 4. `<?xml` document: complete when its last line holds a `>`
//! 5. JSON object or array: complete when brackets pair up and it parses
//!
//! Anything that is still plausibly the start of one of these waits for more
//! data. Leading bytes that can never start a payload are discarded up to the
//! next recognisable marker.

use serde_json::Value;

use crate::compression::{ZLIB_MAGIC, decompress};
use crate::framing::{FRAME_START, HEADER_LEN, parse_header};
use crate::payload::{DecodedPayload, classify_json, classify_text};

/// Marker of the receiver's fixed-size binary header.
pub const VENDOR_HEADER_MAGIC: &[u8; 4] = b"GCDH";

/// Size of the `GCDH` header, marker included.
pub const VENDOR_HEADER_LEN: usize = 16;

/// Marker of the receiver's nested-array block.
pub const VENDOR_ARRAY_MARKER: &[u8; 2] = b"[[";

/// `[[` blocks shorter than this are assumed complete.
pub const VENDOR_ARRAY_COMPLETE_LIMIT: usize = 500;

const XML_PREFIX: &[u8] = b"<?xml";

/// Signatures searched for when resynchronising after garbage.
const RESYNC_MARKERS: &[&[u8]] = &[
    FRAME_START,
    VENDOR_HEADER_MAGIC,
    &ZLIB_MAGIC,
    XML_PREFIX,
    b"{",
    b"[",
];

/// Append-only accumulator for bytes read from the socket.
///
/// Trimmed from the front as payloads are extracted.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    bytes: Vec<u8>,
}

impl ReceiveBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// The buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Drop the first `n` bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.bytes.len());
        self.bytes.drain(..n);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Configuration for the demultiplexer.
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    /// Buffered bytes beyond which pending data is discarded. Default: 16 MiB.
    pub max_pending_bytes: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            max_pending_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Outcome of one classification attempt.
#[derive(Debug)]
enum Step {
    /// A payload was extracted and removed from the buffer.
    Emitted(DecodedPayload),
    /// Bytes were removed without producing a payload.
    Skipped,
    /// Nothing can be extracted until more data arrives.
    Stalled,
}

/// Extracts payloads from a [`ReceiveBuffer`] by leading-byte signature.
#[derive(Debug, Default)]
pub struct StreamDemultiplexer {
    config: DemuxConfig,
    expecting_channel_list: bool,
}

impl StreamDemultiplexer {
    /// Create a demultiplexer with the given configuration.
    pub fn new(config: DemuxConfig) -> Self {
        Self {
            config,
            expecting_channel_list: false,
        }
    }

    /// Prefer the channel-list interpretation for the next JSON array.
    ///
    /// Called when a channel-list request is written to the socket. Cleared
    /// once a channel list has been emitted.
    pub fn expect_channel_list(&mut self) {
        self.expecting_channel_list = true;
    }

    /// Whether a channel list is currently expected.
    pub fn is_expecting_channel_list(&self) -> bool {
        self.expecting_channel_list
    }

    /// Extract every complete payload from `buf`, in stream order.
    ///
    /// Runs until a pass makes no progress; any incomplete tail stays in the
    /// buffer for the next call.
    pub fn drain(&mut self, buf: &mut ReceiveBuffer) -> Vec<DecodedPayload> {
        let mut payloads = Vec::new();

        loop {
            match self.step(buf) {
                Step::Emitted(payload) => {
                    if matches!(payload, DecodedPayload::ChannelList(_)) {
                        self.expecting_channel_list = false;
                    }
                    tracing::debug!(kind = payload.kind(), remaining = buf.len(), "payload extracted");
                    payloads.push(payload);
                }
                Step::Skipped => {}
                Step::Stalled => break,
            }
        }

        if buf.len() > self.config.max_pending_bytes {
            tracing::warn!(
                pending = buf.len(),
                max = self.config.max_pending_bytes,
                "receive buffer overflow, discarding pending data"
            );
            payloads.push(DecodedPayload::unknown(buf.as_slice()));
            buf.clear();
        }

        payloads
    }

    fn step(&mut self, buf: &mut ReceiveBuffer) -> Step {
        let data = buf.as_slice();
        if data.is_empty() {
            return Step::Stalled;
        }

        if data.starts_with(FRAME_START) {
            return self.take_frame(buf);
        }

        if data.starts_with(VENDOR_HEADER_MAGIC) {
            if data.len() < VENDOR_HEADER_LEN {
                return Step::Stalled;
            }
            tracing::trace!("stripping vendor header");
            buf.consume(VENDOR_HEADER_LEN);
            return Step::Skipped;
        }

        if data.starts_with(&ZLIB_MAGIC) {
            return match decompress(data) {
                Some(text) => {
                    // One compressed block per read cycle: whatever follows is dropped.
                    buf.clear();
                    Step::Emitted(classify_text(text, self.expecting_channel_list))
                }
                None => Step::Stalled,
            };
        }

        if data.starts_with(VENDOR_ARRAY_MARKER) {
            if data.len() >= VENDOR_ARRAY_COMPLETE_LIMIT {
                return Step::Stalled;
            }
            let payload = DecodedPayload::unknown(data);
            buf.clear();
            return Step::Emitted(payload);
        }

        let trimmed = data.trim_ascii_start();

        if trimmed.starts_with(XML_PREFIX) {
            let payload = {
                let text = String::from_utf8_lossy(trimmed);
                let text = text.trim_end();
                let complete = text.lines().last().is_some_and(|line| line.contains('>'));
                if !complete {
                    return Step::Stalled;
                }
                DecodedPayload::Xml(text.to_string())
            };
            buf.clear();
            return Step::Emitted(payload);
        }

        if trimmed.starts_with(b"{") || trimmed.starts_with(b"[") {
            return match parse_complete_json(trimmed) {
                Some(value) => {
                    let payload = classify_json(value, self.expecting_channel_list);
                    buf.clear();
                    Step::Emitted(payload)
                }
                None => Step::Stalled,
            };
        }

        if trimmed.is_empty() || is_partial_marker(data) || is_partial_marker(trimmed) {
            return Step::Stalled;
        }

        self.resync(buf)
    }

    /// Handle a buffer that starts with `Start`.
    fn take_frame(&mut self, buf: &mut ReceiveBuffer) -> Step {
        let data = buf.as_slice();
        let len = match parse_header(data) {
            Ok(Some(len)) => len,
            Ok(None) => return Step::Stalled,
            Err(e) => {
                tracing::warn!("malformed frame header: {e}");
                return self.resync(buf);
            }
        };

        let total = HEADER_LEN + len;
        if data.len() < total {
            return Step::Stalled;
        }

        let body = data[HEADER_LEN..total].to_vec();
        buf.consume(total);
        Step::Emitted(self.classify_body(body))
    }

    /// Classify the body of a complete inbound frame.
    fn classify_body(&self, body: Vec<u8>) -> DecodedPayload {
        if body.starts_with(&ZLIB_MAGIC) {
            return match decompress(&body) {
                Some(text) => classify_text(text, self.expecting_channel_list),
                None => DecodedPayload::unknown(&body),
            };
        }

        let trimmed = body.trim_ascii();
        if (trimmed.starts_with(b"{") || trimmed.starts_with(b"["))
            && let Ok(value) = serde_json::from_slice::<Value>(trimmed)
        {
            return classify_json(value, self.expecting_channel_list);
        }

        match String::from_utf8(body) {
            Ok(text) if text.trim_start().starts_with("<?xml") => DecodedPayload::Xml(text),
            Ok(text) => DecodedPayload::RawText(text),
            Err(e) => DecodedPayload::unknown(e.as_bytes()),
        }
    }

    /// Discard bytes up to the next recognisable marker.
    ///
    /// A trailing partial marker is kept so a split signature is not lost.
    fn resync(&mut self, buf: &mut ReceiveBuffer) -> Step {
        let data = buf.as_slice();
        let cut = next_marker(data, 1).unwrap_or_else(|| data.len() - partial_marker_suffix(data));
        let discarded = &data[..cut];

        let payload = if discarded.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            tracing::warn!(discarded = cut, "unrecognised data, resynchronising");
            Some(DecodedPayload::unknown(discarded))
        };

        buf.consume(cut);
        match payload {
            Some(payload) => Step::Emitted(payload),
            None => Step::Skipped,
        }
    }
}

/// Parse `data` as one JSON document if it looks complete.
fn parse_complete_json(data: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(data).ok()?.trim();
    let paired = matches!(
        (text.chars().next(), text.chars().last()),
        (Some('{'), Some('}')) | (Some('['), Some(']'))
    );
    if !paired {
        return None;
    }
    serde_json::from_str(text).ok()
}

/// Whether `data` is a strict prefix of some marker.
fn is_partial_marker(data: &[u8]) -> bool {
    RESYNC_MARKERS
        .iter()
        .any(|marker| data.len() < marker.len() && marker.starts_with(data))
}

/// Position of the earliest marker at or after `from`.
fn next_marker(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    RESYNC_MARKERS
        .iter()
        .filter_map(|marker| {
            data[from..]
                .windows(marker.len())
                .position(|window| window == *marker)
        })
        .min()
        .map(|pos| pos + from)
}

/// Length of the longest proper suffix of `data` that could begin a marker.
fn partial_marker_suffix(data: &[u8]) -> usize {
    (1..data.len())
        .map(|start| &data[start..])
        .find(|suffix| is_partial_marker(suffix))
        .map_or(0, <[u8]>::len)
}
