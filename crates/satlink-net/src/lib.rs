//! Satellite receiver remote-control protocol: framing, stream demultiplexing,
//! command queueing, and the connection session lifecycle.

pub mod command;
pub mod compression;
pub mod demux;
pub mod diagnostics;
pub mod framing;
pub mod handshake;
pub mod payload;
pub mod platform;
pub mod queue;
pub mod reconnection;
pub mod session;

pub use command::{Command, CommandTag, Request, request_body};
pub use demux::{DemuxConfig, ReceiveBuffer, StreamDemultiplexer};
pub use diagnostics::{LatencyProbe, LatencySample, LatencyStats, ProbeConfig};
pub use framing::{FrameError, decode_frame, encode_frame, read_frame, write_frame};
pub use handshake::{ClientIdentity, handshake_body, startup_bodies};
pub use payload::{ChannelRecord, DecodedPayload};
pub use platform::{Keepalive, SocketConfig, configure_stream};
pub use queue::{CommandQueue, ReadyBatch};
pub use reconnection::{ReconnectConfig, ReconnectPolicy};
pub use session::{
    ConnectionSession, ConnectionState, ConnectionStateWatch, DEFAULT_DEVICE_PORT, EventReceiver,
    SessionConfig, SessionError, SessionEvent,
};
