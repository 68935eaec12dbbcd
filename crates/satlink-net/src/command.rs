//! Outgoing commands and typed request builders.
//!
//! The engine forwards command bodies unmodified; [`Request`] is a convenience
//! for the request codes higher layers use most.

use serde::Serialize;
use serde_json::{Map, Value};

/// Marks what kind of response a command is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandTag {
    /// No expectation about the response.
    #[default]
    Plain,
    /// The response is a channel list.
    ChannelListRequest,
}

/// An outgoing command body plus its tag. Framing is applied on send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    payload: Vec<u8>,
    tag: CommandTag,
}

impl Command {
    /// A plain command carrying `payload` verbatim.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            tag: CommandTag::Plain,
        }
    }

    /// Serialize `value` as the command body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Replace the tag.
    pub fn with_tag(mut self, tag: CommandTag) -> Self {
        self.tag = tag;
        self
    }

    /// The unframed body.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The command's tag.
    pub fn tag(&self) -> CommandTag {
        self.tag
    }

    /// Split into body and tag.
    pub fn into_parts(self) -> (Vec<u8>, CommandTag) {
        (self.payload, self.tag)
    }
}

#[derive(Serialize)]
struct RequestBody<'a> {
    request: &'a str,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// Serialize `{"request":"<code>", ...fields}`.
pub fn request_body(code: &str, fields: Map<String, Value>) -> Vec<u8> {
    let body = RequestBody {
        request: code,
        fields,
    };
    // A string key plus a JSON map always serializes.
    serde_json::to_vec(&body).unwrap_or_default()
}

/// Requests understood by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Request 0: fetch the channel table between two indices.
    FetchChannels {
        /// First index, inclusive.
        from: u32,
        /// Last index, inclusive.
        to: u32,
    },
    /// Request 1001: rename a channel.
    Rename {
        /// Channel program id.
        program_id: String,
        /// New display name.
        name: String,
    },
    /// Request 1002: delete a channel.
    Delete {
        /// Channel program id.
        program_id: String,
    },
    /// Request 1003: lock or unlock a channel.
    SetLock {
        /// Channel program id.
        program_id: String,
        /// `true` locks (`TvState` 1), `false` unlocks (`TvState` 0).
        locked: bool,
    },
    /// Request 1005: move a channel to a new position.
    Move {
        /// Channel program id.
        program_id: String,
        /// Target position in the channel table.
        position: u32,
    },
    /// Request 1009: switch the receiver to a channel.
    ChangeChannel {
        /// Channel program id.
        program_id: String,
    },
    /// Request 1040: press a remote-control key.
    SendKey {
        /// Receiver key code.
        key: u32,
    },
    /// Any other request code without parameters.
    Raw(String),
}

impl Request {
    /// The request code as sent on the wire.
    pub fn code(&self) -> &str {
        match self {
            Self::FetchChannels { .. } => "0",
            Self::Rename { .. } => "1001",
            Self::Delete { .. } => "1002",
            Self::SetLock { .. } => "1003",
            Self::Move { .. } => "1005",
            Self::ChangeChannel { .. } => "1009",
            Self::SendKey { .. } => "1040",
            Self::Raw(code) => code,
        }
    }

    fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        let mut put = |key: &str, value: String| {
            fields.insert(key.to_string(), Value::String(value));
        };

        match self {
            Self::FetchChannels { from, to } => {
                put("FromIndex", from.to_string());
                put("ToIndex", to.to_string());
            }
            Self::Rename { program_id, name } => {
                put("ProgramId", program_id.clone());
                put("ProgramName", name.clone());
            }
            Self::Delete { program_id } | Self::ChangeChannel { program_id } => {
                put("ProgramId", program_id.clone());
            }
            Self::SetLock { program_id, locked } => {
                put("ProgramId", program_id.clone());
                put("TvState", u8::from(*locked).to_string());
            }
            Self::Move {
                program_id,
                position,
            } => {
                put("ProgramId", program_id.clone());
                put("MoveToPosition", position.to_string());
            }
            Self::SendKey { key } => put("KeyValue", key.to_string()),
            Self::Raw(_) => {}
        }
        fields
    }

    /// The tag the resulting command carries.
    pub fn tag(&self) -> CommandTag {
        match self {
            Self::FetchChannels { .. } => CommandTag::ChannelListRequest,
            _ => CommandTag::Plain,
        }
    }
}

impl From<Request> for Command {
    fn from(request: Request) -> Self {
        Command::new(request_body(request.code(), request.fields())).with_tag(request.tag())
    }
}
