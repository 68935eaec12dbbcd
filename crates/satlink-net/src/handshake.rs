//! Connection handshake and startup requests.
//!
//! Right after the TCP connect the client introduces itself with a fixed XML
//! document (request 998), then asks the receiver for its initial state with a
//! short batch of JSON requests.

use crate::command::request_body;

/// Client name sent in the handshake by default.
pub const DEFAULT_CLIENT_NAME: &str = "PythonQtClient";

/// Client token sent in the handshake by default.
pub const DEFAULT_CLIENT_UUID: &str = "da9c9e4b-64b7-4bf2-8a26-5550d58c42d1-02:00:00:00:00:00";

/// Request codes sent after the handshake, in order.
pub const STARTUP_REQUEST_CODES: [&str; 6] = ["16", "20", "22", "24", "15", "12"];

/// Identity presented to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Free-form client name.
    pub name: String,
    /// Client token; the receiver only checks its presence.
    pub uuid: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            name: DEFAULT_CLIENT_NAME.to_string(),
            uuid: DEFAULT_CLIENT_UUID.to_string(),
        }
    }
}

/// Build the XML handshake body (unframed).
pub fn handshake_body(identity: &ClientIdentity) -> Vec<u8> {
    format!(
        "<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>\
         <Command request=\"998\"><data>{}</data><uuid>{}</uuid></Command>",
        identity.name, identity.uuid
    )
    .into_bytes()
}

/// Build the startup request bodies (unframed), in send order.
pub fn startup_bodies() -> Vec<Vec<u8>> {
    STARTUP_REQUEST_CODES
        .iter()
        .map(|code| request_body(code, serde_json::Map::new()))
        .collect()
}
