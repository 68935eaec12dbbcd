//! Maps the persisted [`Config`] onto the session's runtime settings.

use std::time::Duration;

use satlink_config::Config;
use satlink_net::{
    ClientIdentity, DemuxConfig, ProbeConfig, ReconnectConfig, SessionConfig, SocketConfig,
};

/// Build the session settings for the configured receiver.
pub fn session_config(config: &Config) -> SessionConfig {
    let probe_defaults = ProbeConfig::default();

    SessionConfig {
        host: config.device.host.clone(),
        port: config.device.port,
        identity: ClientIdentity {
            name: config.device.client_name.clone(),
            uuid: config.device.uuid.clone(),
        },
        connect_timeout: Duration::from_millis(config.connection.connect_timeout_ms),
        startup_delay: Duration::from_millis(config.connection.startup_delay_ms),
        read_chunk_size: config.connection.read_chunk_size,
        demux: DemuxConfig {
            max_pending_bytes: config.connection.max_pending_bytes,
        },
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(config.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
            max_attempts: config.reconnect.max_attempts,
        },
        probe: ProbeConfig {
            enabled: config.probe.enabled,
            interval: Duration::from_millis(config.probe.interval_ms),
            timeout: Duration::from_millis(config.probe.timeout_ms),
            request_code: config.probe.request_code.clone(),
            max_missed: config.probe.max_missed,
            ..probe_defaults
        },
        socket: SocketConfig::default(),
    }
}
