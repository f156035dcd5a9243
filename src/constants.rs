//! ESL protocol constants

/// Default ESL password (FreeSWITCH default)
pub const DEFAULT_PASSWORD: &str = "ClueCon";

/// Authentication command
pub const AUTH_COMMAND: &str = "auth";

/// Outbound-mode connect command
pub const CONNECT_COMMAND: &str = "connect";

/// Event subscription command
pub const EVENT_COMMAND: &str = "event";

/// API command prefix
pub const API_COMMAND: &str = "api";

/// Background API command prefix
pub const BGAPI_COMMAND: &str = "bgapi";

/// Sendmsg command prefix
pub const SENDMSG_COMMAND: &str = "sendmsg";

/// Graceful session-end command
pub const EXIT_COMMAND: &str = "exit";

/// Command/Reply content type
pub const CONTENT_TYPE_REPLY: &str = "command/reply";

/// API response content type
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";

/// Event plain content type
pub const CONTENT_TYPE_EVENT_PLAIN: &str = "text/event-plain";

/// Event XML content type
pub const CONTENT_TYPE_EVENT_XML: &str = "text/event-xml";

/// Authentication request content type
pub const CONTENT_TYPE_AUTH: &str = "auth/request";

/// Disconnect notice content type
pub const CONTENT_TYPE_DISCONNECT: &str = "text/disconnect-notice";

/// Rude rejection content type
pub const CONTENT_TYPE_RUDE_REJECTION: &str = "text/rude-rejection";

/// Event name used by background-job completions
pub const EVENT_BACKGROUND_JOB: &str = "BACKGROUND_JOB";

/// Default per-command reply timeout (spec.md §4.D)
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

/// Default idle-read timeout before the keepalive probe fires (spec.md §4.C)
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// `bgapi` sub-command used to probe liveness when idle (issued as
/// `bgapi status`, per spec.md §4.C)
pub const IDLE_PROBE_COMMAND: &str = "status";

/// Initial reconnect delay
pub const INITIAL_RECONNECT_DELAY_MS: u64 = 1000;

/// Maximum reconnect delay
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;

/// Reconnect jitter, as a fraction of the computed delay
pub const RECONNECT_JITTER_FRACTION: f64 = 0.2;

/// Read buffer size for TCP socket
pub const READ_BUFFER_SIZE: usize = 8192;

/// ESL events recognized with first-class constants; any other name is
/// still accepted on the wire, these just save callers from typos.
pub mod events {
    pub const CHANNEL_CREATE: &str = "CHANNEL_CREATE";
    pub const CHANNEL_ANSWER: &str = "CHANNEL_ANSWER";
    pub const CHANNEL_HANGUP: &str = "CHANNEL_HANGUP";
    pub const CHANNEL_HANGUP_COMPLETE: &str = "CHANNEL_HANGUP_COMPLETE";
    pub const CHANNEL_STATE: &str = "CHANNEL_STATE";
    pub const CHANNEL_BRIDGE: &str = "CHANNEL_BRIDGE";
    pub const CHANNEL_UNBRIDGE: &str = "CHANNEL_UNBRIDGE";
    pub const CHANNEL_EXECUTE: &str = "CHANNEL_EXECUTE";
    pub const CHANNEL_EXECUTE_COMPLETE: &str = "CHANNEL_EXECUTE_COMPLETE";
    pub const DTMF: &str = "DTMF";
    pub const HEARTBEAT: &str = "HEARTBEAT";
    pub const BACKGROUND_JOB: &str = super::EVENT_BACKGROUND_JOB;

    /// Events a typical billing/call-control listener subscribes to.
    pub const CALL_CONTROL_EVENTS: &[&str] = &[
        CHANNEL_CREATE,
        CHANNEL_ANSWER,
        CHANNEL_HANGUP_COMPLETE,
        CHANNEL_STATE,
        CHANNEL_BRIDGE,
        CHANNEL_UNBRIDGE,
        HEARTBEAT,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_PASSWORD, "ClueCon");
        assert_eq!(AUTH_COMMAND, "auth");
        assert!(MAX_RECONNECT_DELAY_MS > INITIAL_RECONNECT_DELAY_MS);
    }

    #[test]
    fn test_call_control_events() {
        assert!(events::CALL_CONTROL_EVENTS.contains(&events::CHANNEL_CREATE));
        assert!(events::CALL_CONTROL_EVENTS.contains(&events::CHANNEL_ANSWER));
        assert!(events::CALL_CONTROL_EVENTS.contains(&events::CHANNEL_HANGUP_COMPLETE));
    }
}
