//! Lines of the call monitor protocol.

use crate::error::{FritzError, Result};
use crate::fonbook::NumberType;
use crate::tools::tokenize;
use async_trait::async_trait;
use serde::Serialize;

/// One line sent by the call monitor, e.g.
/// `12.03.10 18:35:12;RING;0;0721123456;4711;SIP0;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Outgoing call from box port `port`.
    Call {
        conn_id: u32,
        port: String,
        local: String,
        remote: String,
        medium: String,
    },
    /// Incoming call.
    Ring {
        conn_id: u32,
        remote: String,
        local: String,
        medium: String,
    },
    Connect {
        conn_id: u32,
        port: String,
        party: String,
    },
    Disconnect {
        conn_id: u32,
        duration: String,
    },
}

impl MonitorEvent {
    pub fn conn_id(&self) -> u32 {
        match self {
            Self::Call { conn_id, .. }
            | Self::Ring { conn_id, .. }
            | Self::Connect { conn_id, .. }
            | Self::Disconnect { conn_id, .. } => *conn_id,
        }
    }
}

/// Parse a call monitor line. Unknown message types are a protocol error.
pub fn parse_line(line: &str) -> Result<MonitorEvent> {
    let kind = tokenize(line, ';', 1);
    let digits: String = tokenize(line, ';', 2)
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    let conn_id = digits.parse().unwrap_or(0);
    let part = |pos| tokenize(line, ';', pos);

    match kind.as_str() {
        "CALL" => {
            let mut remote = part(5);
            // phones may append a '#' to dialed numbers
            if remote.ends_with('#') {
                remote.pop();
            }
            Ok(MonitorEvent::Call {
                conn_id,
                port: part(3),
                local: part(4),
                remote,
                medium: part(6),
            })
        }
        "RING" => Ok(MonitorEvent::Ring {
            conn_id,
            remote: part(3),
            local: part(4),
            medium: part(5),
        }),
        "CONNECT" => Ok(MonitorEvent::Connect {
            conn_id,
            port: part(3),
            party: part(4),
        }),
        "DISCONNECT" => Ok(MonitorEvent::Disconnect {
            conn_id,
            duration: part(3),
        }),
        other => Err(FritzError::protocol(format!(
            "unknown call monitor message type '{other}'"
        ))),
    }
}

/// A call on one of the monitored numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    pub outgoing: bool,
    pub conn_id: u32,
    pub remote_number: String,
    /// Name from the phonebooks, or the number if unknown.
    pub remote_name: String,
    pub remote_type: NumberType,
    pub local_number: String,
    /// `POTS`, `ISDN`, `SIP0`, ...
    pub medium: String,
    /// Provider name for SIP media, else the medium.
    pub medium_name: String,
}

/// Receives call monitor events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_call(&self, call: CallInfo);

    async fn handle_connect(&self, conn_id: u32);

    async fn handle_disconnect(&self, conn_id: u32, duration: &str);
}
