use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub name: String,
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAction {
    Wakeup,
    Shutdown,
}

impl RemoteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wakeup => "wakeup",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Frames pushed by the control server. Only `type` selects the variant;
/// heartbeat and flush frames may carry padding in `data`, which is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Envelope")]
pub enum Inbound {
    Config(serde_json::Value),
    Heartbeat,
    Flush,
    Wakeup(RemoteCommand),
    Shutdown(RemoteCommand),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl TryFrom<Envelope> for Inbound {
    type Error = serde_json::Error;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.kind.as_str() {
            "config" => Ok(Self::Config(envelope.data)),
            "heartbeat" => Ok(Self::Heartbeat),
            "flush" => Ok(Self::Flush),
            "wakeup" => serde_json::from_value(envelope.data).map(Self::Wakeup),
            "shutdown" => serde_json::from_value(envelope.data).map(Self::Shutdown),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["config", "heartbeat", "flush", "wakeup", "shutdown"],
            )),
        }
    }
}

impl Inbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Heartbeat => "heartbeat",
            Self::Flush => "flush",
            Self::Wakeup(_) => "wakeup",
            Self::Shutdown(_) => "shutdown",
        }
    }

    pub fn into_remote(self) -> Option<Remote> {
        match self {
            Self::Wakeup(command) => Some(Remote {
                action: RemoteAction::Wakeup,
                command,
            }),
            Self::Shutdown(command) => Some(Remote {
                action: RemoteAction::Shutdown,
                command,
            }),
            _ => None,
        }
    }
}

/// A wake/shutdown command forwarded from the server to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub action: RemoteAction,
    pub command: RemoteCommand,
}

/// Frames sent to the control server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Outbound {
    Report(BTreeMap<String, bool>),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_every_inbound_kind() {
        let heartbeat: Inbound = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(heartbeat, Inbound::Heartbeat);

        let padded: Inbound = serde_json::from_value(
            json!({"type": "heartbeat", "data": "0".repeat(256)}),
        )
        .unwrap();
        assert_eq!(padded, Inbound::Heartbeat);

        let flush: Inbound =
            serde_json::from_str(r#"{"type":"flush","data":"0000000000"}"#).unwrap();
        assert_eq!(flush, Inbound::Flush);

        let wakeup: Inbound =
            serde_json::from_str(r#"{"type":"wakeup","data":{"name":"A","time":1700000000}}"#)
                .unwrap();
        assert_eq!(
            wakeup.into_remote(),
            Some(Remote {
                action: RemoteAction::Wakeup,
                command: RemoteCommand {
                    name: "A".to_string(),
                    time: 1_700_000_000,
                },
            })
        );

        let config: Inbound =
            serde_json::from_value(json!({"type": "config", "data": {"devices": {}, "days": []}}))
                .unwrap();
        assert_eq!(config.kind(), "config");
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Inbound>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<Inbound>(r#"{"data":{}}"#).is_err());
        assert!(serde_json::from_str::<Inbound>(r#"{"type":"wakeup"}"#).is_err());
    }

    #[test]
    fn report_uses_type_data_envelope() {
        let mut status = BTreeMap::new();
        status.insert("A".to_string(), true);
        status.insert("nas".to_string(), false);

        let encoded = serde_json::to_value(Outbound::Report(status)).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "report", "data": {"A": true, "nas": false}})
        );
    }
}
