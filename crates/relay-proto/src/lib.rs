//! Wire envelopes exchanged between embedded content and the tracking host.
//! Both sides of the bridge depend on this crate for the message shape.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Tag carried in the `type` field of every command envelope.
pub const COMMAND_TAG: &str = "SCORM_COMMAND";
/// Tag carried in the `type` field of every acknowledgment envelope.
pub const ACK_TAG: &str = "SCORM_ACK";

/// Commands understood by the host. Unknown names survive decoding so the
/// host can still answer them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    SetCompletion,
    Ping,
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::SetCompletion => "setCompletion",
            Command::Ping => "ping",
            Command::Other(name) => name,
        }
    }
}

impl From<&str> for Command {
    fn from(value: &str) -> Self {
        match value {
            "setCompletion" => Command::SetCompletion,
            "ping" => Command::Ping,
            other => Command::Other(other.to_owned()),
        }
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        match value.as_str() {
            "setCompletion" => Command::SetCompletion,
            "ping" => Command::Ping,
            _ => Command::Other(value),
        }
    }
}

impl From<Command> for String {
    fn from(value: Command) -> Self {
        match value {
            Command::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-sender request identifier, echoed back by hosts that understand it.
///
/// Legacy hosts never echo it, in which case acknowledgments can only be
/// matched by command name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Builds an id of the form `msg_<unix-ms>_<sequence>`.
    pub fn compose(unix_ms: i64, sequence: u64) -> Self {
        CorrelationId(format!("msg_{unix_ms}_{sequence}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        CorrelationId(value.to_owned())
    }
}

/// Top-level cross-window message, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "SCORM_COMMAND")]
    Command(CommandEnvelope),
    #[serde(rename = "SCORM_ACK")]
    Ack(AckEnvelope),
}

impl Envelope {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl From<CommandEnvelope> for Envelope {
    fn from(value: CommandEnvelope) -> Self {
        Envelope::Command(value)
    }
}

impl From<AckEnvelope> for Envelope {
    fn from(value: AckEnvelope) -> Self {
        Envelope::Ack(value)
    }
}

/// Request sent from embedded content to its parent window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: Command,
    #[serde(default, deserialize_with = "object_or_empty")]
    pub data: Map<String, Value>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "loose_id"
    )]
    pub id: Option<CorrelationId>,
}

impl CommandEnvelope {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            data: Map::new(),
            id: None,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Serialises the command into its tagged wire form.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        Envelope::Command(self.clone()).to_value()
    }
}

/// Reply produced by the host for exactly one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckEnvelope {
    pub command: Command,
    pub success: bool,
    pub message: String,
    #[serde(
        rename = "scormAvailable",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub scorm_available: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "loose_id"
    )]
    pub id: Option<CorrelationId>,
}

impl AckEnvelope {
    pub fn new(command: Command, success: bool, message: impl Into<String>) -> Self {
        Self {
            command,
            success,
            message: message.into(),
            scorm_available: None,
            id: None,
        }
    }

    /// Answers `request`, echoing its command name and correlation id.
    pub fn reply_to(request: &CommandEnvelope, success: bool, message: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            ..Self::new(request.command.clone(), success, message)
        }
    }

    pub fn with_scorm_available(mut self, available: bool) -> Self {
        self.scorm_available = Some(available);
        self
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        Envelope::Ack(self.clone()).to_value()
    }
}

/// Result of looking at an arbitrary cross-window payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Not a bridge message at all (untagged or tagged for someone else).
    Foreign,
    /// Carries one of our tags but does not decode.
    Malformed { tag: &'static str, error: String },
    Envelope(Envelope),
}

/// Sorts an inbound payload into foreign traffic, malformed bridge traffic,
/// or a decoded envelope.
pub fn classify(value: &Value) -> Classified {
    let tag = match value.get("type").and_then(Value::as_str) {
        Some(COMMAND_TAG) => COMMAND_TAG,
        Some(ACK_TAG) => ACK_TAG,
        _ => return Classified::Foreign,
    };
    match serde_json::from_value::<Envelope>(value.clone()) {
        Ok(envelope) => Classified::Envelope(envelope),
        Err(err) => Classified::Malformed {
            tag,
            error: err.to_string(),
        },
    }
}

/// Anything other than a JSON object reads as no data at all.
fn object_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

/// Accepts string and numeric ids; any other shape means no id.
fn loose_id<'de, D>(deserializer: D) -> Result<Option<CorrelationId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(id) => Some(CorrelationId(id)),
        Value::Number(id) => Some(CorrelationId(id.to_string())),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ping_ack_matches_legacy_wire_shape() {
        let ack = AckEnvelope::new(Command::Ping, true, "pong").with_scorm_available(false);
        let value = ack.to_value().expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "SCORM_ACK",
                "command": "ping",
                "success": true,
                "message": "pong",
                "scormAvailable": false
            })
        );
    }

    #[test]
    fn legacy_command_without_id_decodes() {
        let raw = json!({
            "type": "SCORM_COMMAND",
            "command": "setCompletion",
            "data": { "status": "completed" }
        });
        match classify(&raw) {
            Classified::Envelope(Envelope::Command(cmd)) => {
                assert_eq!(cmd.command, Command::SetCompletion);
                assert_eq!(cmd.data.get("status"), Some(&json!("completed")));
                assert!(cmd.id.is_none());
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn reply_echoes_command_and_id() {
        let request = CommandEnvelope::new(Command::from("setScore"))
            .with_id(CorrelationId::compose(1_700_000_000_000, 7));
        let ack = AckEnvelope::reply_to(&request, false, "Unknown command: setScore");
        let value = ack.to_value().expect("serialize");
        assert_eq!(value["command"], json!("setScore"));
        assert_eq!(value["id"], json!("msg_1700000000000_7"));
        assert!(value.get("scormAvailable").is_none());
    }

    #[test]
    fn foreign_and_malformed_traffic_are_distinguished() {
        assert_eq!(classify(&json!({"type": "resize", "h": 10})), Classified::Foreign);
        assert_eq!(classify(&json!("hello")), Classified::Foreign);
        assert_eq!(classify(&Value::Null), Classified::Foreign);

        match classify(&json!({"type": "SCORM_COMMAND"})) {
            Classified::Malformed { tag, .. } => assert_eq!(tag, COMMAND_TAG),
            other => panic!("expected malformed, got {other:?}"),
        }
        match classify(&json!({"type": "SCORM_ACK", "command": "ping"})) {
            Classified::Malformed { tag, .. } => assert_eq!(tag, ACK_TAG),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn null_data_is_treated_as_empty() {
        let raw = json!({"type": "SCORM_COMMAND", "command": "ping", "data": null});
        let Classified::Envelope(Envelope::Command(cmd)) = classify(&raw) else {
            panic!("expected command");
        };
        assert!(cmd.data.is_empty());
    }

    #[test]
    fn mistyped_optional_fields_do_not_hide_the_command() {
        for data in [json!("x"), json!([1, 2]), json!(3)] {
            let raw = json!({"type": "SCORM_COMMAND", "command": "setCompletion", "data": data});
            let Classified::Envelope(Envelope::Command(cmd)) = classify(&raw) else {
                panic!("expected command for data {data}");
            };
            assert_eq!(cmd.command, Command::SetCompletion);
            assert!(cmd.data.is_empty());
        }

        let raw = json!({"type": "SCORM_COMMAND", "command": "ping", "id": 42});
        let Classified::Envelope(Envelope::Command(cmd)) = classify(&raw) else {
            panic!("expected command");
        };
        assert_eq!(cmd.id, Some(CorrelationId::from("42")));
        assert_eq!(AckEnvelope::reply_to(&cmd, true, "pong").id, cmd.id);

        let raw = json!({"type": "SCORM_COMMAND", "command": "ping", "id": {"n": 1}});
        let Classified::Envelope(Envelope::Command(cmd)) = classify(&raw) else {
            panic!("expected command");
        };
        assert!(cmd.id.is_none());
    }

    #[test]
    fn ack_with_numeric_id_decodes() {
        let raw = json!({
            "type": "SCORM_ACK",
            "command": "ping",
            "success": true,
            "message": "pong",
            "id": 7
        });
        let Classified::Envelope(Envelope::Ack(ack)) = classify(&raw) else {
            panic!("expected ack");
        };
        assert_eq!(ack.id, Some(CorrelationId::from("7")));
    }

    #[test]
    fn unknown_command_names_survive_round_trip() {
        let cmd = Command::from("setSuspendData".to_string());
        assert_eq!(cmd, Command::Other("setSuspendData".into()));
        assert_eq!(String::from(cmd), "setSuspendData");
        assert_eq!(Command::from("ping"), Command::Ping);
    }
}
