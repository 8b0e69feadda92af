use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{error::CommandError, reminder::ReminderTime};

pub const MAX_COMMAND_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reboot,
    ToggleLight,
    SetLight { on: bool },
    SetReminder { times: Vec<ReminderTime> },
    ClearReminders,
    PublishNow,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reboot => "REBOOT",
            Self::ToggleLight => "TOGGLE_LIGHT",
            Self::SetLight { .. } => "SET_LIGHT",
            Self::SetReminder { .. } => "SET_REMINDER",
            Self::ClearReminders => "CLEAR_REMINDERS",
            Self::PublishNow => "PUBLISH_NOW",
        }
    }
}

/// Wire envelope on the command topic.
#[derive(Debug, Deserialize)]
pub struct CommandMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "authToken", default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetLightPayload {
    on: bool,
}

#[derive(Debug, Deserialize)]
struct SetReminderPayload {
    times: Vec<String>,
}

impl CommandMessage {
    /// Decodes, authenticates and validates one inbound message.
    ///
    /// The token is checked before the payload is interpreted. An empty
    /// `secret` rejects every message.
    pub fn parse(bytes: &[u8], secret: &str) -> Result<Command, CommandError> {
        if bytes.len() > MAX_COMMAND_BYTES {
            return Err(CommandError::Oversized(bytes.len()));
        }
        let text = std::str::from_utf8(bytes).map_err(|_| CommandError::NotUtf8)?;
        let message: CommandMessage = serde_json::from_str(text)?;

        if !token_matches(message.auth_token.as_deref(), secret) {
            return Err(CommandError::Unauthorized);
        }

        message.into_command()
    }

    fn into_command(self) -> Result<Command, CommandError> {
        let command = match self.kind.as_str() {
            "REBOOT" => Command::Reboot,
            "TOGGLE_LIGHT" => Command::ToggleLight,
            "SET_LIGHT" => {
                let payload: SetLightPayload = payload_as(self.payload)?;
                Command::SetLight { on: payload.on }
            }
            "SET_REMINDER" => {
                let payload: SetReminderPayload = payload_as(self.payload)?;
                let times = payload
                    .times
                    .iter()
                    .map(|value| value.parse::<ReminderTime>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| CommandError::InvalidPayload(err.to_string()))?;
                Command::SetReminder { times }
            }
            "CLEAR_REMINDERS" => Command::ClearReminders,
            "PUBLISH_NOW" => Command::PublishNow,
            _ => return Err(CommandError::UnknownType(self.kind)),
        };
        Ok(command)
    }
}

fn payload_as<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, CommandError> {
    serde_json::from_value(payload).map_err(|err| CommandError::InvalidPayload(err.to_string()))
}

fn token_matches(presented: Option<&str>, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(presented) = presented else {
        return false;
    };
    // Fixed-length digests keep the comparison independent of token length.
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(secret.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0_u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SECRET: &str = "s3cret-token";

    fn parse(json: &str) -> Result<Command, CommandError> {
        CommandMessage::parse(json.as_bytes(), SECRET)
    }

    #[test]
    fn parses_every_command_type() {
        let cases = [
            (r#"{"type":"REBOOT","authToken":"s3cret-token"}"#, Command::Reboot),
            (
                r#"{"type":"TOGGLE_LIGHT","payload":{},"authToken":"s3cret-token"}"#,
                Command::ToggleLight,
            ),
            (
                r#"{"type":"SET_LIGHT","payload":{"on":true},"authToken":"s3cret-token"}"#,
                Command::SetLight { on: true },
            ),
            (
                r#"{"type":"CLEAR_REMINDERS","authToken":"s3cret-token"}"#,
                Command::ClearReminders,
            ),
            (
                r#"{"type":"PUBLISH_NOW","payload":null,"authToken":"s3cret-token"}"#,
                Command::PublishNow,
            ),
        ];

        for (json, expected) in cases {
            assert_eq!(parse(json).unwrap(), expected, "{json}");
        }
    }

    #[test]
    fn parses_reminder_times() {
        let command = parse(
            r#"{"type":"SET_REMINDER","payload":{"times":["08:00","21:30"]},"authToken":"s3cret-token"}"#,
        )
        .unwrap();

        assert_eq!(
            command,
            Command::SetReminder {
                times: vec![ReminderTime::new(8, 0).unwrap(), ReminderTime::new(21, 30).unwrap()],
            }
        );
    }

    #[test]
    fn rejects_wrong_or_missing_token() {
        assert!(matches!(
            parse(r#"{"type":"REBOOT","authToken":"guess"}"#),
            Err(CommandError::Unauthorized)
        ));
        assert!(matches!(
            parse(r#"{"type":"REBOOT"}"#),
            Err(CommandError::Unauthorized)
        ));
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let result = CommandMessage::parse(br#"{"type":"REBOOT","authToken":""}"#, "");
        assert!(matches!(result, Err(CommandError::Unauthorized)));
    }

    #[test]
    fn token_is_checked_before_payload() {
        assert!(matches!(
            parse(r#"{"type":"SET_LIGHT","payload":{"on":"yes"},"authToken":"nope"}"#),
            Err(CommandError::Unauthorized)
        ));
        assert!(matches!(
            parse(r#"{"type":"SELF_DESTRUCT","authToken":"nope"}"#),
            Err(CommandError::Unauthorized)
        ));
    }

    #[test]
    fn rejects_bad_envelopes() {
        let oversized = format!(
            r#"{{"type":"REBOOT","authToken":"s3cret-token","pad":"{}"}}"#,
            "x".repeat(MAX_COMMAND_BYTES)
        );
        assert!(matches!(parse(&oversized), Err(CommandError::Oversized(_))));

        assert!(matches!(
            CommandMessage::parse(&[0x7b, 0xff, 0xfe, 0x7d], SECRET),
            Err(CommandError::NotUtf8)
        ));
        assert!(matches!(parse("{not json"), Err(CommandError::Malformed(_))));
        assert!(matches!(
            parse(r#"{"payload":{},"authToken":"s3cret-token"}"#),
            Err(CommandError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_invalid_payloads() {
        assert!(matches!(
            parse(r#"{"type":"SELF_DESTRUCT","authToken":"s3cret-token"}"#),
            Err(CommandError::UnknownType(kind)) if kind == "SELF_DESTRUCT"
        ));
        assert!(matches!(
            parse(r#"{"type":"SET_LIGHT","authToken":"s3cret-token"}"#),
            Err(CommandError::InvalidPayload(_))
        ));
        assert!(matches!(
            parse(r#"{"type":"SET_REMINDER","payload":{"times":["8am"]},"authToken":"s3cret-token"}"#),
            Err(CommandError::InvalidPayload(_))
        ));
    }
}
