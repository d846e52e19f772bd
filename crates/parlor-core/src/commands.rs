//! Messages carried over the command queue between the hub and the worker pool.

use serde::{Deserialize, Serialize};

use crate::ids::RoomId;

/// Name the assistant posts under.
pub const ASSISTANT_NAME: &str = "assistant";

/// A command issued by a user, published by the hub and consumed by one worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInput {
    #[serde(rename = "roomID")]
    pub room_id: RoomId,
    pub from: String,
    #[serde(rename = "commandName")]
    pub command_name: String,
    pub command: String,
}

/// The assistant's reply, published by a worker and rebroadcast by the hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    #[serde(rename = "roomID")]
    pub room_id: RoomId,
    pub from: String,
    pub message: String,
}

impl CommandOutput {
    pub fn from_assistant(room_id: RoomId, message: impl Into<String>) -> Self {
        Self {
            room_id,
            from: ASSISTANT_NAME.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_wire_names() {
        let raw = r#"{"roomID":1,"from":"user","commandName":"stock","command":"amzn.us"}"#;
        let input: CommandInput = serde_json::from_str(raw).unwrap();
        assert_eq!(input.room_id, RoomId(1));
        assert_eq!(input.command_name, "stock");
        assert_eq!(input.command, "amzn.us");
    }

    #[test]
    fn output_wire_shape() {
        let out = CommandOutput::from_assistant(RoomId(1), "command executed");
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            r#"{"roomID":1,"from":"assistant","message":"command executed"}"#
        );
    }
}
