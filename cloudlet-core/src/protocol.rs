//! Synthesis protocol: command codes, field keys, and message shapes.

use std::fmt;

use thiserror::Error;

use crate::value::{FieldError, Fields, Value};

/// Protocol revision announced in session-create.
pub const PROTOCOL_VERSION: i64 = 1;

/// Command codes. Client-to-server commands sit in the 0x10 range,
/// server-to-client replies in the low range.
pub mod command {
    pub const SEND_META: i128 = 0x11;
    pub const SEND_SEGMENT: i128 = 0x12;
    pub const FINISH: i128 = 0x13;
    pub const GET_RESOURCE_INFO: i128 = 0x14;
    pub const SESSION_CREATE: i128 = 0x15;
    pub const SESSION_CLOSE: i128 = 0x16;

    pub const SUCCESS: i128 = 0x01;
    pub const FAILED: i128 = 0x02;
    pub const ON_DEMAND_SEGMENT: i128 = 0x03;
    pub const SYNTHESIS_DONE: i128 = 0x04;
}

/// Header field keys.
pub mod key {
    pub const COMMAND: &str = "command";
    pub const PROTOCOL_VERSION: &str = "protocol_version";
    pub const SESSION_ID: &str = "session_id";
    pub const META_SIZE: &str = "meta_size";
    pub const SEGMENT_URI: &str = "blob_uri";
    pub const SEGMENT_SIZE: &str = "blob_size";
    pub const SYNTHESIS_OPTION: &str = "synthesis_option";
    pub const REASONS: &str = "reasons";
    pub const PAYLOAD: &str = "payload";
    pub const MEASUREMENT: &str = "measurement";
}

/// Keys inside the `synthesis_option` map.
pub mod option_key {
    pub const DISPLAY_VNC: &str = "option_display_vnc";
    pub const EARLY_START: &str = "option_early_start";
    pub const SHOW_STATISTICS: &str = "option_show_statistics";
}

/// Server-assigned token correlating every message of one synthesis attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub i128);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Toggles forwarded to the server uninterpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisOptions {
    pub display_vnc: bool,
    pub early_start: bool,
    pub show_statistics: bool,
}

impl SynthesisOptions {
    pub fn to_fields(self) -> Fields {
        Fields::new()
            .with(option_key::DISPLAY_VNC, self.display_vnc)
            .with(option_key::EARLY_START, self.early_start)
            .with(option_key::SHOW_STATISTICS, self.show_statistics)
    }
}

pub fn session_create() -> Fields {
    Fields::new()
        .with(key::COMMAND, Value::Int(command::SESSION_CREATE))
        .with(key::PROTOCOL_VERSION, PROTOCOL_VERSION)
}

pub fn session_close(session_id: SessionId) -> Fields {
    Fields::new()
        .with(key::COMMAND, Value::Int(command::SESSION_CLOSE))
        .with(key::SESSION_ID, Value::Int(session_id.0))
}

/// Header announcing the overlay metadata payload that follows it.
pub fn send_meta(session_id: SessionId, meta_size: u64, options: SynthesisOptions) -> Fields {
    Fields::new()
        .with(key::COMMAND, Value::Int(command::SEND_META))
        .with(key::SESSION_ID, Value::Int(session_id.0))
        .with(key::META_SIZE, meta_size)
        .with(key::SYNTHESIS_OPTION, options.to_fields())
}

/// Header announcing one segment payload that follows it.
pub fn send_segment(session_id: SessionId, name: &str, size: u64) -> Fields {
    Fields::new()
        .with(key::COMMAND, Value::Int(command::SEND_SEGMENT))
        .with(key::SESSION_ID, Value::Int(session_id.0))
        .with(key::SEGMENT_URI, name)
        .with(key::SEGMENT_SIZE, size)
}

pub fn finish(session_id: SessionId, measurement: Option<&str>) -> Fields {
    let mut fields = Fields::new()
        .with(key::COMMAND, Value::Int(command::FINISH))
        .with(key::SESSION_ID, Value::Int(session_id.0));
    if let Some(measurement) = measurement {
        fields.insert(key::MEASUREMENT, measurement);
    }
    fields
}

pub fn get_resource_info() -> Fields {
    Fields::new().with(key::COMMAND, Value::Int(command::GET_RESOURCE_INFO))
}

/// One inbound message, decoded into its typed shape exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Acknowledgment. `payload` carries command-specific data: the resource
    /// query answers here, and session-create returns the assigned id.
    Success {
        session_id: Option<SessionId>,
        payload: Option<Value>,
    },
    Failed {
        reasons: String,
    },
    /// Request to stream the named segment next.
    OnDemandSegment {
        name: String,
        size: u64,
    },
    SynthesisDone,
}

impl ServerMessage {
    pub fn from_fields(fields: &Fields) -> Result<Self, ProtocolError> {
        match fields.require_int(key::COMMAND)? {
            command::SUCCESS => {
                let session_id = match fields.get(key::SESSION_ID) {
                    Some(_) => Some(SessionId(fields.require_int(key::SESSION_ID)?)),
                    None => None,
                };
                Ok(ServerMessage::Success {
                    session_id,
                    payload: fields.get(key::PAYLOAD).cloned(),
                })
            }
            command::FAILED => Ok(ServerMessage::Failed {
                reasons: fields.require_str(key::REASONS)?.to_owned(),
            }),
            command::ON_DEMAND_SEGMENT => Ok(ServerMessage::OnDemandSegment {
                name: fields.require_str(key::SEGMENT_URI)?.to_owned(),
                size: fields.require_u64(key::SEGMENT_SIZE)?,
            }),
            command::SYNTHESIS_DONE => Ok(ServerMessage::SynthesisDone),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Command code this client does not know. Skippable by itself; the
    /// stream remains frame-aligned.
    #[error("unknown command code {0:#x}")]
    UnknownCommand(i128),
    /// A known command missing or mistyping a required field.
    #[error(transparent)]
    Field(#[from] FieldError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_meta_carries_options_map() {
        let options = SynthesisOptions {
            display_vnc: true,
            early_start: false,
            show_statistics: true,
        };
        let fields = send_meta(SessionId(42), 1024, options);
        assert_eq!(fields.require_int(key::COMMAND).unwrap(), command::SEND_META);
        assert_eq!(fields.require_int(key::SESSION_ID).unwrap(), 42);
        assert_eq!(fields.require_u64(key::META_SIZE).unwrap(), 1024);
        let opts = fields.require_map(key::SYNTHESIS_OPTION).unwrap();
        assert!(opts.require_bool(option_key::DISPLAY_VNC).unwrap());
        assert!(!opts.require_bool(option_key::EARLY_START).unwrap());
        assert!(opts.require_bool(option_key::SHOW_STATISTICS).unwrap());
    }

    #[test]
    fn finish_includes_measurement_only_when_present() {
        let bare = finish(SessionId(7), None);
        assert!(!bare.contains(key::MEASUREMENT));
        let with = finish(SessionId(7), Some("{\"elapsed_ms\":12}"));
        assert_eq!(
            with.require_str(key::MEASUREMENT).unwrap(),
            "{\"elapsed_ms\":12}"
        );
    }

    #[test]
    fn session_close_names_the_session() {
        let fields = session_close(SessionId(99));
        assert_eq!(
            fields.require_int(key::COMMAND).unwrap(),
            command::SESSION_CLOSE
        );
        assert_eq!(fields.require_int(key::SESSION_ID).unwrap(), 99);
    }

    #[test]
    fn success_reply_decodes_optional_parts() {
        let fields = Fields::new()
            .with(key::COMMAND, Value::Int(command::SUCCESS))
            .with(key::SESSION_ID, 1234i64);
        match ServerMessage::from_fields(&fields).unwrap() {
            ServerMessage::Success { session_id, payload } => {
                assert_eq!(session_id, Some(SessionId(1234)));
                assert!(payload.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn on_demand_request_decodes_name_and_size() {
        let fields = Fields::new()
            .with(key::COMMAND, Value::Int(command::ON_DEMAND_SEGMENT))
            .with(key::SEGMENT_URI, "disk-overlay-3")
            .with(key::SEGMENT_SIZE, 8192u64);
        assert_eq!(
            ServerMessage::from_fields(&fields).unwrap(),
            ServerMessage::OnDemandSegment {
                name: "disk-overlay-3".into(),
                size: 8192,
            }
        );
    }

    #[test]
    fn failed_without_reasons_is_a_field_error() {
        let fields = Fields::new().with(key::COMMAND, Value::Int(command::FAILED));
        assert!(matches!(
            ServerMessage::from_fields(&fields),
            Err(ProtocolError::Field(FieldError::Missing(_)))
        ));
    }

    #[test]
    fn unknown_command_is_its_own_error() {
        let fields = Fields::new().with(key::COMMAND, Value::Int(0x7f));
        assert!(matches!(
            ServerMessage::from_fields(&fields),
            Err(ProtocolError::UnknownCommand(0x7f))
        ));
    }
}
