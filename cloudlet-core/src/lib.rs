//! Cloudlet overlay-synthesis client protocol.
//! One TCP connection per session: a sender streams overlay metadata and
//! on-demand segments, a receiver forwards server replies, and a session
//! driver runs the state machine between them.

pub mod ffi;
pub mod manifest;
pub mod protocol;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod value;
pub mod wire;

pub use manifest::{ManifestError, OverlayManifest, OverlaySource, SegmentFile};
pub use protocol::{ServerMessage, SessionId, SynthesisOptions, PROTOCOL_VERSION};
pub use session::{
    fetch_resource_info, SessionConfig, SessionEvent, SessionState, SynthesisError,
    SynthesisSession,
};
pub use value::{FieldError, Fields, Value};
pub use wire::{
    decode_fields, encode_fields, encode_frame, read_frame, FrameDecodeError, FrameEncodeError,
};
