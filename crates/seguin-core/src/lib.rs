pub mod client_messages;
pub mod loom_protocol;
pub mod pattern;
pub mod pattern_store;
pub mod wif;

pub use client_messages::{
    parse_client_command, ClientCommand, ClientMessageError, ClientReply, ConnectionState,
    MessageSeverity,
};
pub use loom_protocol::{LoomCommand, LoomReply, ProtocolError, StatusWord};
pub use pattern::{Pick, ReducedPattern, SequenceError};
pub use pattern_store::{PatternStore, MAX_PATTERNS};
