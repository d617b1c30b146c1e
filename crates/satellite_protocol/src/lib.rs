//! # Satellite Protocol
//!
//! Wire protocol types and codecs for the satellite sync client.
//!
//! This crate provides:
//! - [`CausalityTag`] and [`VersionStamp`] for ordering writes
//! - [`Message`], the duplex wire message set
//! - [`FrameCodec`], a resumable length-prefixed CBOR frame codec
//! - [`MigrationRecord`], the unit of schema evolution
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Frame Format
//!
//! ```text
//! +----------------+--------+--------------------+
//! | length: u32 BE | kind:u8| payload: CBOR      |
//! +----------------+--------+--------------------+
//!                  |<------- length bytes ------>|
//! ```
//!
//! Frames of unknown kind are skipped so newer minor protocol versions can
//! add messages without breaking older clients.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod causality;
mod error;
mod frame;
mod message;
mod migration;

pub use causality::{Causality, CausalityTag, ReplicaId, VersionStamp};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{FrameCodec, DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_LEN};
pub use message::{
    Ack, Change, ChangeOp, ErrorCode, ErrorMessage, Hello, HelloAck, Message, MessageKind,
    ProtocolVersion, SubscribeAck, SubscribeRequest, WireTransaction,
};
pub use migration::MigrationRecord;
