//! Wire-level building blocks for the local rich-presence IPC protocol.
//!
//! This crate provides:
//! - Length-prefixed frame encoding and incremental decoding ([`frame`])
//! - RPC message shapes exchanged inside data frames ([`message`])
//! - Remote status model and `SET_ACTIVITY` argument mapping ([`presence`])
//! - Protocol constants and the [`Ref`] identifier type ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod frame;
pub mod message;
pub mod presence;
pub mod types;

pub use frame::{Frame, FrameDecoder, FrameError, Opcode};
pub use message::{RpcMessage, User};
pub use presence::{Presence, RemoteStatus};
pub use types::Ref;
