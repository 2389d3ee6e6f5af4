//! IPC surface of the relay.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RPC Stack                            │
//! │                                                             │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────────────────────┐ │
//! │  │ Remote   │──▶│  Parcel  │──▶│ ServerPool ─▶ RpcEngine  │ │
//! │  │ (client) │   │(envelope)│   │  (workers)   (dispatch)  │ │
//! │  └──────────┘   └──────────┘   └──────────────────────────┘ │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      IhaOperations (port)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `codec` and `transport` are shared with the co-processor link: the same
//! length-prefixed framing runs over the socket and the device channel.

pub mod channels;
pub mod client;
pub mod codec;
pub mod engine;
pub mod messages;
pub mod negotiate;
pub mod opcode;
pub mod parcel;
pub mod pool;
pub mod transport;
