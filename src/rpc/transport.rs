//! Transport abstraction — the point-to-point channel to the co-processor.
//!
//! Concrete implementations:
//! - MEI character device (`adapters::mei`, Linux / Android)
//! - In-process simulated co-processor (`adapters::sim`)
//!
//! The applet link is generic over `Transport`, so adding a new channel
//! requires zero changes to the session logic. Each `send` / `receive` is
//! one fixed-size message of at most the length negotiated on connect;
//! framing across messages is the link's job.

use uuid::Uuid;

/// Message channel addressed by a 128-bit client identifier.
pub trait Transport: Send {
    /// Error type for this transport.
    type Error: core::fmt::Debug;

    /// Connect to the logical client `client`. Returns the maximum
    /// message length the channel accepts.
    fn connect(&mut self, client: &Uuid) -> Result<usize, Self::Error>;

    /// Send one message. Returns the number of bytes accepted.
    fn send(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Receive one message into `buf`, blocking until one arrives.
    /// Returns the number of bytes received; 0 means the peer is gone.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Check if a message is ready without blocking.
    fn available(&self) -> bool;

    /// Tear the connection down. Safe to call when not connected.
    fn disconnect(&mut self);
}

/// A transport whose co-processor is never reachable.
/// Useful as a default when no device is configured.
pub struct NullTransport;

impl Transport for NullTransport {
    type Error = ();

    fn connect(&mut self, _client: &Uuid) -> Result<usize, ()> {
        Err(())
    }

    fn send(&mut self, _data: &[u8]) -> Result<usize, ()> {
        Err(())
    }

    fn receive(&mut self, _buf: &mut [u8]) -> Result<usize, ()> {
        Ok(0)
    }

    fn available(&self) -> bool {
        false
    }

    fn disconnect(&mut self) {}
}
