//! IHA relay library.
//!
//! Session-and-message relay between client processes and the embedded
//! app host on a secure co-processor. The daemon binary (`ihaproxyd`) is a
//! thin wiring layer over these modules; integration tests drive the same
//! stack against the simulated co-processor.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod applet;
pub mod config;
pub mod error;
pub mod relay;
pub mod rpc;
