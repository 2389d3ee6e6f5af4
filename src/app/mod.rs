//! Application core: session bookkeeping and the operation surface.
//!
//! Everything the dispatcher calls goes through the [`ports::IhaOperations`]
//! trait. [`service::SessionService`] implements it on top of the
//! [`registry::SessionRegistry`] and the applet link, so the dispatcher and
//! its tests never touch a transport directly.

pub mod events;
pub mod ports;
pub mod registry;
pub mod service;
