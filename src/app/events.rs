//! Asynchronous notifications originated by the co-processor.
//!
//! The [`AppletLink`](crate::applet::AppletLink) decodes these from event
//! frames and pushes them through the [`EventSink`](super::ports::EventSink)
//! port. The [`NotificationRelay`](crate::relay::NotificationRelay) then
//! delivers them to whichever handler the registry holds for `app`.

use serde::{Deserialize, Serialize};

/// Who raised the event inside the co-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventSource {
    /// The embedded app itself.
    Applet = 0,
    /// The co-processor firmware on behalf of the app.
    Firmware = 1,
}

impl EventSource {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Applet),
            1 => Some(Self::Firmware),
            _ => None,
        }
    }
}

/// One notification addressed to an app identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppletEvent {
    pub app: String,
    pub data: Vec<u8>,
    pub source: EventSource,
}

impl AppletEvent {
    pub fn new(app: impl Into<String>, data: Vec<u8>, source: EventSource) -> Self {
        Self {
            app: app.into(),
            data,
            source,
        }
    }
}
