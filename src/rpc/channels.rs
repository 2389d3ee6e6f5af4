//! Inter-thread queues.
//!
//! Uses `embassy-sync` bounded MPMC channels to bridge the IPC substrate
//! with the dispatcher workers, and the co-processor reader with the
//! notification relay. Each reply travels back on its own `Signal`.
//! A channel wakes only one waiter per direction; the pool takes turns on
//! the job queue (see `pool::JobLane`).
//!
//! ```text
//! ┌──────────────┐    Job      ┌──────────────┐
//! │ IPC endpoint │────────────▶│ Worker pool  │
//! │              │◀────────────│ (RpcEngine)  │
//! └──────────────┘ ReplySignal └──────────────┘
//!
//! ┌──────────────┐ RelayMsg    ┌──────────────┐
//! │ AppletLink   │────────────▶│ Relay worker │──▶ EventHandler
//! └──────────────┘             └──────────────┘
//! ```

use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use crate::app::events::AppletEvent;
use crate::app::ports::Caller;

use super::parcel::Parcel;

/// Channel depth for inbound transactions.
pub const JOB_DEPTH: usize = 32;

/// Channel depth for pending notifications.
pub const EVENT_DEPTH: usize = 64;

/// Completion slot for one transaction.
pub type ReplySignal = Signal<CriticalSectionRawMutex, Parcel>;

/// One inbound transaction, delivered to a worker.
pub struct Job {
    /// Which process sent this call.
    pub caller: Caller,
    pub code: u32,
    pub data: Parcel,
    pub reply: Arc<ReplySignal>,
}

pub enum WorkerMsg {
    Call(Job),
    Stop,
}

pub type JobQueue = Channel<CriticalSectionRawMutex, WorkerMsg, JOB_DEPTH>;

pub enum RelayMsg {
    Deliver(AppletEvent),
    Stop,
}

pub type EventQueue = Channel<CriticalSectionRawMutex, RelayMsg, EVENT_DEPTH>;
