//! Notification relay — out-of-band delivery of co-processor events.
//!
//! ```text
//!  AppletLink ──emit()──▶ RelaySink ──try_send──▶ EventQueue
//!                                                    │
//!                                   "iha-relay" thread ▼
//!                     registry.callback_for(app) ──▶ attach ─▶ on_event ─▶ detach
//! ```
//!
//! - `emit` never blocks the transport reader; a full queue drops the
//!   event and counts it.
//! - The handler is looked up at delivery time, so an event racing an
//!   unregistration is silently dropped.
//! - Each invocation is wrapped in an attach / detach pair on the caller
//!   runtime; detach runs even if the handler panics.
//! - Handler errors and panics are caught and logged here.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};

use crate::app::events::AppletEvent;
use crate::app::ports::{CallerRuntime, EventSink};
use crate::app::registry::SessionRegistry;
use crate::rpc::channels::{EventQueue, RelayMsg};

/// Delivery counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    delivered: AtomicU64,
    unbound: AtomicU64,
    overflowed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayCounters {
    pub delivered: u64,
    /// No handler bound at delivery time.
    pub unbound: u64,
    /// Queue was full when the event arrived.
    pub overflowed: u64,
    /// Handler returned an error or panicked, or attach failed.
    pub failed: u64,
}

impl RelayStats {
    pub fn counters(&self) -> RelayCounters {
        RelayCounters {
            delivered: self.delivered.load(Ordering::Relaxed),
            unbound: self.unbound.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// ── Sink side ────────────────────────────────────────────────

/// [`EventSink`] that enqueues for the relay thread.
pub struct RelaySink {
    queue: Arc<EventQueue>,
    stats: Arc<RelayStats>,
}

impl EventSink for RelaySink {
    fn emit(&self, event: AppletEvent) {
        let app = event.app.clone();
        if self.queue.try_send(RelayMsg::Deliver(event)).is_err() {
            self.stats.overflowed.fetch_add(1, Ordering::Relaxed);
            warn!("RELAY: queue full, dropping event for {}", app);
        }
    }
}

// ── Attach guard ─────────────────────────────────────────────

/// Detaches from the caller runtime when dropped.
struct Attached<'a>(&'a dyn CallerRuntime);

impl<'a> Attached<'a> {
    fn enter(runtime: &'a dyn CallerRuntime) -> anyhow::Result<Self> {
        runtime.attach()?;
        Ok(Self(runtime))
    }
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.0.detach();
    }
}

// ── Relay ────────────────────────────────────────────────────

pub struct NotificationRelay {
    queue: Arc<EventQueue>,
    stats: Arc<RelayStats>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationRelay {
    /// Spawn the relay thread.
    pub fn start(
        registry: Arc<SessionRegistry>,
        runtime: Arc<dyn CallerRuntime>,
    ) -> std::io::Result<Self> {
        let queue = Arc::new(EventQueue::new());
        let stats = Arc::new(RelayStats::default());

        let worker = {
            let queue = Arc::clone(&queue);
            let stats = Arc::clone(&stats);
            std::thread::Builder::new()
                .name("iha-relay".into())
                .spawn(move || run(&queue, &registry, runtime.as_ref(), &stats))?
        };

        info!("RELAY: started (queue depth {})", crate::rpc::channels::EVENT_DEPTH);
        Ok(Self {
            queue,
            stats,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Sink to hand to the co-processor link.
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::new(RelaySink {
            queue: Arc::clone(&self.queue),
            stats: Arc::clone(&self.stats),
        })
    }

    pub fn counters(&self) -> RelayCounters {
        self.stats.counters()
    }

    /// Stop the relay thread after it drains what is already queued.
    /// Idempotent.
    pub fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            futures_lite::future::block_on(self.queue.send(RelayMsg::Stop));
            if worker.join().is_err() {
                error!("RELAY: worker thread panicked");
            }
            info!("RELAY: stopped");
        }
    }
}

impl Drop for NotificationRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    queue: &EventQueue,
    registry: &SessionRegistry,
    runtime: &dyn CallerRuntime,
    stats: &RelayStats,
) {
    loop {
        match futures_lite::future::block_on(queue.receive()) {
            RelayMsg::Stop => break,
            RelayMsg::Deliver(event) => deliver(&event, registry, runtime, stats),
        }
    }
}

fn deliver(
    event: &AppletEvent,
    registry: &SessionRegistry,
    runtime: &dyn CallerRuntime,
    stats: &RelayStats,
) {
    let Some(handler) = registry.callback_for(&event.app) else {
        stats.unbound.fetch_add(1, Ordering::Relaxed);
        debug!("RELAY: no handler for {}, event dropped", event.app);
        return;
    };

    let _attached = match Attached::enter(runtime) {
        Ok(guard) => guard,
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!("RELAY: attach failed for {}: {:#}", event.app, e);
            return;
        }
    };

    match catch_unwind(AssertUnwindSafe(|| handler.handler().on_event(event))) {
        Ok(Ok(())) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(
                "RELAY: delivered {} B to {} (source {:?})",
                event.data.len(),
                event.app,
                event.source
            );
        }
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("RELAY: handler for {} failed: {:#}", event.app, e);
        }
        Err(_) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!("RELAY: handler for {} panicked", event.app);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::events::EventSource;
    use crate::app::ports::{HandlerRef, NativeRuntime};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingRuntime {
        attached: AtomicUsize,
        detached: AtomicUsize,
    }

    impl CallerRuntime for CountingRuntime {
        fn attach(&self) -> anyhow::Result<()> {
            self.attached.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn detach(&self) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn event(app: &str) -> AppletEvent {
        AppletEvent::new(app, vec![1, 2, 3], EventSource::Applet)
    }

    #[test]
    fn unbound_events_are_dropped() {
        let registry = SessionRegistry::new();
        let stats = RelayStats::default();
        deliver(&event("nobody"), &registry, &NativeRuntime, &stats);
        assert_eq!(stats.counters().unbound, 1);
        assert_eq!(stats.counters().delivered, 0);
    }

    #[test]
    fn panics_are_contained_and_detach_still_runs() {
        let registry = SessionRegistry::new();
        registry
            .bind_callback(
                "a",
                HandlerRef::new(|_: &AppletEvent| -> anyhow::Result<()> { panic!("boom") }),
            )
            .unwrap();
        let runtime = CountingRuntime::default();
        let stats = RelayStats::default();

        deliver(&event("a"), &registry, &runtime, &stats);

        assert_eq!(stats.counters().failed, 1);
        assert_eq!(runtime.attached.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.detached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_errors_are_counted() {
        let registry = SessionRegistry::new();
        registry
            .bind_callback(
                "a",
                HandlerRef::new(|_: &AppletEvent| Err(anyhow::anyhow!("rejected"))),
            )
            .unwrap();
        let stats = RelayStats::default();
        deliver(&event("a"), &registry, &NativeRuntime, &stats);
        assert_eq!(stats.counters().failed, 1);
    }

    #[test]
    fn relay_thread_delivers_and_stops() {
        let registry = Arc::new(SessionRegistry::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        registry
            .bind_callback(
                "a",
                HandlerRef::new(move |e: &AppletEvent| {
                    counter.fetch_add(e.data.len(), Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let relay = NotificationRelay::start(Arc::clone(&registry), Arc::new(NativeRuntime)).unwrap();
        let sink = relay.sink();
        sink.emit(event("a"));
        sink.emit(event("b"));
        relay.shutdown();

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        let c = relay.counters();
        assert_eq!(c.delivered, 1);
        assert_eq!(c.unbound, 1);
        relay.shutdown();
    }
}
