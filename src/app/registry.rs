//! Session registry — the authoritative map from app identifier to session.
//!
//! Two levels of locking:
//!
//! - a table lock guards the map itself and is only held long enough to
//!   find or insert a row;
//! - each row has its own mutex, held for the whole of a read-modify-write
//!   (including any co-processor round trip), so mutating calls on one app
//!   are serialized while different apps proceed independently.
//!
//! Lock order is row → table (a row that retires itself unlinks from the
//! table while still locked); the table lock is never held while waiting
//! for a row. A caller that was waiting on a row which got retired in the
//! meantime sees the `removed` mark and retries on a fresh row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::error::Status;

use super::ports::HandlerRef;

/// Maximum app identifier length in bytes.
pub const APP_NAME_MAX_LEN: usize = 32;

/// Sharing flag values reported with an instance token.
pub const NON_SHARED: u32 = 0;
pub const SHARED: u32 = 1;

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Session row ──────────────────────────────────────────────

/// Mutable state of one app identifier.
#[derive(Debug)]
pub struct SessionEntry {
    app: String,
    /// Active provisioning handle, if any.
    pub provisioning: Option<u32>,
    /// A session with the app is open on the co-processor.
    pub loaded: bool,
    /// Link epoch the session was opened under.
    pub opened_on: u64,
    pub shared: bool,
    callback: Option<HandlerRef>,
    /// Instance token issued for this row, if any.
    pub instance: Option<u32>,
    /// Process that started the instance (instance API only).
    pub owner_pid: Option<u32>,
    removed: bool,
    retire: bool,
}

impl SessionEntry {
    fn new(app: &str) -> Self {
        Self {
            app: app.to_owned(),
            provisioning: None,
            loaded: false,
            opened_on: 0,
            shared: true,
            callback: None,
            instance: None,
            owner_pid: None,
            removed: false,
            retire: false,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn callback(&self) -> Option<&HandlerRef> {
        self.callback.as_ref()
    }

    /// Check whether `handler` could be bound without changing anything.
    ///
    /// `Ok(true)` means it is already bound (idempotent re-bind).
    pub fn check_bind(&self, handler: &HandlerRef) -> Result<bool, Status> {
        match &self.callback {
            Some(existing) if existing.same_as(handler) => Ok(true),
            Some(_) => Err(Status::AlreadyRegistered),
            None => Ok(false),
        }
    }

    /// Bind a callback. Converts the session to exclusive.
    pub fn bind_callback(&mut self, handler: HandlerRef) -> Result<(), Status> {
        if self.check_bind(&handler)? {
            return Ok(());
        }
        self.callback = Some(handler);
        self.shared = false;
        Ok(())
    }

    /// Release the callback. The strong reference is dropped exactly once.
    pub fn unbind_callback(&mut self) -> Option<HandlerRef> {
        self.callback.take()
    }

    /// Record a new provisioning handle; one may be active at a time.
    pub fn begin_provisioning(&mut self, handle: u32) -> Result<(), Status> {
        if self.provisioning.is_some() {
            return Err(Status::InvalidRequest);
        }
        self.provisioning = Some(handle);
        Ok(())
    }

    /// Check `handle` names the active provisioning session.
    pub fn expect_provisioning(&self, handle: u32) -> Result<(), Status> {
        match self.provisioning {
            Some(active) if active == handle => Ok(()),
            _ => Err(Status::InvalidRequest),
        }
    }

    pub fn end_provisioning(&mut self) -> Option<u32> {
        self.provisioning.take()
    }

    /// Mark the row for removal once the current update completes.
    pub fn retire(&mut self) {
        self.retire = true;
    }

    fn is_vacant(&self) -> bool {
        !self.loaded
            && self.provisioning.is_none()
            && self.callback.is_none()
            && self.instance.is_none()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            app: self.app.clone(),
            provisioning: self.provisioning,
            loaded: self.loaded,
            shared: self.shared,
            has_callback: self.callback.is_some(),
            instance: self.instance,
        }
    }

    /// Drop everything the row holds. Returns the released callback.
    fn clear(&mut self) -> Option<HandlerRef> {
        self.provisioning = None;
        self.loaded = false;
        self.instance = None;
        self.owner_pid = None;
        self.removed = true;
        self.callback.take()
    }
}

/// Read-only copy of a row, safe to hold without locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub app: String,
    pub provisioning: Option<u32>,
    pub loaded: bool,
    pub shared: bool,
    pub has_callback: bool,
    pub instance: Option<u32>,
}

/// What an instance token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub app: String,
    pub owner_pid: u32,
}

type Row = Arc<Mutex<SessionEntry>>;

// ── Registry ─────────────────────────────────────────────────

pub struct SessionRegistry {
    table: Mutex<HashMap<String, Row>>,
    instances: Mutex<HashMap<u32, InstanceRecord>>,
    next_instance: AtomicU32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            next_instance: AtomicU32::new(1),
        }
    }

    fn row(&self, app: &str, create: bool) -> Option<Row> {
        let mut table = relock(&self.table);
        if let Some(row) = table.get(app) {
            return Some(Arc::clone(row));
        }
        if !create {
            return None;
        }
        debug!("REG: new session row for {}", app);
        let row = Arc::new(Mutex::new(SessionEntry::new(app)));
        table.insert(app.to_owned(), Arc::clone(&row));
        Some(row)
    }

    /// Run `f` on the row for `app` with the row locked, creating the row
    /// if needed. Rows left vacant or retired by `f` are unlinked.
    pub fn with_entry<R>(&self, app: &str, f: impl FnOnce(&mut SessionEntry) -> R) -> R {
        loop {
            let Some(row) = self.row(app, true) else {
                continue;
            };
            let mut entry = relock(&row);
            if entry.removed {
                continue;
            }
            let out = f(&mut entry);
            self.settle(&row, &mut entry);
            return out;
        }
    }

    /// Like [`with_entry`](Self::with_entry) but never creates a row.
    pub fn with_existing<R>(&self, app: &str, f: impl FnOnce(&mut SessionEntry) -> R) -> Option<R> {
        loop {
            let row = self.row(app, false)?;
            let mut entry = relock(&row);
            if entry.removed {
                continue;
            }
            let out = f(&mut entry);
            self.settle(&row, &mut entry);
            return Some(out);
        }
    }

    fn settle(&self, row: &Row, entry: &mut SessionEntry) {
        if !(entry.retire || entry.is_vacant()) {
            return;
        }
        if let Some(id) = entry.instance {
            relock(&self.instances).remove(&id);
        }
        let released = entry.clear();
        let mut table = relock(&self.table);
        if table.get(&entry.app).is_some_and(|r| Arc::ptr_eq(r, row)) {
            table.remove(&entry.app);
        }
        drop(table);
        if released.is_some() {
            debug!("REG: {} removed, callback released", entry.app);
        }
    }

    /// Return the current state of `app`, creating an empty row if needed.
    ///
    /// An empty row is vacant, so it is unlinked again right away; the
    /// snapshot is still a faithful "fresh session".
    pub fn get_or_create(&self, app: &str) -> SessionSnapshot {
        self.with_entry(app, |e| e.snapshot())
    }

    pub fn snapshot(&self, app: &str) -> Option<SessionSnapshot> {
        self.with_existing(app, |e| e.snapshot())
    }

    /// Bind `handler` to `app`. Same handler again is a no-op success; a
    /// different handler is `AlreadyRegistered`.
    pub fn bind_callback(&self, app: &str, handler: HandlerRef) -> Result<(), Status> {
        self.with_entry(app, |e| e.bind_callback(handler))
    }

    /// Clear the callback binding; provisioning state is untouched.
    pub fn unbind_callback(&self, app: &str) {
        let released = self.with_existing(app, SessionEntry::unbind_callback).flatten();
        drop(released);
    }

    /// Release everything held for `app`. Returns whether a row existed.
    pub fn remove(&self, app: &str) -> bool {
        self.with_existing(app, SessionEntry::retire).is_some()
    }

    pub fn set_provisioning(&self, app: &str, handle: u32) -> Result<(), Status> {
        self.with_entry(app, |e| e.begin_provisioning(handle))
    }

    pub fn clear_provisioning(&self, app: &str) -> Option<u32> {
        self.with_existing(app, SessionEntry::end_provisioning).flatten()
    }

    /// Handler currently bound to `app`, looked up at delivery time.
    pub fn callback_for(&self, app: &str) -> Option<HandlerRef> {
        self.with_existing(app, |e| e.callback().cloned()).flatten()
    }

    /// Issue (or return the existing) instance token for the locked row.
    pub fn issue_instance(&self, entry: &mut SessionEntry, owner_pid: u32) -> u32 {
        if let Some(id) = entry.instance {
            return id;
        }
        let id = self.next_instance.fetch_add(1, Ordering::Relaxed);
        entry.instance = Some(id);
        entry.owner_pid = Some(owner_pid);
        relock(&self.instances).insert(
            id,
            InstanceRecord {
                app: entry.app.clone(),
                owner_pid,
            },
        );
        id
    }

    pub fn resolve_instance(&self, id: u32) -> Option<InstanceRecord> {
        relock(&self.instances).get(&id).cloned()
    }

    /// Force-clear every row. Returns what was loaded so the caller can
    /// close sessions best-effort; callbacks are released here.
    pub fn drain(&self) -> Vec<SessionSnapshot> {
        let rows: Vec<Row> = relock(&self.table).drain().map(|(_, row)| row).collect();
        relock(&self.instances).clear();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entry = relock(&row);
            if entry.removed {
                continue;
            }
            out.push(entry.snapshot());
            drop(entry.clear());
        }
        if !out.is_empty() {
            info!("REG: drained {} session(s)", out.len());
        }
        out
    }

    pub fn len(&self) -> usize {
        relock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
