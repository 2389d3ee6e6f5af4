//! Simulated co-processor.
//!
//! Implements [`Transport`] by running a small embedded-app host in
//! process. Used by the test suites and by the daemon when configured with
//! the `simulated` transport, so the full RPC stack can be exercised on a
//! machine without the hardware.
//!
//! The simulation keeps its state behind a [`SimHandle`] that tests hold on
//! to: it can inject events, take the device offline, force the next reply
//! to fail and inspect the requests that reached the device.
//!
//! Behaviour of the simulated apps:
//!
//! - apps must be installed (source path ending in `.dalp`) before a
//!   session can be opened;
//! - provisioning handles start at `0x1000`, each with a 16-byte token;
//! - `SendData` stores a message per `(app, type)`, `ReceiveData` returns
//!   it, `SendAndReceive` answers with the bytes reversed;
//! - capability type 1 is the app version, type 2 the host version;
//! - OTPs are 8 ASCII digits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use uuid::Uuid;

use crate::app::events::{AppletEvent, EventSource};
use crate::applet::protocol::{AppletReply, AppletRequest, Inbound, NO_HANDLE};
use crate::error::Status;
use crate::rpc::codec::{FrameDecoder, encode_frame};
use crate::rpc::negotiate;
use crate::rpc::transport::Transport;

/// Message size the simulated channel reports on connect.
pub const SIM_MAX_MSG: usize = 512;

const FIRST_HANDLE: u32 = 0x1000;
const TOKEN_LEN: usize = 16;
const APP_VERSION: &[u8] = b"2.1.0\0";
const HOST_VERSION: &[u8] = b"3.0.1\0";
const INSTALL_EXT: &str = ".dalp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    Offline,
    NotConnected,
    /// Nothing to receive; a real device would block.
    Idle,
}

// ── Device state ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimState {
    installed: HashSet<String>,
    /// Open sessions, value is the shared flag.
    open: HashMap<String, bool>,
    subscribed: HashSet<String>,
    /// Provisioning handle → (app, token).
    provisioning: HashMap<u32, (String, Vec<u8>)>,
    mailbox: HashMap<(String, u32), Vec<u8>>,
    pending_events: VecDeque<AppletEvent>,
    next_handle: u32,
    otp_counter: u32,
    offline: bool,
    fail_next: Option<u32>,
    garble_next: bool,
    requests: Vec<&'static str>,
}

impl SimState {
    fn close_all(&mut self) {
        self.open.clear();
        self.subscribed.clear();
        self.provisioning.clear();
    }

    fn forget(&mut self, app: &str) {
        self.open.remove(app);
        self.subscribed.remove(app);
        self.provisioning.retain(|_, (owner, _)| owner != app);
        self.mailbox.retain(|(owner, _), _| owner != app);
    }

    fn require_open(&self, app: &str) -> Result<bool, AppletReply> {
        self.open
            .get(app)
            .copied()
            .ok_or(AppletReply::failed(Status::AppletUnexpectedCall))
    }

    fn require_handle(&self, app: &str, handle: u32) -> Result<(), AppletReply> {
        if handle == NO_HANDLE {
            return Ok(());
        }
        match self.provisioning.get(&handle) {
            Some((owner, _)) if owner == app => Ok(()),
            _ => Err(AppletReply::failed(Status::AppletInvalidHandle)),
        }
    }

    fn next_otp(&mut self) -> Vec<u8> {
        self.otp_counter = self.otp_counter.wrapping_add(1);
        let value = self.otp_counter.wrapping_mul(7919).wrapping_add(13_579) % 100_000_000;
        format!("{value:08}").into_bytes()
    }

    fn handle(&mut self, request: AppletRequest) -> AppletReply {
        self.requests.push(request.kind());
        if let Some(code) = self.fail_next.take() {
            return AppletReply::Failed(code);
        }
        self.dispatch(request).unwrap_or_else(|failed| failed)
    }

    fn dispatch(&mut self, request: AppletRequest) -> Result<AppletReply, AppletReply> {
        use AppletRequest as R;

        let reply = match request {
            R::Open { app, shared } => {
                if !self.installed.contains(&app) {
                    return Err(AppletReply::failed(Status::AppletNotInstalled));
                }
                self.open.insert(app, shared);
                AppletReply::Done
            }
            R::Close { app } => {
                self.open.remove(&app);
                self.subscribed.remove(&app);
                self.provisioning.retain(|_, (owner, _)| *owner != app);
                AppletReply::Done
            }
            R::Install { app, source } => {
                if !source.ends_with(INSTALL_EXT) {
                    return Err(AppletReply::failed(Status::AppletInvalidFileExt));
                }
                self.installed.insert(app);
                AppletReply::Done
            }
            R::Uninstall { app } => {
                if !self.installed.remove(&app) {
                    return Err(AppletReply::failed(Status::AppletNotInstalled));
                }
                self.forget(&app);
                AppletReply::Done
            }
            R::StartProvisioning { app } => {
                self.require_open(&app)?;
                let handle = self.next_handle.max(FIRST_HANDLE);
                self.next_handle = handle + 1;
                let token = (0..TOKEN_LEN as u8)
                    .map(|i| (handle as u8).wrapping_add(i))
                    .collect();
                self.provisioning.insert(handle, (app, token));
                AppletReply::Handle(handle)
            }
            R::EndProvisioning {
                app,
                handle,
                capacity,
            } => {
                if handle == NO_HANDLE {
                    return Err(AppletReply::failed(Status::AppletInvalidHandle));
                }
                self.require_handle(&app, handle)?;
                let len = self.provisioning.get(&handle).map_or(0, |(_, t)| t.len());
                if len > capacity as usize {
                    return Ok(AppletReply::TooSmall {
                        required: vec![len as u32],
                    });
                }
                let (_, token) = self
                    .provisioning
                    .remove(&handle)
                    .ok_or(AppletReply::failed(Status::AppletInvalidHandle))?;
                AppletReply::Data(token)
            }
            R::SendData {
                app,
                handle,
                data_type,
                data,
            } => {
                self.require_open(&app)?;
                self.require_handle(&app, handle)?;
                self.mailbox.insert((app, data_type), data);
                AppletReply::Done
            }
            R::ReceiveData {
                app,
                handle,
                data_type,
                capacity,
            } => {
                self.require_open(&app)?;
                self.require_handle(&app, handle)?;
                let key = (app, data_type);
                let len = match self.mailbox.get(&key) {
                    Some(data) => data.len(),
                    None => return Err(AppletReply::failed(Status::AppletInvalidMessage)),
                };
                if len > capacity as usize {
                    return Ok(AppletReply::TooSmall {
                        required: vec![len as u32],
                    });
                }
                AppletReply::Data(self.mailbox.remove(&key).unwrap_or_default())
            }
            R::SendAndReceive {
                app,
                handle,
                data,
                capacity,
                ..
            } => {
                self.require_open(&app)?;
                self.require_handle(&app, handle)?;
                let mut answer = data;
                answer.reverse();
                AppletReply::from_data(negotiate::fit(answer, capacity))
            }
            R::Capabilities {
                app,
                cap_type,
                capacity,
            } => {
                self.require_open(&app)?;
                let caps = match cap_type {
                    1 => APP_VERSION,
                    2 => HOST_VERSION,
                    _ => return Err(AppletReply::failed(Status::AppletInvalidType)),
                };
                AppletReply::from_data(negotiate::fit(caps.to_vec(), capacity))
            }
            R::GetOtp {
                app,
                handle,
                token,
                otp_capacity,
                token_capacity,
                ..
            } => {
                self.require_open(&app)?;
                if handle == NO_HANDLE && token.is_empty() {
                    return Err(AppletReply::failed(Status::AppletInvalidToken));
                }
                self.require_handle(&app, handle)?;
                let refreshed: Vec<u8> = if token_capacity > 0 {
                    token.iter().map(|b| b.wrapping_add(1)).collect()
                } else {
                    Vec::new()
                };
                let otp = self.next_otp();
                match negotiate::fit_pair(otp, otp_capacity, refreshed, token_capacity) {
                    negotiate::Negotiated::Complete((otp, token)) => AppletReply::Otp { otp, token },
                    negotiate::Negotiated::TooSmall(required) => AppletReply::TooSmall {
                        required: required.to_vec(),
                    },
                }
            }
            R::OtpsStatus { app, handle, .. } => {
                self.require_open(&app)?;
                self.require_handle(&app, handle)?;
                AppletReply::Value(u32::from(handle != NO_HANDLE))
            }
            R::Subscribe { app } => {
                if self.require_open(&app)? {
                    // Notifications need an exclusive session.
                    return Err(AppletReply::failed(Status::AppletUnexpectedCall));
                }
                self.subscribed.insert(app);
                AppletReply::Done
            }
            R::Unsubscribe { app } => {
                self.subscribed.remove(&app);
                AppletReply::Done
            }
        };
        Ok(reply)
    }
}

// ── Handle (test / operator side) ────────────────────────────

/// Shared view of the simulated device.
#[derive(Clone, Default)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn install(&self, app: impl Into<String>) {
        self.lock().installed.insert(app.into());
    }

    pub fn is_installed(&self, app: &str) -> bool {
        self.lock().installed.contains(app)
    }

    pub fn is_open(&self, app: &str) -> bool {
        self.lock().open.contains_key(app)
    }

    pub fn is_subscribed(&self, app: &str) -> bool {
        self.lock().subscribed.contains(app)
    }

    /// Queue an event; it goes out with the next reply or poll.
    pub fn inject_event(&self, app: impl Into<String>, data: Vec<u8>) {
        self.lock()
            .pending_events
            .push_back(AppletEvent::new(app, data, EventSource::Applet));
    }

    /// Make connect and send fail as if the device were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// The next request is answered with `code` instead of being executed.
    pub fn fail_next(&self, code: u32) {
        self.lock().fail_next = Some(code);
    }

    /// Emit an undecodable frame ahead of the next reply.
    pub fn garble_next(&self) {
        self.lock().garble_next = true;
    }

    /// Kinds of every request the device has executed, in order.
    pub fn requests(&self) -> Vec<&'static str> {
        self.lock().requests.clone()
    }

    fn has_pending_events(&self) -> bool {
        !self.lock().pending_events.is_empty()
    }
}

// ── Transport ────────────────────────────────────────────────

pub struct SimulatedCoprocessor {
    state: SimHandle,
    inbox: FrameDecoder,
    outbox: VecDeque<u8>,
    connected: bool,
}

impl SimulatedCoprocessor {
    pub fn new() -> (Self, SimHandle) {
        let state = SimHandle::default();
        let sim = Self {
            state: state.clone(),
            inbox: FrameDecoder::new(),
            outbox: VecDeque::new(),
            connected: false,
        };
        (sim, state)
    }

    /// A device with `apps` already installed.
    pub fn with_apps<I, S>(apps: I) -> (Self, SimHandle)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (sim, state) = Self::new();
        for app in apps {
            state.install(app);
        }
        (sim, state)
    }

    fn push_inbound(&mut self, inbound: &Inbound) {
        // Serializing our own message types cannot fail.
        if let Some(frame) = postcard::to_allocvec(inbound)
            .ok()
            .and_then(|payload| encode_frame(&payload))
        {
            self.outbox.extend(frame);
        }
    }

    fn flush_events(&mut self, st: &mut SimState) {
        while let Some(event) = st.pending_events.pop_front() {
            self.push_inbound(&Inbound::Event(event));
        }
    }
}

impl Transport for SimulatedCoprocessor {
    type Error = SimError;

    fn connect(&mut self, client: &Uuid) -> Result<usize, SimError> {
        if self.state.lock().offline {
            return Err(SimError::Offline);
        }
        self.connected = true;
        self.inbox.reset();
        self.outbox.clear();
        info!("SIM: client {} connected", client);
        Ok(SIM_MAX_MSG)
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, SimError> {
        if !self.connected {
            return Err(SimError::NotConnected);
        }
        let state = self.state.clone();
        let mut st = state.lock();
        if st.offline {
            return Err(SimError::Offline);
        }
        let data = &data[..data.len().min(SIM_MAX_MSG)];
        self.inbox.feed(data);

        while let Ok(Some(frame)) = self.inbox.next_frame() {
            let reply = match postcard::from_bytes::<AppletRequest>(&frame) {
                Ok(request) => {
                    debug!("SIM: <- {}", request.kind());
                    st.handle(request)
                }
                Err(_) => AppletReply::Failed(Status::ProtoError.code()),
            };
            // Events raised meanwhile precede the reply on the wire.
            self.flush_events(&mut st);
            if std::mem::take(&mut st.garble_next) {
                if let Some(junk) = encode_frame(&[0x7f]) {
                    self.outbox.extend(junk);
                }
            }
            self.push_inbound(&Inbound::Reply(reply));
        }
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, SimError> {
        if !self.connected {
            return Err(SimError::NotConnected);
        }
        {
            let state = self.state.clone();
            let mut st = state.lock();
            self.flush_events(&mut st);
        }
        if self.outbox.is_empty() {
            return Err(SimError::Idle);
        }
        let n = buf.len().min(self.outbox.len()).min(SIM_MAX_MSG);
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn available(&self) -> bool {
        self.connected && (!self.outbox.is_empty() || self.state.has_pending_events())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.inbox.reset();
            self.outbox.clear();
            self.state.lock().close_all();
            info!("SIM: client disconnected");
        }
    }
}
