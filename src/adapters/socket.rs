//! Unix-domain socket IPC endpoint.
//!
//! Carries the same request / reply envelopes as any other substrate. Each
//! message on the socket is one length-prefixed frame (see
//! [`crate::rpc::codec`]) holding a `postcard`-encoded [`SocketFrame`].
//!
//! ```text
//!  client process                         ihaproxyd
//!  ┌─────────────┐  Call{code,data,objs}  ┌──────────────┐
//!  │ SocketRemote│ ─────────────────────▶ │ connection   │──▶ ServerPool
//!  │             │ ◀───────────────────── │ thread       │
//!  │  handlers ◀─┼── Event{object,event} ─┼─ RemoteHandler (proxy, in registry)
//!  └─────────────┘                        └──────────────┘
//! ```
//!
//! Handler objects never cross the socket. The client keeps the real
//! handler and sends a small object id; the server binds a proxy per
//! `(connection, id)` that writes event frames back on the connection.
//! The same id always maps to the same proxy while the daemon holds it, so
//! re-registering the same handler is recognised as such. The connection
//! only keeps weak references to its proxies: once the registry lets go of
//! one, it is gone. The client drops its id when the stub reports the
//! handler released.
//!
//! On the client, the reader thread only routes frames. Events are queued
//! to a separate delivery thread, so a handler may call back into the
//! daemon on the same connection.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use anyhow::Context;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::events::AppletEvent;
use crate::app::ports::{Caller, EventHandler, HandlerRef, WeakHandlerRef};
use crate::rpc::channels::EVENT_DEPTH;
use crate::rpc::codec::{FrameDecoder, encode_frame};
use crate::rpc::parcel::Parcel;
use crate::rpc::pool::{IpcError, Remote, ServerPool};

const READ_CHUNK: usize = 4096;

/// Everything exchanged on the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketFrame {
    /// Client → server: one transaction. `objects` are client-side handler
    /// ids, indexed by the envelope's handler fields.
    Call {
        code: u32,
        data: Vec<u8>,
        objects: Vec<u32>,
    },
    /// Server → client: reply envelope of the outstanding call.
    Reply { data: Vec<u8> },
    /// Server → client: notification for a registered handler.
    Event { object: u32, event: AppletEvent },
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_frame(stream: &mut UnixStream, frame: &SocketFrame) -> anyhow::Result<()> {
    let payload = postcard::to_allocvec(frame).context("encode socket frame")?;
    let bytes = encode_frame(&payload).context("socket frame too large")?;
    stream.write_all(&bytes).context("write socket frame")?;
    Ok(())
}

/// Read until at least one complete frame is decoded. `Ok(None)` on EOF.
fn read_frames(
    stream: &mut UnixStream,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
) -> anyhow::Result<Option<Vec<SocketFrame>>> {
    loop {
        let mut frames = Vec::new();
        while let Some(raw) = decoder.next_frame().map_err(|e| anyhow::anyhow!("{e}"))? {
            frames.push(postcard::from_bytes(&raw).context("decode socket frame")?);
        }
        if !frames.is_empty() {
            return Ok(Some(frames));
        }
        let n = stream.read(buf).context("read socket")?;
        if n == 0 {
            return Ok(None);
        }
        decoder.feed(&buf[..n]);
    }
}

/// Credentials of the process on the other end of `stream`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn peer_credentials(stream: &UnixStream) -> std::io::Result<Caller> {
    use std::os::fd::AsRawFd;

    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = core::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: `cred` and `len` are valid for writes and sized for SO_PEERCRED.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&raw mut cred).cast(),
            &raw mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(Caller::new(cred.pid as u32, cred.uid))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn peer_credentials(_stream: &UnixStream) -> std::io::Result<Caller> {
    Ok(Caller::default())
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Server-side stand-in for a handler living in a client process.
struct RemoteHandler {
    object: u32,
    writer: Arc<Mutex<UnixStream>>,
}

impl EventHandler for RemoteHandler {
    fn on_event(&self, event: &AppletEvent) -> anyhow::Result<()> {
        let frame = SocketFrame::Event {
            object: self.object,
            event: event.clone(),
        };
        write_frame(&mut relock(&self.writer), &frame)
            .with_context(|| format!("forward event to client object {}", self.object))
    }
}

pub struct SocketServer {
    listener: UnixListener,
    path: PathBuf,
    pool: Arc<ServerPool>,
    stop: Arc<AtomicBool>,
}

/// Running accept loop.
pub struct ServerHandle {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SocketServer {
    /// Bind `path`, replacing a stale socket file.
    pub fn bind(path: impl AsRef<Path>, pool: Arc<ServerPool>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("remove stale socket {}", path.display()))?;
        }
        let listener =
            UnixListener::bind(&path).with_context(|| format!("bind {}", path.display()))?;
        info!("SOCK: listening on {}", path.display());
        Ok(Self {
            listener,
            path,
            pool,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run the accept loop on its own thread.
    pub fn spawn(self) -> std::io::Result<ServerHandle> {
        let path = self.path.clone();
        let stop = Arc::clone(&self.stop);
        let thread = std::thread::Builder::new()
            .name("iha-sock-accept".into())
            .spawn(move || self.run())?;
        Ok(ServerHandle {
            path,
            stop,
            thread: Some(thread),
        })
    }

    /// Accept connections until stopped.
    pub fn run(self) {
        for conn in self.listener.incoming() {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let stream = match conn {
                Ok(s) => s,
                Err(e) => {
                    warn!("SOCK: accept failed: {}", e);
                    continue;
                }
            };
            let pool = Arc::clone(&self.pool);
            let spawned = std::thread::Builder::new()
                .name("iha-sock-conn".into())
                .spawn(move || {
                    if let Err(e) = serve_connection(stream, &pool) {
                        warn!("SOCK: connection closed: {:#}", e);
                    }
                });
            if let Err(e) = spawned {
                error!("SOCK: cannot spawn connection thread: {}", e);
            }
        }
        info!("SOCK: accept loop stopped");
    }
}

impl ServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket file. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // Wake the blocking accept.
        drop(UnixStream::connect(&self.path));
        if thread.join().is_err() {
            error!("SOCK: accept thread panicked");
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_connection(mut stream: UnixStream, pool: &ServerPool) -> anyhow::Result<()> {
    let caller = peer_credentials(&stream).context("read peer credentials")?;
    let writer = Arc::new(Mutex::new(stream.try_clone().context("clone stream")?));
    let mut proxies: HashMap<u32, WeakHandlerRef> = HashMap::new();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    debug!("SOCK: connection from pid {} uid {}", caller.pid, caller.uid);

    while let Some(frames) = read_frames(&mut stream, &mut decoder, &mut buf)? {
        for frame in frames {
            let SocketFrame::Call {
                code,
                data,
                objects,
            } = frame
            else {
                anyhow::bail!("unexpected frame from pid {}", caller.pid);
            };
            proxies.retain(|_, proxy| proxy.is_alive());
            let objects = objects
                .into_iter()
                .map(|id| {
                    if let Some(live) = proxies.get(&id).and_then(WeakHandlerRef::upgrade) {
                        return live;
                    }
                    let proxy = HandlerRef::new(RemoteHandler {
                        object: id,
                        writer: Arc::clone(&writer),
                    });
                    proxies.insert(id, proxy.downgrade());
                    proxy
                })
                .collect();
            let reply = pool
                .submit(caller, code, Parcel::from_parts(data, objects))
                .map_err(|e| anyhow::anyhow!("dispatch: {e}"))?;
            let (data, _) = reply.into_parts();
            write_frame(&mut relock(&writer), &SocketFrame::Reply { data })?;
        }
    }
    debug!("SOCK: pid {} hung up", caller.pid);
    Ok(())
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

type ReplySlot = Signal<CriticalSectionRawMutex, Result<Vec<u8>, IpcError>>;

enum ClientEvent {
    Deliver { object: u32, event: AppletEvent },
    Stop,
}

type ClientEventQueue = Channel<CriticalSectionRawMutex, ClientEvent, EVENT_DEPTH>;

struct ClientShared {
    reply: ReplySlot,
    events: ClientEventQueue,
    handlers: Mutex<HashMap<u32, HandlerRef>>,
    next_object: AtomicU32,
    closed: AtomicBool,
}

impl ClientShared {
    fn new() -> Self {
        Self {
            reply: Signal::new(),
            events: Channel::new(),
            handlers: Mutex::new(HashMap::new()),
            next_object: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Stable id for `handler`, allocated on first use.
    fn object_id(&self, handler: &HandlerRef) -> u32 {
        let mut handlers = relock(&self.handlers);
        if let Some((&id, _)) = handlers.iter().find(|(_, h)| h.same_as(handler)) {
            return id;
        }
        let id = self.next_object.fetch_add(1, Ordering::Relaxed);
        handlers.insert(id, handler.clone());
        id
    }

    fn release(&self, handler: &HandlerRef) {
        relock(&self.handlers).retain(|id, h| {
            let keep = !h.same_as(handler);
            if !keep {
                debug!("SOCK: object {} released", id);
            }
            keep
        });
    }

    fn deliver(&self, object: u32, event: &AppletEvent) {
        let handler = relock(&self.handlers).get(&object).cloned();
        match handler {
            Some(h) => {
                if let Err(e) = h.handler().on_event(event) {
                    warn!("SOCK: handler {} failed: {:#}", object, e);
                }
            }
            None => debug!("SOCK: event for unknown object {}", object),
        }
    }
}

/// [`Remote`] over a connection to the daemon's socket.
pub struct SocketRemote {
    writer: Mutex<UnixStream>,
    shared: Arc<ClientShared>,
    reader: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
}

impl SocketRemote {
    pub fn connect(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let stream =
            UnixStream::connect(path).with_context(|| format!("connect {}", path.display()))?;
        let read_half = stream.try_clone().context("clone stream")?;
        let shared = Arc::new(ClientShared::new());
        let delivery = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("iha-sock-events".into())
                .spawn(move || client_delivery(&shared))
                .context("spawn event delivery")?
        };
        let reader = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("iha-sock-client".into())
                .spawn(move || client_reader(read_half, &shared))
        };
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                futures_lite::future::block_on(shared.events.send(ClientEvent::Stop));
                let _ = delivery.join();
                return Err(e).context("spawn reader");
            }
        };
        Ok(Self {
            writer: Mutex::new(stream),
            shared,
            reader: Some(reader),
            delivery: Some(delivery),
        })
    }
}

fn client_reader(mut stream: UnixStream, shared: &ClientShared) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match read_frames(&mut stream, &mut decoder, &mut buf) {
            Ok(Some(frames)) => {
                for frame in frames {
                    match frame {
                        SocketFrame::Reply { data } => shared.reply.signal(Ok(data)),
                        SocketFrame::Event { object, event } => {
                            if shared
                                .events
                                .try_send(ClientEvent::Deliver { object, event })
                                .is_err()
                            {
                                warn!("SOCK: event queue full, dropping event for object {}", object);
                            }
                        }
                        SocketFrame::Call { .. } => warn!("SOCK: server sent a call frame"),
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("SOCK: client reader stopped: {:#}", e);
                break;
            }
        }
    }
    shared.closed.store(true, Ordering::Release);
    shared.reply.signal(Err(IpcError::Disconnected));
    futures_lite::future::block_on(shared.events.send(ClientEvent::Stop));
}

fn client_delivery(shared: &ClientShared) {
    loop {
        match futures_lite::future::block_on(shared.events.receive()) {
            ClientEvent::Deliver { object, event } => shared.deliver(object, &event),
            ClientEvent::Stop => break,
        }
    }
    debug!("SOCK: event delivery stopped");
}

impl Remote for SocketRemote {
    fn transact(&self, code: u32, data: Parcel) -> Result<Parcel, IpcError> {
        // One outstanding call per connection.
        let mut writer = relock(&self.writer);
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(IpcError::Disconnected);
        }
        let (data, handlers) = data.into_parts();
        let objects = handlers.iter().map(|h| self.shared.object_id(h)).collect();

        self.shared.reply.reset();
        write_frame(
            &mut writer,
            &SocketFrame::Call {
                code,
                data,
                objects,
            },
        )
        .map_err(|e| {
            debug!("SOCK: send failed: {:#}", e);
            IpcError::Disconnected
        })?;

        let data = futures_lite::future::block_on(self.shared.reply.wait())?;
        Ok(Parcel::from_parts(data, Vec::new()))
    }

    fn release(&self, handler: &HandlerRef) {
        self.shared.release(handler);
    }
}

impl Drop for SocketRemote {
    fn drop(&mut self) {
        let _ = relock(&self.writer).shutdown(std::net::Shutdown::Both);
        // A handler holding the last reference drops us on the delivery
        // thread; that thread drains the queue and stops on its own.
        let on_delivery = self
            .delivery
            .as_ref()
            .is_some_and(|d| d.thread().id() == std::thread::current().id());
        if on_delivery {
            return;
        }
        // The reader queues the delivery thread's stop on its way out.
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(delivery) = self.delivery.take() {
            let _ = delivery.join();
        }
    }
}
