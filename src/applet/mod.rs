//! Link to the embedded app host on the co-processor.
//!
//! [`AppletLink`] owns the single shared [`Transport`] and serializes every
//! round trip behind one mutex: the co-processor cannot service overlapping
//! exchanges, even though the dispatcher is concurrent.
//!
//! ```text
//!  SessionService ──exchange()──▶ ┌────────────┐ ──frames──▶ Transport
//!                                 │ AppletLink │
//!  EventSink ◀──── Event frames ──└────────────┘ ◀─frames─── Transport
//! ```
//!
//! Event frames that arrive while waiting for a reply are handed to the
//! [`EventSink`] (which only enqueues) and the wait continues.
//!
//! Once a request is on the wire the link either reads its reply or starts
//! over: any failure mid-exchange drops the connection, discards buffered
//! bytes and reconnects, so a late reply can never be taken as the answer
//! to the next request. Sessions do not survive that; each new connection
//! advances [`AppletLink::epoch`].

pub mod protocol;

use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::app::ports::EventSink;
use crate::error::Status;
use crate::rpc::codec::{FrameDecoder, encode_frame};
use crate::rpc::transport::Transport;

use self::protocol::{AppletReply, AppletRequest, Inbound};

/// Receive buffer used before the channel reports its real message size.
const DEFAULT_MSG_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// Link errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// `connect` has not succeeded (or `disconnect` was called).
    NotConnected,
    /// The transport reported an error or the peer went away.
    Transport,
    /// A frame or message could not be decoded.
    Malformed,
    /// A request could not be serialized.
    Encode,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "link not connected"),
            Self::Transport => write!(f, "transport failure"),
            Self::Malformed => write!(f, "malformed frame from co-processor"),
            Self::Encode => write!(f, "request encoding failed"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<LinkError> for Status {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::NotConnected => Self::LibraryNotInitialized,
            LinkError::Transport => Self::CommsError,
            LinkError::Malformed | LinkError::Encode => Self::InternalError,
        }
    }
}

// ---------------------------------------------------------------------------
// AppletLink
// ---------------------------------------------------------------------------

struct LinkState<T> {
    transport: T,
    connected: bool,
    max_msg: usize,
    decoder: FrameDecoder,
    /// Bumped on every successful connect.
    epoch: u64,
}

pub struct AppletLink<T: Transport> {
    client: Uuid,
    state: Mutex<LinkState<T>>,
    sink: Arc<dyn EventSink>,
}

impl<T: Transport> AppletLink<T> {
    pub fn new(transport: T, client: Uuid, sink: Arc<dyn EventSink>) -> Self {
        Self {
            client,
            state: Mutex::new(LinkState {
                transport,
                connected: false,
                max_msg: DEFAULT_MSG_LEN,
                decoder: FrameDecoder::new(),
                epoch: 0,
            }),
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState<T>> {
        // A poisoned link only means a panicking caller held it; the
        // transport itself is still in a defined state.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Connect the transport. Idempotent.
    pub fn connect(&self) -> Result<(), LinkError> {
        let mut st = self.lock();
        if st.connected {
            return Ok(());
        }
        self.open(&mut st)
    }

    /// Disconnect the transport. Idempotent.
    pub fn disconnect(&self) {
        let mut st = self.lock();
        if st.connected {
            st.transport.disconnect();
            st.connected = false;
            st.decoder.reset();
            info!("LINK: disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Identifies the current connection. Co-processor sessions opened
    /// under an older epoch no longer exist.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// One request / reply round trip.
    pub fn exchange(&self, request: &AppletRequest) -> Result<AppletReply, LinkError> {
        let mut st = self.lock();
        if !st.connected {
            return Err(LinkError::NotConnected);
        }

        let payload = postcard::to_allocvec(request).map_err(|_| LinkError::Encode)?;
        let frame = encode_frame(&payload).ok_or(LinkError::Encode)?;
        debug!("LINK: -> {} ({} B)", request.kind(), frame.len());

        let result = self.round_trip(&mut st, &frame);
        if let Err(e) = &result {
            warn!("LINK: {} aborted: {}", request.kind(), e);
            self.reset(&mut st);
        }
        result
    }

    /// Drain pending event frames without issuing a request. Returns the
    /// number of events forwarded to the sink.
    pub fn poll_events(&self) -> Result<usize, LinkError> {
        let mut st = self.lock();
        if !st.connected {
            return Ok(0);
        }

        let mut forwarded = 0;
        let result = loop {
            match st.decoder.next_frame() {
                Ok(Some(frame)) => match self.route_unsolicited(&frame) {
                    Ok(n) => forwarded += n,
                    Err(e) => break Err(e),
                },
                Ok(None) if !st.transport.available() => break Ok(forwarded),
                Ok(None) => {
                    if let Err(e) = Self::receive_into_decoder(&mut st) {
                        break Err(e);
                    }
                }
                Err(_) => break Err(LinkError::Malformed),
            }
        };
        if let Err(e) = &result {
            warn!("LINK: event poll aborted: {}", e);
            self.reset(&mut st);
        }
        result
    }

    fn open(&self, st: &mut LinkState<T>) -> Result<(), LinkError> {
        match st.transport.connect(&self.client) {
            Ok(max_msg) => {
                st.max_msg = if max_msg == 0 { DEFAULT_MSG_LEN } else { max_msg };
                st.connected = true;
                st.decoder.reset();
                st.epoch += 1;
                info!("LINK: connected to {} (max message {} B)", self.client, st.max_msg);
                Ok(())
            }
            Err(e) => {
                warn!("LINK: connect to {} failed: {:?}", self.client, e);
                Err(LinkError::Transport)
            }
        }
    }

    /// Throw away the connection and whatever is in flight on it, then
    /// connect again. The link stays down if the reconnect fails.
    fn reset(&self, st: &mut LinkState<T>) {
        st.transport.disconnect();
        st.connected = false;
        st.decoder.reset();
        if self.open(st).is_ok() {
            info!("LINK: channel reset (epoch {})", st.epoch);
        }
    }

    fn round_trip(&self, st: &mut LinkState<T>, frame: &[u8]) -> Result<AppletReply, LinkError> {
        let max_msg = st.max_msg;
        for chunk in frame.chunks(max_msg) {
            Self::send_all(&mut st.transport, chunk)?;
        }
        loop {
            match self.next_inbound(st)? {
                Inbound::Reply(reply) => return Ok(reply),
                Inbound::Event(event) => self.sink.emit(event),
            }
        }
    }

    fn route_unsolicited(&self, frame: &[u8]) -> Result<usize, LinkError> {
        match postcard::from_bytes::<Inbound>(frame).map_err(|_| LinkError::Malformed)? {
            Inbound::Event(event) => {
                self.sink.emit(event);
                Ok(1)
            }
            Inbound::Reply(reply) => {
                warn!("LINK: dropping unsolicited reply {:?}", reply);
                Ok(0)
            }
        }
    }

    fn send_all(transport: &mut T, mut chunk: &[u8]) -> Result<(), LinkError> {
        while !chunk.is_empty() {
            match transport.send(chunk) {
                Ok(0) => return Err(LinkError::Transport),
                Ok(n) => chunk = &chunk[n.min(chunk.len())..],
                Err(e) => {
                    warn!("LINK: send failed: {:?}", e);
                    return Err(LinkError::Transport);
                }
            }
        }
        Ok(())
    }

    fn receive_into_decoder(st: &mut LinkState<T>) -> Result<(), LinkError> {
        let mut buf = vec![0u8; st.max_msg];
        match st.transport.receive(&mut buf) {
            Ok(0) => {
                warn!("LINK: peer closed the channel");
                Err(LinkError::Transport)
            }
            Ok(n) => {
                st.decoder.feed(&buf[..n.min(buf.len())]);
                Ok(())
            }
            Err(e) => {
                warn!("LINK: receive failed: {:?}", e);
                Err(LinkError::Transport)
            }
        }
    }

    fn next_inbound(&self, st: &mut LinkState<T>) -> Result<Inbound, LinkError> {
        loop {
            if let Some(frame) = st.decoder.next_frame().map_err(|e| {
                warn!("LINK: {}", e);
                LinkError::Malformed
            })? {
                return postcard::from_bytes(&frame).map_err(|_| LinkError::Malformed);
            }
            Self::receive_into_decoder(st)?;
        }
    }
}
