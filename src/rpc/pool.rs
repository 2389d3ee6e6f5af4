//! Dispatcher worker pool and the in-process IPC substrate.
//!
//! ```text
//!  PoolClient::transact ──Job──▶ JobQueue ──▶ "iha-worker-N" ──▶ RpcEngine
//!          ▲                                        │
//!          └──────────── ReplySignal ◀──────────────┘
//! ```
//!
//! Each inbound transaction is one [`Job`] on a bounded channel; the
//! submitting thread blocks on the job's own [`ReplySignal`]. There is no
//! lock across calls: concurrency is bounded only by the number of workers.
//!
//! The channel keeps one waker per direction. A second waiter would evict
//! the first and the two would wake each other forever, so idle workers
//! take turns: one waits in the channel, the rest sleep on a mutex.

use core::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use embassy_sync::channel::TrySendError;
use log::{error, info};

use crate::app::ports::{Caller, HandlerRef, IhaOperations};
use crate::error::Status;

use super::channels::{Job, JobQueue, ReplySignal, WorkerMsg};
use super::engine::{RpcEngine, opcode_name};
use super::parcel::Parcel;

// ---------------------------------------------------------------------------
// IPC errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// The remote endpoint went away.
    Disconnected,
    /// The server is shutting down and no longer accepts calls.
    QueueClosed,
    /// The substrate delivered something that is not a reply.
    Malformed,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "remote disconnected"),
            Self::QueueClosed => write!(f, "server queue closed"),
            Self::Malformed => write!(f, "malformed IPC frame"),
        }
    }
}

impl std::error::Error for IpcError {}

impl From<IpcError> for Status {
    fn from(_: IpcError) -> Self {
        Self::CommsError
    }
}

/// One side of the IPC substrate: send a request envelope, get the reply.
pub trait Remote: Send + Sync {
    fn transact(&self, code: u32, data: Parcel) -> Result<Parcel, IpcError>;

    /// The daemon no longer holds `handler`. Substrates that keep their
    /// own reference per handler object drop it here.
    fn release(&self, _handler: &HandlerRef) {}
}

// ---------------------------------------------------------------------------
// Direct (same-thread) remote
// ---------------------------------------------------------------------------

/// Calls the engine on the calling thread. For tests and tools.
pub struct DirectRemote<S: IhaOperations + ?Sized> {
    engine: Arc<RpcEngine<S>>,
    caller: Caller,
}

impl<S: IhaOperations + ?Sized> DirectRemote<S> {
    pub fn new(engine: Arc<RpcEngine<S>>, caller: Caller) -> Self {
        Self { engine, caller }
    }
}

impl<S: IhaOperations + ?Sized> Remote for DirectRemote<S> {
    fn transact(&self, code: u32, data: Parcel) -> Result<Parcel, IpcError> {
        Ok(self.engine.on_transact(self.caller, code, &data))
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// The job channel plus one turn per direction.
struct JobLane {
    queue: JobQueue,
    send_turn: Mutex<()>,
    receive_turn: Mutex<()>,
}

impl JobLane {
    fn new() -> Self {
        Self {
            queue: JobQueue::new(),
            send_turn: Mutex::new(()),
            receive_turn: Mutex::new(()),
        }
    }

    fn push(&self, msg: WorkerMsg) {
        if let Err(TrySendError::Full(msg)) = self.queue.try_send(msg) {
            let _turn = self.send_turn.lock().unwrap_or_else(PoisonError::into_inner);
            futures_lite::future::block_on(self.queue.send(msg));
        }
    }

    fn pop(&self) -> WorkerMsg {
        let _turn = self
            .receive_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        futures_lite::future::block_on(self.queue.receive())
    }
}

pub struct ServerPool {
    lane: Arc<JobLane>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerPool {
    /// Spawn `threads` workers serving `engine`.
    pub fn start<S>(engine: Arc<RpcEngine<S>>, threads: usize) -> std::io::Result<Arc<Self>>
    where
        S: IhaOperations + ?Sized + 'static,
    {
        let lane = Arc::new(JobLane::new());
        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads.max(1) {
            let lane = Arc::clone(&lane);
            let engine = Arc::clone(&engine);
            let worker = std::thread::Builder::new()
                .name(format!("iha-worker-{n}"))
                .spawn(move || worker_loop(&lane, &engine))?;
            workers.push(worker);
        }
        info!("RPC: {} worker(s) serving {}", workers.len(), engine.descriptor());
        Ok(Arc::new(Self {
            lane,
            workers: Mutex::new(workers),
        }))
    }

    /// Queue a transaction and block until a worker has answered it.
    pub fn submit(&self, caller: Caller, code: u32, data: Parcel) -> Result<Parcel, IpcError> {
        if self.is_stopped() {
            return Err(IpcError::QueueClosed);
        }
        let reply = Arc::new(ReplySignal::new());
        let job = Job {
            caller,
            code,
            data,
            reply: Arc::clone(&reply),
        };
        self.lane.push(WorkerMsg::Call(job));
        Ok(futures_lite::future::block_on(reply.wait()))
    }

    /// A [`Remote`] that submits on behalf of `caller`.
    pub fn client(self: &Arc<Self>, caller: Caller) -> PoolClient {
        PoolClient {
            pool: Arc::clone(self),
            caller,
        }
    }

    fn is_stopped(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Stop every worker after the jobs already queued. Idempotent.
    pub fn shutdown(&self) {
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if workers.is_empty() {
            return;
        }
        for _ in &workers {
            self.lane.push(WorkerMsg::Stop);
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("RPC: worker thread panicked");
            }
        }
        info!("RPC: worker pool stopped");
    }
}

fn worker_loop<S: IhaOperations + ?Sized>(lane: &JobLane, engine: &RpcEngine<S>) {
    loop {
        match lane.pop() {
            WorkerMsg::Stop => break,
            WorkerMsg::Call(job) => {
                log::trace!("RPC[{}]: {} on worker", job.caller.pid, opcode_name(job.code));
                let out = engine.on_transact(job.caller, job.code, &job.data);
                job.reply.signal(out);
            }
        }
    }
}

/// [`Remote`] handle bound to one caller identity.
#[derive(Clone)]
pub struct PoolClient {
    pool: Arc<ServerPool>,
    caller: Caller,
}

impl Remote for PoolClient {
    fn transact(&self, code: u32, data: Parcel) -> Result<Parcel, IpcError> {
        self.pool.submit(self.caller, code, data)
    }
}
