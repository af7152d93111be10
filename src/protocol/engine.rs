//! Socket-owning protocol engine.
//!
//! A [`ProtocolEngine`] is a cheap handle around a single dedicated I/O
//! thread. Caller threads only ever touch the outbound command queue; the
//! socket, the table of pending requests and the pool of recycled request ids
//! belong to the `IoWorker` running on the I/O thread and are never shared.
//!
//! # Loop
//!
//! Every iteration of the worker:
//!
//! 1. drains queued commands, assigning request ids and serializing packets
//!    into the write buffer, stopping at a drop request;
//! 2. writes as much of the buffer as the socket accepts;
//! 3. reads whatever has arrived (waiting at most [`POLL_INTERVAL`]) and
//!    feeds it to the incremental decoder, completing pending requests as
//!    replies are decoded.
//!
//! Any socket error, close by the peer or drop request terminates the
//! connection: queued and pending requests are failed with
//! [`ConnectionError::Terminated`] and further enqueues are refused.
use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, TryRecvError},
    },
    thread,
    time::Duration,
};

use log::{debug, info, trace, warn};

use crate::ConnectionError;

use super::{
    Context, Packet, PacketStream, Promise, Requester, TransportError, WireCodec, WireRecord,
    reply, requests::RequestTable,
};

/// Longest time the I/O thread blocks on the socket in one iteration.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

const READ_CHUNK: usize = 4096;
const FLUSH_ATTEMPTS: usize = 100;

enum Command {
    Send {
        target: u32,
        context: Context,
        records: Vec<WireRecord>,
        reply: Option<Promise>,
    },
    Drop,
}

enum Outbound {
    Open(mpsc::Sender<Command>),
    Closed(String),
}

/// Counters published by the I/O thread after every loop iteration.
#[derive(Debug, Default)]
pub struct EngineStats {
    pending: AtomicUsize,
    allocated: AtomicUsize,
    orphaned: AtomicU64,
}

impl EngineStats {
    /// Requests awaiting a reply.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Distinct request ids handed out since the connection opened.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Replies discarded because no request was waiting for them.
    pub fn orphaned(&self) -> u64 {
        self.orphaned.load(Ordering::Acquire)
    }

    fn publish(&self, requests: &RequestTable) {
        self.pending.store(requests.len(), Ordering::Release);
        self.allocated.store(requests.allocated(), Ordering::Release);
    }
}

/// Handle to a connection's I/O thread.
pub struct ProtocolEngine {
    outbound: Arc<Mutex<Outbound>>,
    stats: Arc<EngineStats>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ProtocolEngine {
    /// Takes ownership of a connected socket and starts the I/O thread.
    pub fn start(stream: TcpStream) -> Result<Self, ConnectionError> {
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        stream.set_write_timeout(Some(POLL_INTERVAL))?;
        stream.set_nodelay(true)?;

        let (sender, receiver) = mpsc::channel();
        let outbound = Arc::new(Mutex::new(Outbound::Open(sender)));
        let stats = Arc::new(EngineStats::default());

        let worker = IoWorker {
            stream,
            commands: receiver,
            outbound: Arc::clone(&outbound),
            stats: Arc::clone(&stats),
            requests: RequestTable::new(),
            codec: WireCodec::new(),
            decoder: PacketStream::new(),
            buffer: Vec::new(),
        };
        let thread = thread::Builder::new()
            .name("labrad-io".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            outbound,
            stats,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues a packet for the I/O thread.
    ///
    /// Without a promise the packet is a message (request tag 0). With one,
    /// the I/O thread assigns a request id when it dequeues the command.
    pub fn enqueue(
        &self,
        target: u32,
        context: Context,
        records: Vec<WireRecord>,
        reply: Option<Promise>,
    ) -> Result<(), ConnectionError> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match &*outbound {
            Outbound::Open(sender) => sender
                .send(Command::Send {
                    target,
                    context,
                    records,
                    reply,
                })
                .map_err(|_| ConnectionError::terminated("I/O thread exited")),
            Outbound::Closed(reason) => Err(ConnectionError::terminated(reason.clone())),
        }
    }

    /// Asks the I/O thread to flush what it can and close the socket.
    pub fn drop_connection(&self) {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        if let Outbound::Open(sender) = &*outbound {
            let _ = sender.send(Command::Drop);
        }
    }

    /// Waits for the I/O thread to exit.
    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("I/O thread panicked");
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(&*outbound, Outbound::Open(_))
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }
}

impl Requester for ProtocolEngine {
    fn request(
        &self,
        target: u32,
        records: Vec<WireRecord>,
    ) -> Result<Vec<WireRecord>, ConnectionError> {
        let (promise, reply) = reply::channel();
        self.enqueue(target, Context::default(), records, Some(promise))?;
        reply.wait()
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

struct IoWorker {
    stream: TcpStream,
    commands: mpsc::Receiver<Command>,
    outbound: Arc<Mutex<Outbound>>,
    stats: Arc<EngineStats>,
    requests: RequestTable,
    codec: WireCodec,
    decoder: PacketStream,
    buffer: Vec<u8>,
}

impl IoWorker {
    fn run(mut self) {
        debug!("I/O thread started for {:?}", self.stream.peer_addr().ok());

        let reason = match self.serve() {
            Ok(()) => "connection closed".to_string(),
            Err(e) => {
                warn!("connection lost: {e}");
                e.to_string()
            }
        };
        self.terminate(reason);
    }

    fn serve(&mut self) -> Result<(), TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if !self.drain_commands() {
                self.flush();
                return Ok(());
            }
            self.write_pending()?;

            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => {
                    let requests = &mut self.requests;
                    let stats = &self.stats;
                    self.decoder
                        .feed(&chunk[..n], |packet| dispatch(requests, stats, packet))?;
                }
                Err(e) if is_transient(&e) => {}
                Err(e) => return Err(e.into()),
            }

            self.stats.publish(&self.requests);
        }
    }

    /// Serializes every queued command. Returns `false` once a drop was
    /// requested or every handle is gone.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Send {
                    target,
                    context,
                    records,
                    reply,
                }) => self.serialize(target, context, records, reply),
                Ok(Command::Drop) => {
                    debug!("drop requested");
                    return false;
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn serialize(
        &mut self,
        target: u32,
        context: Context,
        records: Vec<WireRecord>,
        reply: Option<Promise>,
    ) {
        let request = match reply {
            None => 0,
            Some(promise) => match self.requests.start(promise) {
                Some(id) => id,
                None => return,
            },
        };

        let packet = Packet {
            target,
            context,
            request,
            records,
        };
        trace!("sending packet to {target} with request {request}");
        if let Err(e) = self.codec.encode(&packet, &mut self.buffer) {
            warn!("dropping unencodable packet for {target}: {e}");
            if request > 0 {
                self.requests.fail(request, e.into());
            }
        }
    }

    fn write_pending(&mut self) -> Result<(), TransportError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.stream.write(&self.buffer) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => {
                self.buffer.drain(..n);
                Ok(())
            }
            Err(e) if is_transient(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) {
        for _ in 0..FLUSH_ATTEMPTS {
            if self.buffer.is_empty() {
                return;
            }
            if let Err(e) = self.write_pending() {
                debug!("abandoning {} unflushed bytes: {e}", self.buffer.len());
                return;
            }
        }
    }

    fn terminate(mut self, reason: String) {
        let previous = {
            let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *outbound, Outbound::Closed(reason.clone()))
        };
        drop(previous);

        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("socket already closed: {e}");
        }

        let mut discarded = 0;
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send {
                reply: Some(promise),
                ..
            } = command
            {
                promise.fail(ConnectionError::terminated(reason.clone()));
                discarded += 1;
            }
        }

        if self.decoder.buffered() > 0 {
            debug!("discarding {} bytes of a partial packet", self.decoder.buffered());
        }

        let failed = self
            .requests
            .fail_all(|| ConnectionError::terminated(reason.clone()));
        self.stats.publish(&self.requests);

        info!(
            "connection terminated ({reason}); failed {failed} pending and {discarded} unsent requests"
        );
    }
}

/// Routes a decoded packet to the request waiting for it.
fn dispatch(requests: &mut RequestTable, stats: &EngineStats, packet: Packet) {
    if packet.is_message() {
        debug!("ignoring message from {}", packet.target);
        return;
    }
    if !packet.is_reply() {
        debug!(
            "ignoring request {} from {}; this client serves nothing",
            packet.request, packet.target
        );
        return;
    }

    let Some(id) = packet.request.checked_neg() else {
        debug!("ignoring reply with invalid request tag {}", packet.request);
        return;
    };
    if !requests.complete(id, packet.records) {
        // Replies to abandoned or unknown requests are expected after
        // termination races; they are counted but otherwise dropped.
        stats.orphaned.fetch_add(1, Ordering::AcqRel);
        debug!("discarding reply for unknown request {id}");
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
