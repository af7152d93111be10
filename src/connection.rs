//! Public connection facade.
//!
//! A [`Connection`] is what applications hold. It tracks the lifecycle state
//! and hands every call to a [`Backend`], the capability interface behind
//! which the actual machinery lives:
//!
//! - [`ThreadedBackend`]: a socket owned by a dedicated I/O thread, names
//!   resolved through a per-connection cache, login performed over the same
//!   engine.
//! - [`ForwardingBackend`]: forwards every call to another backend running on
//!   its own worker thread, for hosts that already run an event loop there.
//!
//! # Lifecycle
//!
//! `Disconnected → Connecting → Authenticating → Connected → Terminated`.
//! A failed connect returns to `Disconnected`, so the caller may retry.
//! Disconnecting, or losing the socket, ends in `Terminated`, which is final:
//! reconnecting requires a new [`Connection`].
//!
//! # Example
//! ```no_run
//! use labrad_client::{Connection, ConnectionConfig, Context, Data, Record};
//!
//! let cxn = Connection::new(None);
//! cxn.connect(&ConnectionConfig::default().with_password("secret")).unwrap();
//!
//! let records = vec![Record::new("temperatures", Data::None)];
//! let reply = cxn
//!     .send_request("Lakeshore 218", records, Context::default(), None)
//!     .unwrap();
//! println!("{:?}", reply.wait().unwrap());
//! cxn.disconnect().unwrap();
//! ```
use std::{
    net::{TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    ConnectionError,
    auth::{self, EnvPassword, PasswordSource},
    config::{ConnectionConfig, TlsMode, default_client_name},
    error::Feature,
    protocol::{
        Context, EngineStats, ProtocolEngine, Record, Reply, Target, WireRecord, reply,
    },
    resolver::NameResolver,
};

/// Name of the backend used when none is requested.
pub const DEFAULT_BACKEND: &str = "threaded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Terminated,
}

/// Operations every connection backend provides.
pub trait Backend: Send + Sync {
    /// Opens the transport to the manager described by `config`.
    fn open(&self, config: &ConnectionConfig) -> Result<(), ConnectionError>;

    /// Runs the login handshake, returning the assigned connection id.
    fn login(&self, password: Option<&str>, name: &str) -> Result<u32, ConnectionError>;

    /// Closes the transport and waits for its resources to be released.
    fn disconnect(&self) -> Result<(), ConnectionError>;

    fn send_request(
        &self,
        target: Target,
        records: Vec<Record>,
        context: Context,
        timeout: Option<Duration>,
    ) -> Result<Reply, ConnectionError>;

    fn send_message(
        &self,
        target: Target,
        records: Vec<Record>,
        context: Context,
    ) -> Result<(), ConnectionError>;

    fn is_alive(&self) -> bool;

    /// Optional features this backend provides; none by default.
    fn supports(&self, _feature: Feature) -> bool {
        false
    }
}

/// Builds a backend by name: `"threaded"` or `"forwarding"`.
pub fn backend(name: &str) -> Result<Box<dyn Backend>, ConnectionError> {
    match name {
        "threaded" => Ok(Box::new(ThreadedBackend::new())),
        "forwarding" => Ok(Box::new(ForwardingBackend::new(Box::new(
            ThreadedBackend::new(),
        ))?)),
        other => Err(ConnectionError::UnknownBackend(other.to_string())),
    }
}

/// Creates a connection on the named backend and connects it.
pub fn connect(
    config: &ConnectionConfig,
    name: Option<String>,
    backend_name: Option<&str>,
) -> Result<Connection, ConnectionError> {
    let backend = backend(backend_name.unwrap_or(DEFAULT_BACKEND))?;
    let cxn = Connection::with_backend(name, backend);
    cxn.connect(config)?;
    Ok(cxn)
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    id: Option<u32>,
}

pub struct Connection {
    name: String,
    backend: Box<dyn Backend>,
    status: Mutex<Status>,
    next_context: AtomicU32,
}

impl Connection {
    /// A disconnected connection on the default backend.
    pub fn new(name: Option<String>) -> Self {
        Self::with_backend(name, Box::new(ThreadedBackend::new()))
    }

    pub fn with_backend(name: Option<String>, backend: Box<dyn Backend>) -> Self {
        Self {
            name: name.unwrap_or_else(default_client_name),
            backend,
            status: Mutex::new(Status {
                state: ConnectionState::Disconnected,
                id: None,
            }),
            next_context: AtomicU32::new(1),
        }
    }

    /// Starts the context counter at `base` instead of 1.
    pub fn with_context_base(self, base: u32) -> Self {
        self.next_context.store(base, Ordering::Relaxed);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state; a connection whose transport died reports `Terminated`.
    pub fn state(&self) -> ConnectionState {
        let mut status = self.status();
        if status.state == ConnectionState::Connected && !self.backend.is_alive() {
            info!("connection '{}' lost its transport", self.name);
            status.state = ConnectionState::Terminated;
        }
        status.state
    }

    /// Id assigned by the manager, once connected.
    pub fn id(&self) -> Option<u32> {
        self.status().id
    }

    /// A context no other call on this connection has been given.
    pub fn context(&self) -> Context {
        Context::new(0, self.next_context.fetch_add(1, Ordering::Relaxed))
    }

    pub fn connect(&self, config: &ConnectionConfig) -> Result<u32, ConnectionError> {
        {
            let mut status = self.status();
            if status.state != ConnectionState::Disconnected {
                return Err(ConnectionError::InvalidState(status.state));
            }
            status.state = ConnectionState::Connecting;
        }

        if let Err(e) = self.backend.open(config) {
            self.advance(ConnectionState::Connecting, ConnectionState::Disconnected);
            return Err(e);
        }
        if !self.advance(ConnectionState::Connecting, ConnectionState::Authenticating) {
            return Err(self.abandon());
        }

        match self.backend.login(config.password.as_deref(), &self.name) {
            Ok(id) => {
                let mut status = self.status();
                if status.state != ConnectionState::Authenticating {
                    drop(status);
                    return Err(self.abandon());
                }
                status.state = ConnectionState::Connected;
                status.id = Some(id);
                info!("connected to {}:{} as {id}", config.host, config.port());
                Ok(id)
            }
            Err(e) => {
                if let Err(err) = self.backend.disconnect() {
                    warn!("failed to tear down after login failure: {err}");
                }
                self.advance(ConnectionState::Authenticating, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        let mut status = self.status();
        match status.state {
            ConnectionState::Disconnected => Ok(()),
            // a terminated engine may still need its thread joined
            _ => {
                self.backend.disconnect()?;
                if status.state != ConnectionState::Terminated {
                    debug!("connection '{}' closed", self.name);
                }
                status.state = ConnectionState::Terminated;
                Ok(())
            }
        }
    }

    /// Sends a request; names in `target` and `records` are resolved first.
    ///
    /// A `timeout` is only accepted by backends that support one.
    pub fn send_request(
        &self,
        target: impl Into<Target>,
        records: Vec<Record>,
        context: Context,
        timeout: Option<Duration>,
    ) -> Result<Reply, ConnectionError> {
        if timeout.is_some() && !self.backend.supports(Feature::Timeout) {
            return Err(ConnectionError::Unsupported(Feature::Timeout));
        }
        self.ensure_connected()?;
        let result = self
            .backend
            .send_request(target.into(), records, context, timeout);
        self.observe(result)
    }

    /// Sends a one-way message; no reply is expected.
    pub fn send_message(
        &self,
        target: impl Into<Target>,
        records: Vec<Record>,
        context: Context,
    ) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let result = self.backend.send_message(target.into(), records, context);
        self.observe(result)
    }

    /// Sends a request in the default context and waits for the reply.
    pub fn call(
        &self,
        target: impl Into<Target>,
        records: Vec<Record>,
    ) -> Result<Vec<WireRecord>, ConnectionError> {
        let reply = self.send_request(target, records, Context::default(), None)?;
        self.observe(reply.wait())
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    /// Moves to `Terminated` when a call reports the engine gone.
    fn observe<T>(&self, result: Result<T, ConnectionError>) -> Result<T, ConnectionError> {
        if let Err(e) = &result {
            if e.is_terminated() {
                let mut status = self.status();
                if status.state == ConnectionState::Connected {
                    info!("connection '{}' terminated: {e}", self.name);
                    status.state = ConnectionState::Terminated;
                }
            }
        }
        result
    }

    fn status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves from `from` to `to`; fails if a concurrent disconnect got there first.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut status = self.status();
        if status.state != from {
            return false;
        }
        status.state = to;
        true
    }

    /// Tears down a transport opened after the connection was disconnected.
    fn abandon(&self) -> ConnectionError {
        debug!("connection '{}' disconnected while connecting", self.name);
        if let Err(e) = self.backend.disconnect() {
            warn!("failed to tear down abandoned transport: {e}");
        }
        ConnectionError::InvalidState(ConnectionState::Terminated)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("error while dropping connection '{}': {e}", self.name);
        }
    }
}

/// Backend driving a socket from a dedicated I/O thread.
pub struct ThreadedBackend {
    engine: Mutex<Option<Arc<ProtocolEngine>>>,
    resolver: NameResolver,
    passwords: Box<dyn PasswordSource>,
    welcome: Mutex<Option<String>>,
}

impl Default for ThreadedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedBackend {
    pub fn new() -> Self {
        Self::with_password_source(Box::new(EnvPassword))
    }

    pub fn with_password_source(passwords: Box<dyn PasswordSource>) -> Self {
        Self {
            engine: Mutex::new(None),
            resolver: NameResolver::new(),
            passwords,
            welcome: Mutex::new(None),
        }
    }

    /// Welcome message sent by the manager during login.
    pub fn welcome(&self) -> Option<String> {
        self.welcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Counters of the current engine, if a socket is open.
    pub fn stats(&self) -> Option<Arc<EngineStats>> {
        self.engine().ok().map(|engine| engine.stats())
    }

    fn engine(&self) -> Result<Arc<ProtocolEngine>, ConnectionError> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ConnectionError::NotConnected)
    }
}

impl Backend for ThreadedBackend {
    fn open(&self, config: &ConnectionConfig) -> Result<(), ConnectionError> {
        if config.tls != TlsMode::Off {
            return Err(ConnectionError::Unsupported(Feature::Tls));
        }

        let port = config.port();
        let mut last_error = None;
        let mut stream = None;
        for addr in (config.host.as_str(), port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!("failed to reach {addr}: {e}");
                    last_error = Some(e);
                }
            }
        }
        let stream = match (stream, last_error) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(e.into()),
            (None, None) => {
                return Err(ConnectionError::Config(format!(
                    "'{}' did not resolve to any address",
                    config.host
                )));
            }
        };

        let engine = ProtocolEngine::start(stream)?;
        self.resolver.clear();
        let previous = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::new(engine));
        if let Some(previous) = previous {
            previous.drop_connection();
        }
        debug!("socket open to {}:{port}", config.host);
        Ok(())
    }

    fn login(&self, password: Option<&str>, name: &str) -> Result<u32, ConnectionError> {
        let engine = self.engine()?;
        let session = auth::login(&*engine, password, &*self.passwords, name)?;
        *self.welcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.welcome);
        Ok(session.id)
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        let engine = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(engine) = engine {
            engine.drop_connection();
            engine.join();
        }
        Ok(())
    }

    fn send_request(
        &self,
        target: Target,
        records: Vec<Record>,
        context: Context,
        timeout: Option<Duration>,
    ) -> Result<Reply, ConnectionError> {
        if timeout.is_some() {
            return Err(ConnectionError::Unsupported(Feature::Timeout));
        }

        let engine = self.engine()?;
        let (target, records) = self.resolver.resolve(&*engine, target, records)?;
        let (promise, reply) = reply::channel();
        engine.enqueue(target, context, records, Some(promise))?;
        Ok(reply)
    }

    fn send_message(
        &self,
        target: Target,
        records: Vec<Record>,
        context: Context,
    ) -> Result<(), ConnectionError> {
        let engine = self.engine()?;
        let (target, records) = self.resolver.resolve(&*engine, target, records)?;
        engine.enqueue(target, context, records, None)
    }

    fn is_alive(&self) -> bool {
        self.engine().is_ok_and(|engine| engine.is_alive())
    }
}

type Job = Box<dyn FnOnce(&dyn Backend) + Send + 'static>;

/// Backend that runs another backend on a dedicated worker thread.
///
/// Every call is packaged as a job, executed on the worker and its result
/// handed back; the forwarding layer adds no behaviour of its own.
pub struct ForwardingBackend {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ForwardingBackend {
    pub fn new(inner: Box<dyn Backend>) -> Result<Self, ConnectionError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name("labrad-forward".to_string())
            .spawn(move || {
                for job in receiver {
                    job(&*inner);
                }
                debug!("forwarding worker exiting");
                if let Err(e) = inner.disconnect() {
                    warn!("inner backend failed to disconnect: {e}");
                }
            })?;

        Ok(Self {
            jobs: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn call<T, F>(&self, f: F) -> Result<T, ConnectionError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Backend) -> Result<T, ConnectionError> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        {
            let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = jobs.as_ref().ok_or(ConnectionError::NotConnected)?;
            sender
                .send(Box::new(move |backend: &dyn Backend| {
                    let _ = tx.send(f(backend));
                }))
                .map_err(|_| ConnectionError::terminated("forwarding worker exited"))?;
        }
        rx.recv()
            .unwrap_or_else(|_| Err(ConnectionError::terminated("forwarding worker exited")))
    }
}

impl Backend for ForwardingBackend {
    fn open(&self, config: &ConnectionConfig) -> Result<(), ConnectionError> {
        let config = config.clone();
        self.call(move |backend| backend.open(&config))
    }

    fn login(&self, password: Option<&str>, name: &str) -> Result<u32, ConnectionError> {
        let password = password.map(str::to_string);
        let name = name.to_string();
        self.call(move |backend| backend.login(password.as_deref(), &name))
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        self.call(|backend| backend.disconnect())
    }

    fn send_request(
        &self,
        target: Target,
        records: Vec<Record>,
        context: Context,
        timeout: Option<Duration>,
    ) -> Result<Reply, ConnectionError> {
        self.call(move |backend| backend.send_request(target, records, context, timeout))
    }

    fn send_message(
        &self,
        target: Target,
        records: Vec<Record>,
        context: Context,
    ) -> Result<(), ConnectionError> {
        self.call(move |backend| backend.send_message(target, records, context))
    }

    fn is_alive(&self) -> bool {
        self.call(|backend| Ok(backend.is_alive())).unwrap_or(false)
    }

    fn supports(&self, feature: Feature) -> bool {
        self.call(move |backend| Ok(backend.supports(feature))).unwrap_or(false)
    }
}

impl Drop for ForwardingBackend {
    fn drop(&mut self) {
        drop(self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("forwarding worker panicked");
            }
        }
    }
}
