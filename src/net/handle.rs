use super::codec::Discipline;
use super::endpoint::Endpoint;
use super::worker::{IDLE_POLL, Role, Worker};
use super::{Incoming, SocketError, SocketEvent, SocketResult};
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

/// Stack size for worker threads
const WORKER_STACK_SIZE: usize = 256 * 1024;

/// Upper bound on how long `disconnect` waits for the worker to go idle
const DISCONNECT_WAIT: Duration = Duration::from_secs(1);

pub(crate) type Callback = Box<dyn FnMut(&SocketContext, SocketEvent<'_>) + Send>;

/// State shared between a handle's API side and its worker
#[derive(Debug)]
pub(crate) struct Inner {
    discipline: Discipline,
    role: AtomicU8,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    /// Set by a local disconnect, cleared when the next role starts
    hangup: AtomicBool,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    peer: Mutex<Option<SocketAddr>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    capacity: AtomicUsize,
    worker: OnceLock<Thread>,
}

impl Inner {
    fn new(discipline: Discipline) -> Self {
        Self {
            discipline,
            role: AtomicU8::new(Role::Unknown as u8),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            hangup: AtomicBool::new(false),
            endpoint: Mutex::new(None),
            peer: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            capacity: AtomicUsize::new(0),
            worker: OnceLock::new(),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Endpoint>>> {
        self.endpoint.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::SeqCst))
    }

    /// Lock the descriptor slot for a new role, or fail with BUSY
    fn claim(&self) -> SocketResult<MutexGuard<'_, Option<Arc<Endpoint>>>> {
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        let slot = self.slot();
        if self.role() != Role::Unknown || slot.is_some() {
            return Err(SocketError::Busy);
        }
        Ok(slot)
    }

    /// Publish the descriptor and hand the worker its new role
    fn begin(
        &self,
        mut slot: MutexGuard<'_, Option<Arc<Endpoint>>>,
        endpoint: Endpoint,
        role: Role,
    ) {
        *slot = Some(Arc::new(endpoint));
        self.hangup.store(false, Ordering::SeqCst);
        self.role.store(role as u8, Ordering::SeqCst);
        drop(slot);

        log::debug!("{} socket entering {:?}", self.discipline.as_str(), role);
        self.wake();
    }

    fn wake(&self) {
        if let Some(worker) = self.worker.get() {
            worker.unpark();
        }
    }

    fn on_worker_thread(&self) -> bool {
        self.worker
            .get()
            .is_some_and(|worker| worker.id() == thread::current().id())
    }

    /// End the current session from the API side. Safe to call repeatedly.
    fn hang_up(&self) -> SocketResult<()> {
        self.hangup.store(true, Ordering::SeqCst);
        let endpoint = self.slot().take();
        self.wake();

        match endpoint {
            Some(endpoint) => endpoint.shutdown(),
            None => Ok(()),
        }
    }

    /// Give the worker a moment to leave its role after a hang-up
    fn wait_idle(&self) {
        if self.on_worker_thread() {
            return;
        }
        let deadline = Instant::now() + DISCONNECT_WAIT;
        while self.role() != Role::Unknown && Instant::now() < deadline {
            self.wake();
            thread::sleep(IDLE_POLL);
        }
    }

    pub(crate) fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.slot().clone()
    }

    /// Whether the running role should wind down
    pub(crate) fn session_over(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst) || self.hangup.load(Ordering::SeqCst)
    }

    /// Drop the descriptor and return to idle
    pub(crate) fn finish_session(&self) {
        let mut slot = self.slot();
        slot.take();
        self.role.store(Role::Unknown as u8, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_peer(&self, peer: Option<SocketAddr>) {
        *self.peer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = peer;
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    pub(crate) fn add_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::SeqCst);
    }
}

/// Shared view of a socket handle.
///
/// Callbacks receive one of these, so they can send replies, disconnect or
/// inspect counters on the handle that raised the event. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct SocketContext {
    pub(crate) inner: Arc<Inner>,
}

impl SocketContext {
    /// Start listening on `0.0.0.0:port`.
    ///
    /// Stream disciplines accept connections and raise
    /// [`SocketEvent::Accept`]; datagram handles raise
    /// [`SocketEvent::Receive`] per datagram.
    pub fn listen(&self, port: u16) -> SocketResult<()> {
        let slot = self.inner.claim()?;
        if port == 0 {
            return Err(SocketError::InvalidArgument);
        }

        let endpoint = Endpoint::listen(self.discipline(), port)?;
        let role = if self.discipline().is_stream() {
            Role::Listen
        } else {
            Role::DatagramReceive
        };
        self.inner.begin(slot, endpoint, role);
        Ok(())
    }

    /// Connect to `host:port`.
    ///
    /// A datagram handle given no host sends to the IPv4 broadcast address.
    pub fn connect(&self, host: Option<&str>, port: u16) -> SocketResult<()> {
        let slot = self.inner.claim()?;
        if port == 0 {
            return Err(SocketError::InvalidArgument);
        }

        let endpoint = Endpoint::connect(self.discipline(), host, port)?;
        let role = if self.discipline().is_stream() {
            Role::AcceptRead
        } else {
            Role::Connected
        };
        self.inner.begin(slot, endpoint, role);
        Ok(())
    }

    /// Start reading from a connection a listening handle accepted
    pub fn accept(&self, connection: Incoming) -> SocketResult<()> {
        let slot = self.inner.claim()?;
        if !self.discipline().is_stream() || connection.discipline != self.discipline() {
            log::debug!(
                "{} handle can't take a connection from a {} listener",
                self.discipline().as_str(),
                connection.discipline.as_str()
            );
            return Err(SocketError::Protocol);
        }

        let peer = connection.peer_addr();
        let endpoint = Endpoint::adopt(connection.stream)?;
        self.inner.set_peer(Some(peer));
        self.inner.begin(slot, endpoint, Role::AcceptRead);
        Ok(())
    }

    /// Send one message, framed according to the handle's discipline
    pub fn send(&self, payload: &[u8]) -> SocketResult<()> {
        if self.is_stop_requested() {
            return Err(SocketError::Closed);
        }
        let endpoint = self.inner.endpoint().ok_or(SocketError::Closed)?;

        endpoint.send(self.discipline(), payload)?;
        self.inner
            .bytes_sent
            .fetch_add(payload.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Close the current session and return the handle to idle.
    ///
    /// The worker does not report a local disconnect as an error.
    pub fn disconnect(&self) -> SocketResult<()> {
        let result = self.inner.hang_up();
        self.inner.wait_idle();
        result
    }

    pub fn discipline(&self) -> Discipline {
        self.inner.discipline
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::SeqCst)
    }

    /// Current size of the worker's receive buffer
    pub fn buffer_capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::SeqCst)
    }

    /// Peer of the last accepted connection or received datagram
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoint().and_then(|endpoint| endpoint.local_addr())
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// Whether the worker thread has exited
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

/// A socket and the worker thread serving it.
///
/// Dropping the handle (or calling [`SocketHandle::delete`]) stops the
/// worker, closes the descriptor and releases the buffer. This is allowed
/// from inside the handle's own callback.
#[derive(Debug)]
pub struct SocketHandle {
    context: SocketContext,
    worker: Option<JoinHandle<()>>,
}

impl SocketHandle {
    /// Create an idle handle and start its worker
    pub fn new<F>(discipline: Discipline, callback: F) -> SocketResult<Self>
    where
        F: FnMut(&SocketContext, SocketEvent<'_>) + Send + 'static,
    {
        let context = SocketContext {
            inner: Arc::new(Inner::new(discipline)),
        };

        let worker_context = context.clone();
        let callback: Callback = Box::new(callback);
        let worker = thread::Builder::new()
            .name(format!("avctl-{}", discipline.as_str()))
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || Worker::new(worker_context, callback).run())
            .map_err(|e| {
                log::error!("failed to spawn socket worker: {}", e);
                SocketError::Thread
            })?;

        // The worker parks in short slices, so it is fine if it starts
        // before this is set.
        let _ = context.inner.worker.set(worker.thread().clone());

        Ok(Self {
            context,
            worker: Some(worker),
        })
    }

    pub fn context(&self) -> &SocketContext {
        &self.context
    }

    /// Tear the handle down. Same as dropping it.
    pub fn delete(self) {
        drop(self);
    }
}

impl Deref for SocketHandle {
    type Target = SocketContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        let inner = &self.context.inner;
        inner.stop_requested.store(true, Ordering::SeqCst);
        if let Err(e) = inner.hang_up() {
            log::debug!("{} socket teardown: {}", inner.discipline.as_str(), e);
        }

        let Some(worker) = self.worker.take() else {
            return;
        };

        if worker.thread().id() == thread::current().id() {
            // Deleted from its own callback. The worker sees the stop flag
            // once the callback returns and exits on its own.
            log::debug!("{} socket deleted by its worker, detaching", inner.discipline.as_str());
            return;
        }

        worker.thread().unpark();
        if worker.join().is_err() {
            log::error!("{} socket worker panicked", inner.discipline.as_str());
        }
    }
}
