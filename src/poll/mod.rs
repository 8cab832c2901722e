//! Readiness multiplexer
//!
//! Sources are registered together with a set of callbacks and a user token.
//! [`Multiplexer::poll`] waits on the backend, then dispatches every ready
//! source synchronously on the calling thread.
//!
//! # Cooperative cancellation
//!
//! A callback returning [`Flow::Stop`] ends the current dispatch batch: the
//! remaining ready sources are kept and `poll` returns `Flow::Stop` to its
//! caller. The next call dispatches them first, without waiting on the
//! backend, so an edge triggered descriptor is never lost. This is the only way for a callback to hand
//! control back, so callers can re-check their own termination state between
//! bursts of work without busy polling.
//!
//! ```text
//! register ──► Backend::start
//! poll ──────► Backend::wait ──► [(SourceId, Readiness)] ──► callbacks
//! unregister ► Backend::cancel
//! ```
//!
//! Callbacks never see the multiplexer, so re-entering `poll` from inside a
//! callback is ruled out by ownership.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace, warn};

#[cfg(target_os = "linux")]
pub mod mio_backend;
#[cfg(test)]
pub(crate) mod scripted;
pub mod wait_backend;

/// Backend used by [`Multiplexer::new`].
#[cfg(target_os = "linux")]
pub type DefaultBackend = mio_backend::MioBackend;

/// Backend used by [`Multiplexer::new`].
#[cfg(not(target_os = "linux"))]
pub type DefaultBackend = wait_backend::WaitBackend;

/// Registration limit applied by [`Multiplexer::new`].
pub const DEFAULT_MAX_SOURCES: usize = 64;

/// Handle of a registered source. Unique among currently registered sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u32);

impl SourceId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Opaque value handed back to every callback of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token(pub usize);

/// What happened to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
    /// Error or hang-up. The source is removed after its close callback ran.
    Closed,
    /// A periodic wake source expired.
    TimerFired,
}

/// Return value of a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    /// Stop dispatching the current batch and return from `poll`.
    Stop,
}

impl Flow {
    pub fn is_stop(self) -> bool {
        matches!(self, Flow::Stop)
    }
}

/// Readiness a descriptor source is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

/// Something the backend can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Periodic wake source, first expiry one period after registration.
    Timer { period: Duration },
    /// Caller-owned descriptor. The descriptor backend is edge triggered, so
    /// the read callback has to drain it.
    #[cfg(unix)]
    Fd {
        fd: std::os::fd::RawFd,
        interest: Interest,
    },
}

pub type Callback = Box<dyn FnMut(SourceId, Token) -> Flow>;

/// Callback set of a source. Missing callbacks behave as `Flow::Continue`.
#[derive(Default)]
pub struct Callbacks {
    read: Option<Callback>,
    write: Option<Callback>,
    close: Option<Callback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs on `Readable` and `TimerFired`.
    pub fn on_read(mut self, callback: impl FnMut(SourceId, Token) -> Flow + 'static) -> Self {
        self.read = Some(Box::new(callback));
        self
    }

    pub fn on_write(mut self, callback: impl FnMut(SourceId, Token) -> Flow + 'static) -> Self {
        self.write = Some(Box::new(callback));
        self
    }

    pub fn on_close(mut self, callback: impl FnMut(SourceId, Token) -> Flow + 'static) -> Self {
        self.close = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("close", &self.close.is_some())
            .finish()
    }
}

// Multiplexer errors
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported source: {0}")]
    Unsupported(String),

    #[error("Nothing to wait for: no sources registered and no timeout given")]
    NoSources,

    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Platform wait primitive behind the multiplexer.
///
/// `start` arms a source, `cancel` disarms it (unknown ids are ignored) and
/// `wait` blocks until something is ready or `timeout` elapses, appending what
/// it saw to `ready`. An interrupted wait appends nothing and returns `Ok`.
pub trait Backend {
    fn start(&mut self, id: SourceId, source: &Source) -> Result<(), PollError>;

    fn cancel(&mut self, id: SourceId);

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(SourceId, Readiness)>,
    ) -> Result<(), PollError>;
}

struct Entry {
    token: Token,
    callbacks: Callbacks,
}

/// Single-threaded readiness multiplexer.
pub struct Multiplexer<B: Backend = DefaultBackend> {
    backend: B,
    entries: HashMap<SourceId, Entry>,
    next_id: u32,
    max_sources: usize,
    ready: Vec<(SourceId, Readiness)>,
    // Undispatched tail of a stopped batch
    pending: VecDeque<(SourceId, Readiness)>,
}

impl Multiplexer<DefaultBackend> {
    /// Creates a multiplexer on the platform default backend.
    pub fn new() -> Result<Self, PollError> {
        Ok(Self::with_backend(DefaultBackend::new()?, DEFAULT_MAX_SOURCES))
    }
}

impl<B: Backend> Multiplexer<B> {
    pub fn with_backend(backend: B, max_sources: usize) -> Self {
        debug!(
            "Creating multiplexer with a limit of {} sources",
            max_sources
        );
        Self {
            backend,
            entries: HashMap::new(),
            next_id: 0,
            max_sources,
            ready: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Registers `source` and arms it on the backend.
    ///
    /// # Errors
    ///
    /// [`PollError::ResourceExhausted`] when the registration limit or a
    /// platform limit is reached, plus whatever the backend rejects.
    pub fn register(
        &mut self,
        source: Source,
        token: Token,
        callbacks: Callbacks,
    ) -> Result<SourceId, PollError> {
        if self.entries.len() >= self.max_sources {
            warn!(
                "Refusing to register {:?}: limit of {} sources reached",
                source, self.max_sources
            );
            return Err(PollError::ResourceExhausted(format!(
                "limit of {} registered sources reached",
                self.max_sources
            )));
        }

        let id = self.allocate_id();
        self.backend.start(id, &source)?;
        self.entries.insert(id, Entry { token, callbacks });

        debug!("Registered {} ({:?}) with token {:?}", id, source, token);
        Ok(id)
    }

    /// Removes a source. Unknown or already removed ids are ignored.
    pub fn unregister(&mut self, id: SourceId) {
        if self.entries.remove(&id).is_some() {
            self.backend.cancel(id);
            self.pending.retain(|(pending, _)| *pending != id);
            debug!("Unregistered {}", id);
        } else {
            trace!("Ignoring unregister of unknown {}", id);
        }
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Blocks until at least one source is ready, then dispatches the batch.
    pub fn poll(&mut self) -> Result<Flow, PollError> {
        self.poll_timeout(None)
    }

    /// Like [`poll`](Self::poll) but gives up after `timeout`.
    ///
    /// Returns `Flow::Stop` when a callback stopped the batch early. Sources
    /// left over from a stopped batch are dispatched before waiting again.
    pub fn poll_timeout(&mut self, timeout: Option<Duration>) -> Result<Flow, PollError> {
        if !self.pending.is_empty() {
            trace!(
                "Dispatching {} sources left from the previous batch",
                self.pending.len()
            );
            return Ok(self.dispatch());
        }

        if timeout.is_none() && self.entries.is_empty() {
            return Err(PollError::NoSources);
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();

        let waited = self.backend.wait(timeout, &mut ready);
        if waited.is_ok() {
            self.pending.extend(ready.drain(..));
        }
        self.ready = ready;

        waited.map(|()| self.dispatch())
    }

    /// Number of ready sources still waiting for dispatch.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn dispatch(&mut self) -> Flow {
        while let Some((id, readiness)) = self.pending.pop_front() {
            let Some(entry) = self.entries.get_mut(&id) else {
                trace!("Dropping {:?} for removed {}", readiness, id);
                continue;
            };
            let token = entry.token;

            let callback = match readiness {
                Readiness::Readable | Readiness::TimerFired => entry.callbacks.read.as_mut(),
                Readiness::Writable => entry.callbacks.write.as_mut(),
                Readiness::Closed => entry.callbacks.close.as_mut(),
            };
            let flow = callback.map_or(Flow::Continue, |cb| cb(id, token));

            if readiness == Readiness::Closed {
                debug!("{} closed, removing it", id);
                self.entries.remove(&id);
                self.backend.cancel(id);
            }

            if flow.is_stop() {
                trace!("{} stopped the dispatch batch", id);
                return Flow::Stop;
            }
        }

        Flow::Continue
    }

    fn allocate_id(&mut self) -> SourceId {
        loop {
            let id = SourceId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedBackend;
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder(log: &Rc<RefCell<Vec<(u32, usize)>>>, flow: Flow) -> impl FnMut(SourceId, Token) -> Flow {
        let log = Rc::clone(log);
        move |id, token| {
            log.borrow_mut().push((id.get(), token.0));
            flow
        }
    }

    fn timer() -> Source {
        Source::Timer {
            period: Duration::from_millis(1),
        }
    }

    #[test]
    fn registration_limit_reports_resource_exhausted() {
        let mut mux = Multiplexer::with_backend(ScriptedBackend::default(), 2);
        mux.register(timer(), Token(0), Callbacks::new()).unwrap();
        mux.register(timer(), Token(1), Callbacks::new()).unwrap();

        let err = mux.register(timer(), Token(2), Callbacks::new()).unwrap_err();
        assert!(matches!(err, PollError::ResourceExhausted(_)));
        assert_eq!(mux.len(), 2);
    }

    #[test]
    fn ids_stay_unique_after_removal() {
        let mut mux = Multiplexer::with_backend(ScriptedBackend::default(), 4);
        let a = mux.register(timer(), Token(0), Callbacks::new()).unwrap();
        let b = mux.register(timer(), Token(0), Callbacks::new()).unwrap();
        assert_ne!(a, b);

        mux.unregister(a);
        let c = mux.register(timer(), Token(0), Callbacks::new()).unwrap();
        assert_ne!(c, b);
        assert!(mux.contains(b) && mux.contains(c));
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut mux = Multiplexer::with_backend(ScriptedBackend::default(), 4);
        let id = mux.register(timer(), Token(0), Callbacks::new()).unwrap();

        mux.unregister(id);
        mux.unregister(id);

        assert!(mux.is_empty());
        assert_eq!(mux.backend().cancelled, vec![id]);
    }

    #[test]
    fn drains_whole_batch_when_nobody_stops() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut backend = ScriptedBackend::default();
        backend.push_batch(vec![(0, Readiness::Readable), (1, Readiness::TimerFired)]);

        let mut mux = Multiplexer::with_backend(backend, 4);
        mux.register(timer(), Token(7), Callbacks::new().on_read(recorder(&log, Flow::Continue)))
            .unwrap();
        mux.register(timer(), Token(8), Callbacks::new().on_read(recorder(&log, Flow::Continue)))
            .unwrap();

        let flow = mux.poll().unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(*log.borrow(), vec![(0, 7), (1, 8)]);
    }

    #[test]
    fn stop_returns_before_draining_the_rest() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut backend = ScriptedBackend::default();
        backend.push_batch(vec![(0, Readiness::Readable), (1, Readiness::Readable)]);

        let mut mux = Multiplexer::with_backend(backend, 4);
        mux.register(timer(), Token(0), Callbacks::new().on_read(recorder(&log, Flow::Stop)))
            .unwrap();
        mux.register(timer(), Token(1), Callbacks::new().on_read(recorder(&log, Flow::Continue)))
            .unwrap();

        assert_eq!(mux.poll().unwrap(), Flow::Stop);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn stopped_batch_tail_is_dispatched_next_without_waiting() {
        let first = Rc::new(RefCell::new(Vec::new()));
        let second = Rc::new(RefCell::new(Vec::new()));
        let mut backend = ScriptedBackend::default();
        backend.push_batch(vec![(0, Readiness::TimerFired), (1, Readiness::Readable)]);
        backend.push_batch(vec![(0, Readiness::TimerFired)]);

        let mut mux = Multiplexer::with_backend(backend, 4);
        mux.register(timer(), Token(0), Callbacks::new().on_read(recorder(&first, Flow::Stop)))
            .unwrap();
        mux.register(timer(), Token(1), Callbacks::new().on_read(recorder(&second, Flow::Continue)))
            .unwrap();

        assert_eq!(mux.poll().unwrap(), Flow::Stop);
        assert_eq!(mux.pending(), 1);
        assert!(second.borrow().is_empty());

        // Served from the kept tail, the second scripted batch stays queued
        assert_eq!(mux.poll().unwrap(), Flow::Continue);
        assert_eq!(*second.borrow(), vec![(1, 1)]);
        assert_eq!(first.borrow().len(), 1);
        assert_eq!(mux.pending(), 0);

        assert_eq!(mux.poll().unwrap(), Flow::Stop);
        assert_eq!(first.borrow().len(), 2);
    }

    #[test]
    fn unregistering_drops_its_pending_readiness() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut backend = ScriptedBackend::default();
        backend.push_batch(vec![(0, Readiness::Readable), (1, Readiness::Readable)]);

        let mut mux = Multiplexer::with_backend(backend, 4);
        mux.register(timer(), Token(0), Callbacks::new().on_read(recorder(&log, Flow::Stop)))
            .unwrap();
        let second = mux
            .register(timer(), Token(1), Callbacks::new().on_read(recorder(&log, Flow::Continue)))
            .unwrap();

        assert_eq!(mux.poll().unwrap(), Flow::Stop);
        mux.unregister(second);

        assert_eq!(mux.pending(), 0);
    }

    #[test]
    fn readiness_is_routed_to_matching_callback() {
        let reads = Rc::new(RefCell::new(Vec::new()));
        let writes = Rc::new(RefCell::new(Vec::new()));
        let mut backend = ScriptedBackend::default();
        backend.push_batch(vec![(0, Readiness::Writable), (0, Readiness::Readable)]);

        let mut mux = Multiplexer::with_backend(backend, 4);
        mux.register(
            timer(),
            Token(3),
            Callbacks::new()
                .on_read(recorder(&reads, Flow::Continue))
                .on_write(recorder(&writes, Flow::Continue)),
        )
        .unwrap();

        mux.poll().unwrap();

        assert_eq!(*reads.borrow(), vec![(0, 3)]);
        assert_eq!(*writes.borrow(), vec![(0, 3)]);
    }

    #[test]
    fn closed_source_runs_close_callback_and_is_removed() {
        let closes = Rc::new(RefCell::new(Vec::new()));
        let reads = Rc::new(RefCell::new(Vec::new()));
        let mut backend = ScriptedBackend::default();
        backend.push_batch(vec![(0, Readiness::Closed), (0, Readiness::Readable)]);

        let mut mux = Multiplexer::with_backend(backend, 4);
        let id = mux
            .register(
                timer(),
                Token(5),
                Callbacks::new()
                    .on_read(recorder(&reads, Flow::Continue))
                    .on_close(recorder(&closes, Flow::Continue)),
            )
            .unwrap();

        mux.poll().unwrap();

        assert_eq!(*closes.borrow(), vec![(0, 5)]);
        assert!(reads.borrow().is_empty());
        assert!(!mux.contains(id));
    }

    #[test]
    fn poll_without_sources_or_timeout_is_rejected() {
        let mut mux = Multiplexer::with_backend(ScriptedBackend::default(), 4);
        assert!(matches!(mux.poll(), Err(PollError::NoSources)));
        assert_eq!(mux.poll_timeout(Some(Duration::ZERO)).unwrap(), Flow::Continue);
    }

    #[test]
    fn backend_rejection_leaves_no_entry_behind() {
        let mut backend = ScriptedBackend::default();
        backend.fail_start = true;
        let mut mux = Multiplexer::with_backend(backend, 4);

        assert!(mux.register(timer(), Token(0), Callbacks::new()).is_err());
        assert!(mux.is_empty());
    }
}
