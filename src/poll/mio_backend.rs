//! Descriptor backend: `mio::Poll` over epoll, periodic wake sources are
//! `timerfd`s on `CLOCK_MONOTONIC`.

use super::{Backend, Interest, PollError, Readiness, Source, SourceId};
use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Poll, Token as MioToken};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::{debug, trace, warn};

const EVENT_CAPACITY: usize = 64;

pub struct MioBackend {
    poll: Poll,
    events: Events,
    // Owned timerfds, closed on cancel
    timers: HashMap<SourceId, OwnedFd>,
    // Caller-owned descriptors
    descriptors: HashMap<SourceId, RawFd>,
}

impl MioBackend {
    pub fn new() -> Result<Self, PollError> {
        let poll = Poll::new().map_err(map_registration_error)?;
        debug!("Created epoll instance for descriptor backend");
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            timers: HashMap::new(),
            descriptors: HashMap::new(),
        })
    }

    fn register_fd(&self, id: SourceId, fd: RawFd, interest: MioInterest) -> Result<(), PollError> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), MioToken(id.0 as usize), interest)
            .map_err(map_registration_error)
    }
}

impl Backend for MioBackend {
    fn start(&mut self, id: SourceId, source: &Source) -> Result<(), PollError> {
        match *source {
            Source::Timer { period } => {
                if period.is_zero() {
                    return Err(PollError::InvalidArgument(
                        "timer period must be positive".to_string(),
                    ));
                }
                let timer = create_timerfd(period).map_err(map_registration_error)?;
                self.register_fd(id, timer.as_raw_fd(), MioInterest::READABLE)?;
                trace!("Armed timerfd {} for {} every {:?}", timer.as_raw_fd(), id, period);
                self.timers.insert(id, timer);
            }
            Source::Fd { fd, interest } => {
                let interest = match interest {
                    Interest::Read => MioInterest::READABLE,
                    Interest::Write => MioInterest::WRITABLE,
                    Interest::ReadWrite => MioInterest::READABLE | MioInterest::WRITABLE,
                };
                self.register_fd(id, fd, interest)?;
                self.descriptors.insert(id, fd);
            }
        }
        Ok(())
    }

    fn cancel(&mut self, id: SourceId) {
        let fd = if let Some(timer) = self.timers.get(&id) {
            timer.as_raw_fd()
        } else if let Some(fd) = self.descriptors.remove(&id) {
            fd
        } else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            // Already closed descriptors are dropped from epoll by the kernel
            debug!("Deregistering {} failed: {}", id, e);
        }
        // Dropping the OwnedFd closes the timerfd
        self.timers.remove(&id);
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(SourceId, Readiness)>,
    ) -> Result<(), PollError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                debug!("epoll wait interrupted");
                return Ok(());
            }
            Err(e) => return Err(PollError::Io(e)),
        }

        for event in self.events.iter() {
            let id = SourceId(event.token().0 as u32);

            if event.is_error() {
                ready.push((id, Readiness::Closed));
                continue;
            }

            if event.is_readable() {
                match self.timers.get(&id) {
                    Some(timer) => {
                        let expirations = drain_timerfd(timer.as_raw_fd());
                        if expirations > 1 {
                            trace!("{} expired {} times since last wake", id, expirations);
                        }
                        ready.push((id, Readiness::TimerFired));
                    }
                    None => ready.push((id, Readiness::Readable)),
                }
            }

            if event.is_writable() {
                ready.push((id, Readiness::Writable));
            }

            if event.is_read_closed() && !event.is_readable() {
                ready.push((id, Readiness::Closed));
            }
        }

        Ok(())
    }
}

fn create_timerfd(period: Duration) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall, the returned descriptor is checked before use
    let raw = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a fresh descriptor nobody else owns
    let timer = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: all-zero is a valid itimerspec
    let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
    spec.it_interval.tv_sec = period.as_secs() as _;
    spec.it_interval.tv_nsec = period.subsec_nanos() as _;
    spec.it_value = spec.it_interval;

    // SAFETY: `timer` is a valid timerfd and `spec` outlives the call
    let rc = unsafe { libc::timerfd_settime(timer.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(timer)
}

// Returns the expiration count, 0 when nothing was pending
fn drain_timerfd(fd: RawFd) -> u64 {
    let mut buf = [0u8; 8];
    // SAFETY: `buf` is 8 writable bytes, the size timerfd reads require
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n == buf.len() as isize {
        u64::from_ne_bytes(buf)
    } else {
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::WouldBlock {
            warn!("Reading timerfd {} failed: {}", fd, err);
        }
        0
    }
}

fn map_registration_error(err: io::Error) -> PollError {
    match err.raw_os_error() {
        Some(libc::ENOSPC) | Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM) => {
            PollError::ResourceExhausted(err.to_string())
        }
        _ => PollError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{Callbacks, Flow, Multiplexer, Token};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Instant;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for both ends
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // SAFETY: fresh descriptors owned by the caller
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_byte(fd: &OwnedFd) {
        // SAFETY: writing one byte from a live buffer
        let written = unsafe { libc::write(fd.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(written, 1);
    }

    extern "C" fn ignore_signal(_: libc::c_int) {}

    #[test]
    fn timerfd_fires_after_its_period() {
        let mut backend = MioBackend::new().unwrap();
        let id = SourceId(3);
        backend
            .start(id, &Source::Timer { period: Duration::from_millis(5) })
            .unwrap();

        let start = Instant::now();
        let mut ready = Vec::new();
        while ready.is_empty() {
            backend.wait(Some(Duration::from_millis(100)), &mut ready).unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(4));
        assert_eq!(ready, vec![(id, Readiness::TimerFired)]);
    }

    #[test]
    fn cancelled_timer_stays_quiet() {
        let mut backend = MioBackend::new().unwrap();
        let id = SourceId(0);
        backend
            .start(id, &Source::Timer { period: Duration::from_millis(1) })
            .unwrap();
        backend.cancel(id);
        backend.cancel(id);

        let mut ready = Vec::new();
        backend.wait(Some(Duration::from_millis(10)), &mut ready).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn zero_period_is_rejected() {
        let mut backend = MioBackend::new().unwrap();
        let err = backend
            .start(SourceId(0), &Source::Timer { period: Duration::ZERO })
            .unwrap_err();
        assert!(matches!(err, PollError::InvalidArgument(_)));
    }

    #[test]
    fn readable_pipe_is_reported() {
        let (reader, writer) = pipe();

        let mut backend = MioBackend::new().unwrap();
        let id = SourceId(9);
        backend
            .start(
                id,
                &Source::Fd {
                    fd: reader.as_raw_fd(),
                    interest: Interest::Read,
                },
            )
            .unwrap();

        write_byte(&writer);

        let mut ready = Vec::new();
        backend.wait(Some(Duration::from_millis(100)), &mut ready).unwrap();
        assert!(ready.contains(&(id, Readiness::Readable)));

        backend.cancel(id);
    }

    #[test]
    fn pipe_behind_a_stopping_timer_is_still_dispatched() {
        let (reader, writer) = pipe();
        let reads = Rc::new(Cell::new(0));
        let mut mux = Multiplexer::new().unwrap();

        let timer = mux
            .register(
                Source::Timer { period: Duration::from_millis(5) },
                Token(0),
                Callbacks::new().on_read(|_, _| Flow::Stop),
            )
            .unwrap();
        let fd = reader.as_raw_fd();
        let count = Rc::clone(&reads);
        mux.register(
            Source::Fd { fd, interest: Interest::Read },
            Token(1),
            Callbacks::new().on_read(move |_, _| {
                let mut buf = [0u8; 8];
                // SAFETY: `buf` is writable and `fd` stays open for the test
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                count.set(count.get() + n.max(0));
                Flow::Continue
            }),
        )
        .unwrap();

        // Timer expired and pipe readable in the same epoll batch
        std::thread::sleep(Duration::from_millis(20));
        write_byte(&writer);
        assert_eq!(mux.poll().unwrap(), Flow::Stop);

        mux.unregister(timer);
        for _ in 0..5 {
            if reads.get() > 0 {
                break;
            }
            mux.poll_timeout(Some(Duration::from_millis(50))).unwrap();
        }

        assert_eq!(reads.get(), 1);
    }

    #[test]
    fn interrupted_wait_returns_an_empty_batch() {
        // SAFETY: all-zero is a valid sigaction, the handler does nothing
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = ignore_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            assert_eq!(libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()), 0);
        }

        let mut backend = MioBackend::new().unwrap();
        // SAFETY: querying the calling thread
        let waiter = unsafe { libc::pthread_self() };
        let signaller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            // SAFETY: the waiting thread outlives this one, it joins below
            unsafe { libc::pthread_kill(waiter, libc::SIGUSR1) };
        });

        let start = Instant::now();
        let mut ready = Vec::new();
        backend.wait(Some(Duration::from_secs(5)), &mut ready).unwrap();
        let waited = start.elapsed();
        signaller.join().unwrap();

        assert!(ready.is_empty());
        assert!(waited < Duration::from_secs(4), "wait ran for {:?}", waited);
    }
}
