use crate::context::Shared;
use crate::net::conn::Protocol;
use crate::net::worker::{Handoff, HandoffStream, Intake};
use crate::settings::Settings;
use hearth::logging;
use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use mio_uds::UnixListener;
use std::io;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GATE_TOKEN: Token = Token(0);
const LISTENER_TOKEN_BASE: usize = 1;

/// Throttle switch for accept under descriptor exhaustion. Workers flip it
/// back and wake the dispatcher when a connection closes.
pub struct AcceptGate {
    throttled: AtomicBool,
    wake: SetReadiness,
}

impl AcceptGate {
    /// Returns the gate and the registration the dispatcher must poll.
    pub fn new() -> (Arc<AcceptGate>, Registration) {
        let (registration, wake) = Registration::new2();
        (
            Arc::new(AcceptGate {
                throttled: AtomicBool::new(false),
                wake,
            }),
            registration,
        )
    }

    fn throttle(&self) {
        self.throttled.store(true, Ordering::SeqCst);
    }

    fn clear_wake(&self) {
        self.wake
            .set_readiness(Ready::empty())
            .expect("Error clearing accept gate readiness");
    }

    /// Called by workers on every connection close.
    pub fn connection_closed(&self) {
        if self.throttled.swap(false, Ordering::SeqCst) {
            self.wake
                .set_readiness(Ready::readable())
                .expect("Error signalling accept gate");
        }
    }
}

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Binds the configured listeners: either the unix socket (network
/// listeners disabled) or every address the bind host resolves to.
pub fn bind_listeners(settings: &Settings, log: &logging::Logger) -> io::Result<Vec<Listener>> {
    let mut listeners = Vec::new();

    if let Some(path) = &settings.socket_path {
        // Clean up a previous socket file if we left one around.
        if let Ok(meta) = std::fs::symlink_metadata(path) {
            use std::os::unix::fs::FileTypeExt;
            if meta.file_type().is_socket() {
                std::fs::remove_file(path)?;
            }
        }

        let listener = UnixListener::bind(path)?;
        let perms = std::os::unix::fs::PermissionsExt::from_mode(settings.access);
        std::fs::set_permissions(path, perms)?;
        logging::info!(log, "listening on unix socket"; "path" => %path.display());
        listeners.push(Listener::Unix(listener));
        return Ok(listeners);
    }

    let host = settings.inter.as_deref().unwrap_or("::");
    let addrs: Vec<_> = (host, settings.port).to_socket_addrs()?.collect();
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to bind");

    for addr in addrs {
        match std::net::TcpListener::bind(addr) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                logging::info!(log, "listening"; "addr" => %addr);
                listeners.push(Listener::Tcp(TcpListener::from_std(listener)?));
            }
            Err(err) => {
                logging::warn!(log, "bind failed"; "addr" => %addr, "error" => %err);
                last_err = err;
            }
        }
    }

    if listeners.is_empty() {
        return Err(last_err);
    }
    Ok(listeners)
}

/// The dispatcher: owns the listening sockets, accepts, and deals new
/// connections round-robin onto the worker intake queues. Also ticks the
/// relative clock once per poll interval.
pub struct Dispatcher {
    poll: Poll,
    events: Events,
    listeners: Vec<Listener>,
    workers: Vec<Arc<Intake>>,
    gate: Arc<AcceptGate>,
    _gate_registration: Registration,
    next_worker: usize,
    shared: Arc<Shared>,
    log: logging::Logger,
}

impl Dispatcher {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        shared: Arc<Shared>,
        listeners: Vec<Listener>,
        workers: Vec<Arc<Intake>>,
        gate: Arc<AcceptGate>,
        gate_registration: Registration,
        log: L,
    ) -> io::Result<Dispatcher> {
        assert!(!workers.is_empty(), "dispatcher needs at least one worker");

        let dispatch_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let poll = Poll::new()?;
        poll.register(&gate_registration, GATE_TOKEN, Ready::readable(), PollOpt::edge())?;

        let dispatcher = Dispatcher {
            poll,
            events: Events::with_capacity(64),
            listeners,
            workers,
            gate,
            _gate_registration: gate_registration,
            next_worker: 0,
            shared,
            log: dispatch_log,
        };
        dispatcher.register_listeners()?;
        Ok(dispatcher)
    }

    fn register_listeners(&self) -> io::Result<()> {
        for (i, listener) in self.listeners.iter().enumerate() {
            let token = Token(i + LISTENER_TOKEN_BASE);
            match listener {
                Listener::Tcp(l) => {
                    self.poll.register(l, token, Ready::readable(), PollOpt::level())?
                }
                Listener::Unix(l) => {
                    self.poll.register(l, token, Ready::readable(), PollOpt::level())?
                }
            }
        }
        Ok(())
    }

    /// The accept loop; never returns in normal operation.
    pub fn run(&mut self) {
        logging::info!(self.log, "dispatcher running";
                       "context" => "run",
                       "workers" => self.workers.len());
        loop {
            self.poll
                .poll(&mut self.events, Some(Duration::from_secs(1)))
                .expect("Dispatcher poll failed");
            self.shared.clock().tick();

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                if token == GATE_TOKEN {
                    self.enable_accept();
                } else {
                    self.accept_ready(token.0 - LISTENER_TOKEN_BASE);
                }
            }
        }
    }

    fn accept_ready(&mut self, idx: usize) {
        loop {
            let accepted = match &self.listeners[idx] {
                Listener::Tcp(listener) => match listener.accept() {
                    Ok((stream, addr)) => {
                        logging::debug!(self.log, "accepted"; "context" => "accept", "peer" => %addr);
                        stream.set_nodelay(true).ok();
                        Ok(Some(HandoffStream::Tcp(stream)))
                    }
                    Err(err) => Err(err),
                },
                Listener::Unix(listener) => match listener.accept() {
                    Ok(Some((stream, _))) => Ok(Some(HandoffStream::Unix(stream))),
                    Ok(None) => Ok(None),
                    Err(err) => Err(err),
                },
            };

            let stream = match accepted {
                Ok(Some(stream)) => stream,
                Ok(None) => return,
                Err(err) => {
                    self.accept_error(err);
                    return;
                }
            };

            self.workers[self.next_worker].push(Handoff {
                stream,
                protocol: Protocol::Negotiating,
            });
            self.next_worker = (self.next_worker + 1) % self.workers.len();
        }
    }

    fn accept_error(&mut self, err: io::Error) {
        if err.kind() == io::ErrorKind::WouldBlock {
            return;
        }
        if err.raw_os_error() == Some(libc::EMFILE) {
            logging::warn!(self.log, "descriptor limit reached, throttling accepts";
                           "context" => "accept");
            self.throttle_accept();
            return;
        }
        logging::warn!(self.log, "accept failed"; "context" => "accept", "error" => %err);
    }

    /// Drops read interest on every listener until a worker reports a
    /// closed connection.
    fn throttle_accept(&mut self) {
        for listener in &self.listeners {
            let res = match listener {
                Listener::Tcp(l) => self.poll.deregister(l),
                Listener::Unix(l) => self.poll.deregister(l),
            };
            if let Err(err) = res {
                logging::warn!(self.log, "listener deregister failed";
                               "context" => "accept", "error" => %err);
            }
        }
        self.gate.throttle();
    }

    fn enable_accept(&mut self) {
        self.gate.clear_wake();
        if let Err(err) = self.register_listeners() {
            logging::warn!(self.log, "listener reregister failed";
                           "context" => "accept", "error" => %err);
            return;
        }
        logging::info!(self.log, "accepting connections again"; "context" => "accept");
    }
}
