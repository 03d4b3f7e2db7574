use crate::context::Shared;
use crate::net::conn::{Conn, Next, Protocol, State, Transport};
use crate::net::dispatch::AcceptGate;
use crate::stats::ThreadStats;
use hearth::logging;
use indexmap::IndexSet;
use mio::net::UdpSocket;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const INTAKE_TOKEN: Token = Token(0);
const CONN_TOKEN_BASE: usize = 1;

/// Stream handed from the dispatcher to a worker.
pub enum HandoffStream {
    Tcp(mio::net::TcpStream),
    Unix(mio_uds::UnixStream),
}

/// One accepted connection on its way to a worker.
pub struct Handoff {
    pub stream: HandoffStream,
    pub protocol: Protocol,
}

/// The per-worker handoff queue plus the readiness hook that wakes the
/// worker's reactor when something lands in it.
pub struct Intake {
    queue: Mutex<VecDeque<Handoff>>,
    ready: SetReadiness,
}

impl Intake {
    pub fn push(&self, handoff: Handoff) {
        self.queue
            .lock()
            .expect("worker intake lock poisoned")
            .push_back(handoff);
        self.ready
            .set_readiness(Ready::readable())
            .expect("Error signalling worker intake");
    }

    fn drain(&self) -> VecDeque<Handoff> {
        // Clear readiness before draining; a racing push may re-raise it
        // and cost one spurious wake-up, never a lost connection.
        self.ready
            .set_readiness(Ready::empty())
            .expect("Error clearing worker intake readiness");
        let mut queue = self.queue.lock().expect("worker intake lock poisoned");
        std::mem::take(&mut *queue)
    }
}

/// A worker: one reactor, one intake queue, and exclusive ownership of
/// every connection pinned to it.
pub struct Worker {
    id: usize,
    poll: Poll,
    events: Events,
    // Keeps the intake token registered for the life of the worker.
    _registration: Registration,
    intake: Arc<Intake>,
    conns: Vec<Conn>,
    free: Vec<usize>,
    live: IndexSet<usize>,
    /// Connections that yielded with buffered requests still pending.
    pending: Vec<usize>,
    shared: Arc<Shared>,
    stats: Arc<Mutex<ThreadStats>>,
    gate: Arc<AcceptGate>,
    log: logging::Logger,
}

impl Worker {
    /// Builds a worker reactor. When a UDP socket clone is supplied it is
    /// installed immediately as a permanent datagram connection; the OS
    /// load-balances datagrams across the workers' clones.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        id: usize,
        shared: Arc<Shared>,
        gate: Arc<AcceptGate>,
        udp: Option<std::net::UdpSocket>,
        log: L,
    ) -> io::Result<Worker> {
        let worker_log = match log.into() {
            Some(log) => log.new(logging::o!("worker" => id)),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let poll = Poll::new()?;
        let (registration, ready) = Registration::new2();
        poll.register(&registration, INTAKE_TOKEN, Ready::readable(), PollOpt::edge())?;

        let stats = shared.hub.workers[id].clone();
        let mut worker = Worker {
            id,
            poll,
            events: Events::with_capacity(1024),
            _registration: registration,
            intake: Arc::new(Intake {
                queue: Mutex::new(VecDeque::new()),
                ready,
            }),
            conns: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            pending: Vec::new(),
            shared,
            stats,
            gate,
            log: worker_log,
        };

        if let Some(sock) = udp {
            sock.set_nonblocking(true)?;
            let sock = UdpSocket::from_socket(sock)?;
            worker.install(Transport::Udp(sock), State::Read, Protocol::TextUdp)?;
        }

        Ok(worker)
    }

    pub fn intake(&self) -> Arc<Intake> {
        Arc::clone(&self.intake)
    }

    pub fn run(mut self) {
        logging::info!(self.log, "worker running"; "context" => "run", "worker" => self.id);
        loop {
            // With yielded connections waiting, poll without blocking so
            // their buffered requests resume right away.
            let timeout = if self.pending.is_empty() {
                None
            } else {
                Some(Duration::from_millis(0))
            };
            self.poll
                .poll(&mut self.events, timeout)
                .expect("Worker poll failed");

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                if token == INTAKE_TOKEN {
                    self.accept_handoffs();
                } else {
                    self.drive_conn(token.0 - CONN_TOKEN_BASE);
                }
            }

            let pending = std::mem::take(&mut self.pending);
            for idx in pending {
                self.drive_conn(idx);
            }
        }
    }

    fn accept_handoffs(&mut self) {
        for handoff in self.intake.drain() {
            let transport = match handoff.stream {
                HandoffStream::Tcp(stream) => Transport::Tcp(stream),
                HandoffStream::Unix(stream) => Transport::Unix(stream),
            };
            if let Err(err) = self.install(transport, State::NewCmd, handoff.protocol) {
                logging::warn!(self.log, "failed to install connection";
                               "context" => "intake", "error" => %err);
            }
        }
    }

    fn install(&mut self, transport: Transport, state: State, protocol: Protocol) -> io::Result<()> {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                let idx = self.conns.len();
                self.conns
                    .push(Conn::new(Arc::clone(&self.shared), Arc::clone(&self.stats), &self.log));
                self.shared
                    .hub
                    .global
                    .lock()
                    .expect("global stats lock poisoned")
                    .conn_structs += 1;
                idx
            }
        };

        self.conns[idx].open(transport, state, protocol);
        let token = Token(idx + CONN_TOKEN_BASE);
        if let Err(err) = self.conns[idx].register(&self.poll, token) {
            self.conns[idx].cleanup();
            self.conns[idx].close();
            self.free.push(idx);
            return Err(err);
        }

        self.live.insert(idx);
        let mut global = self
            .shared
            .hub
            .global
            .lock()
            .expect("global stats lock poisoned");
        global.curr_conns += 1;
        global.total_conns += 1;
        Ok(())
    }

    fn drive_conn(&mut self, idx: usize) {
        if idx >= self.conns.len() || !self.conns[idx].is_open() {
            return;
        }

        let registered = self.conns[idx].interest;
        match self.conns[idx].drive() {
            Next::Keep => {
                if self.conns[idx].interest != registered {
                    let token = Token(idx + CONN_TOKEN_BASE);
                    if let Err(err) = self.conns[idx].reregister(&self.poll, token) {
                        logging::warn!(self.log, "reregister failed";
                                       "context" => "drive", "error" => %err);
                        self.close_conn(idx);
                    }
                }
            }
            Next::Yield => self.pending.push(idx),
            Next::Close => self.close_conn(idx),
        }
    }

    fn close_conn(&mut self, idx: usize) {
        let _ = self.conns[idx].deregister(&self.poll);
        self.conns[idx].cleanup();
        self.conns[idx].close();
        self.live.remove(&idx);
        self.free.push(idx);

        self.shared
            .hub
            .global
            .lock()
            .expect("global stats lock poisoned")
            .curr_conns -= 1;

        // If accept was throttled on descriptor exhaustion, this close
        // frees one; poke the dispatcher.
        self.gate.connection_closed();
    }
}
