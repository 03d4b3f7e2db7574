use crate::context::Shared;
use crate::item::StagedItem;
use crate::net::buffer::Buffer;
use crate::net::shared::{
    Cause, NetError, NetResult, SuffixBuf, DATA_BUFFER_SIZE, IOV_LIST_HIGHWAT, IOV_LIST_INITIAL,
    IOV_MAX, ITEM_LIST_HIGHWAT, ITEM_LIST_INITIAL, MSG_LIST_HIGHWAT, MSG_LIST_INITIAL,
    SUFFIX_LIST_HIGHWAT, Transmit, UDP_HEADER_SIZE, UDP_MAX_PAYLOAD_SIZE, UDP_READ_BUFFER_SIZE,
};
use crate::proto::{binary, text};
use crate::stats::ThreadStats;
use crate::store::StoreVerb;
use hearth::logging;
use iovec::IoVec;
use mio::net::{TcpStream, UdpSocket};
use mio_uds::UnixStream;
use std::cmp::min;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Connection state machine states. Listener sockets live on the
/// dispatcher and are not represented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Reset point before the next request; shrinks oversized buffers.
    NewCmd,
    /// Arms read interest and yields to the reactor.
    Waiting,
    /// Reads from the socket into the read buffer.
    Read,
    /// Tries to parse one complete request.
    ParseCmd,
    /// Reads exactly the declared payload bytes into a staged item.
    Nread,
    /// Discards exactly `sbytes` payload bytes after a failed store.
    Swallow,
    /// Writes a single prepared reply buffer.
    Write,
    /// Writes the scatter/gather reply list.
    Mwrite,
    /// Cleanup and release.
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// First byte decides: binary magic or text.
    Negotiating,
    Text,
    Binary,
    TextUdp,
}

impl Protocol {
    #[inline]
    pub fn is_udp(self) -> bool {
        self == Protocol::TextUdp
    }
}

/// What the worker should do with the connection after a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Park until the armed readiness fires.
    Keep,
    /// Fairness yield: buffered requests remain, drive again soon.
    Yield,
    /// Tear the connection down.
    Close,
}

enum ReadOutcome {
    Data,
    NoData,
    /// An error reply was staged during the read; state already set.
    Reply,
    Error,
}

pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp(UdpSocket),
}

impl io::Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
            Transport::Udp(_) => panic!("stream read on a datagram transport"),
        }
    }
}

/// One scatter/gather entry: a raw window into a pinned item chunk, a
/// connection-owned stable buffer, or static reply text.
#[derive(Clone, Copy)]
pub(crate) struct RawIov {
    ptr: *const u8,
    len: usize,
}

/// Groups consecutive iovecs into one transmit unit; for UDP, one
/// datagram.
#[derive(Clone, Copy)]
pub(crate) struct MsgHdr {
    iov_start: usize,
    iov_count: usize,
    /// Payload bytes plus the UDP frame header when applicable; this is
    /// what the MTU cap is measured against.
    bytes: usize,
}

/// A store in flight: the staged item plus the verb to apply once the
/// value body has been read off the wire.
pub(crate) struct PendingStore {
    pub item: StagedItem,
    pub verb: StoreVerb,
    /// Value bytes received so far.
    pub filled: usize,
    /// Value bytes to read off the wire (excludes the CRLF the binary
    /// protocol does not send).
    pub total: usize,
}

pub struct Conn {
    transport: Option<Transport>,
    pub(crate) state: State,
    pub(crate) protocol: Protocol,
    pub(crate) interest: mio::Ready,

    pub(crate) rbuf: Buffer,
    pub(crate) wbuf: Box<[u8; DATA_BUFFER_SIZE]>,
    pub(crate) wbytes: usize,
    wowned: Option<Box<[u8]>>,

    iovs: Vec<RawIov>,
    msgs: Vec<MsgHdr>,
    msg_cur: usize,
    partial: usize,

    /// Items pinned by the reply being transmitted.
    pub(crate) ilist: Vec<crate::item::ItemId>,
    /// Scratch buffers backing per-hit CAS decorations.
    pub(crate) suffixes: Vec<SuffixBuf>,

    pub(crate) staged: Option<PendingStore>,
    pub(crate) sbytes: usize,
    pub(crate) write_and_go: State,

    pub(crate) cmd: u8,
    pub(crate) bin_header: binary::RequestHeader,
    pub(crate) opaque: u32,
    pub(crate) cas: u64,
    pub(crate) noreply: bool,

    request_id: u16,
    request_addr: Option<SocketAddr>,
    udp_scratch: Vec<u8>,

    pub(crate) shared: Arc<Shared>,
    /// The owning worker's statistics; a lookup handle, not ownership.
    pub(crate) stats: Arc<Mutex<ThreadStats>>,
    log: logging::Logger,
}

// SAFETY: a connection never leaves its owning worker thread after being
// installed; the raw iovec pointers it carries reference static data,
// connection-owned heap buffers, or chunks pinned through `ilist`.
unsafe impl Send for Conn {}

impl Conn {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        shared: Arc<Shared>,
        stats: Arc<Mutex<ThreadStats>>,
        log: L,
    ) -> Conn {
        let conn_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Conn {
            transport: None,
            state: State::Closing,
            protocol: Protocol::Negotiating,
            interest: mio::Ready::readable(),
            rbuf: Buffer::new(DATA_BUFFER_SIZE),
            wbuf: Box::new([0u8; DATA_BUFFER_SIZE]),
            wbytes: 0,
            wowned: None,
            iovs: Vec::with_capacity(IOV_LIST_INITIAL),
            msgs: Vec::with_capacity(MSG_LIST_INITIAL),
            msg_cur: 0,
            partial: 0,
            ilist: Vec::with_capacity(ITEM_LIST_INITIAL),
            suffixes: Vec::new(),
            staged: None,
            sbytes: 0,
            write_and_go: State::NewCmd,
            cmd: 0,
            bin_header: binary::RequestHeader::default(),
            opaque: 0,
            cas: 0,
            noreply: false,
            request_id: 0,
            request_addr: None,
            udp_scratch: Vec::new(),
            shared,
            stats,
            log: conn_log,
        }
    }

    /// Installs a fresh transport into a pooled connection slot.
    pub fn open(&mut self, transport: Transport, state: State, protocol: Protocol) {
        if self.transport.is_some() {
            panic!("Attempted to open an already open connection");
        }
        self.transport = Some(transport);
        self.state = state;
        self.protocol = protocol;
        self.write_and_go = State::NewCmd;
        self.interest = mio::Ready::readable();
        self.rbuf.clear();
        self.noreply = false;
        self.cmd = 0;

        logging::debug!(self.log, "connection opened"; "context" => "open", "protocol" => ?protocol);
    }

    /// Drops the socket and snaps oversized buffers back to baseline so
    /// the pooled slot stays cheap.
    pub fn close(&mut self) {
        self.transport.take();
        self.state = State::Closing;
        self.rbuf.shrink();
        logging::debug!(self.log, "connection closed"; "context" => "close");
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn register(&self, poll: &mio::Poll, token: mio::Token) -> io::Result<()> {
        let opt = mio::PollOpt::level();
        match self.transport.as_ref().expect("Can't register a closed connection") {
            Transport::Tcp(s) => poll.register(s, token, self.interest, opt),
            Transport::Unix(s) => poll.register(s, token, self.interest, opt),
            Transport::Udp(s) => poll.register(s, token, self.interest, opt),
        }
    }

    pub fn reregister(&self, poll: &mio::Poll, token: mio::Token) -> io::Result<()> {
        let opt = mio::PollOpt::level();
        match self.transport.as_ref().expect("Can't reregister a closed connection") {
            Transport::Tcp(s) => poll.reregister(s, token, self.interest, opt),
            Transport::Unix(s) => poll.reregister(s, token, self.interest, opt),
            Transport::Udp(s) => poll.reregister(s, token, self.interest, opt),
        }
    }

    pub fn deregister(&self, poll: &mio::Poll) -> io::Result<()> {
        match self.transport.as_ref().expect("Can't deregister a closed connection") {
            Transport::Tcp(s) => poll.deregister(s),
            Transport::Unix(s) => poll.deregister(s),
            Transport::Udp(s) => poll.deregister(s),
        }
    }

    /// Releases everything the connection holds on behalf of in-flight
    /// work: pinned items, suffix scratch, a staged item, owned reply
    /// buffers.
    pub fn cleanup(&mut self) {
        if let Some(pending) = self.staged.take() {
            self.shared.cache.discard(pending.item);
        }
        self.shared.cache.release_many(&mut self.ilist);
        for buf in self.suffixes.drain(..) {
            self.shared.suffixes.put(buf);
        }
        self.wowned = None;
        self.iovs.clear();
        self.msgs.clear();
        self.msg_cur = 0;
        self.partial = 0;
        self.rbuf.clear();
        self.sbytes = 0;
    }

    // ---- the state machine --------------------------------------------

    /// Drives the machine until it blocks, closes, or exhausts its
    /// fairness budget.
    pub fn drive(&mut self) -> Next {
        let mut nreqs = self.shared.settings.reqs_per_event;

        loop {
            match self.state {
                State::NewCmd => {
                    if nreqs == 0 {
                        // A pipelined client does not get to starve its
                        // peers; hand the reactor back control.
                        return Next::Yield;
                    }
                    nreqs -= 1;
                    self.reset_cmd();
                    if !self.rbuf.is_empty() {
                        self.state = State::ParseCmd;
                    } else {
                        self.state = State::Waiting;
                    }
                }

                State::Waiting => {
                    self.interest = mio::Ready::readable();
                    self.state = State::Read;
                    return Next::Keep;
                }

                State::Read => {
                    let outcome = if self.protocol.is_udp() {
                        self.try_read_udp()
                    } else {
                        self.try_read_tcp()
                    };
                    match outcome {
                        ReadOutcome::Data => self.state = State::ParseCmd,
                        ReadOutcome::NoData => self.state = State::Waiting,
                        ReadOutcome::Reply => {}
                        ReadOutcome::Error => self.state = State::Closing,
                    }
                }

                State::ParseCmd => {
                    if !self.try_parse() {
                        self.state = State::Waiting;
                    }
                }

                State::Nread => {
                    if let Some(next) = self.nread_step() {
                        return next;
                    }
                }

                State::Swallow => {
                    if let Some(next) = self.swallow_step() {
                        return next;
                    }
                }

                State::Write | State::Mwrite => {
                    match self.transmit() {
                        Transmit::Complete => {
                            self.finish_reply();
                            self.state = self.write_and_go;
                        }
                        Transmit::Incomplete | Transmit::HardError => {}
                        Transmit::SoftError => {
                            self.interest = mio::Ready::writable();
                            return Next::Keep;
                        }
                    }
                }

                State::Closing => {
                    if self.protocol.is_udp() {
                        // No connection to close; flush held state and
                        // wait for the next datagram.
                        self.cleanup();
                        self.state = State::Read;
                        self.interest = mio::Ready::readable();
                        return Next::Keep;
                    }
                    return Next::Close;
                }
            }
        }
    }

    fn reset_cmd(&mut self) {
        self.cmd = 0;
        self.noreply = false;
        self.cas = 0;
        if let Some(pending) = self.staged.take() {
            self.shared.cache.discard(pending.item);
        }
        self.conn_shrink();
    }

    /// Shrinks per-connection scratch past the high-watermarks. Only runs
    /// between requests; UDP reactors keep their datagram-sized buffers.
    fn conn_shrink(&mut self) {
        if self.protocol.is_udp() {
            return;
        }
        self.rbuf.shrink();
        if self.ilist.capacity() > ITEM_LIST_HIGHWAT {
            self.ilist.shrink_to(ITEM_LIST_INITIAL);
        }
        if self.iovs.capacity() > IOV_LIST_HIGHWAT {
            self.iovs.shrink_to(IOV_LIST_INITIAL);
        }
        if self.msgs.capacity() > MSG_LIST_HIGHWAT {
            self.msgs.shrink_to(MSG_LIST_INITIAL);
        }
        if self.suffixes.capacity() > SUFFIX_LIST_HIGHWAT {
            self.suffixes.shrink_to(0);
        }
    }

    // ---- reading -------------------------------------------------------

    /// Folds an io result into the wait/fatal taxonomy the state machine
    /// branches on.
    #[inline]
    fn fold_result<T>(result: io::Result<T>) -> NetResult<T> {
        result.map_err(Into::into)
    }

    fn try_read_tcp(&mut self) -> ReadOutcome {
        let transport = self.transport.as_mut().expect("read on a closed connection");
        match Self::fold_result(self.rbuf.fill(transport)) {
            Ok(0) => ReadOutcome::NoData,
            Ok(n) => {
                self.bump_bytes_read(n);
                ReadOutcome::Data
            }
            Err(NetError::Wait) => ReadOutcome::NoData,
            Err(NetError::Fatal(Cause::Closed)) => ReadOutcome::Error,
            Err(NetError::Fatal(cause)) => {
                logging::debug!(self.log, "read failed"; "context" => "read", "cause" => ?cause);
                ReadOutcome::Error
            }
        }
    }

    fn try_read_udp(&mut self) -> ReadOutcome {
        let mut dgram = [0u8; UDP_READ_BUFFER_SIZE];
        let (n, addr) = {
            let sock = match self.transport.as_ref().expect("read on a closed connection") {
                Transport::Udp(s) => s,
                _ => panic!("datagram read on a stream transport"),
            };
            match sock.recv_from(&mut dgram) {
                Ok(res) => res,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::NoData,
                Err(e) => {
                    logging::debug!(self.log, "recv_from failed"; "context" => "read", "error" => %e);
                    return ReadOutcome::NoData;
                }
            }
        };

        if n <= UDP_HEADER_SIZE {
            return ReadOutcome::NoData;
        }
        self.bump_bytes_read(n);

        self.request_addr = Some(addr);
        self.request_id = u16::from_be_bytes([dgram[0], dgram[1]]);

        // A request must fit a single datagram.
        if dgram[4] != 0 || dgram[5] != 1 {
            self.out_error("SERVER_ERROR multi-packet request not supported");
            return ReadOutcome::Reply;
        }

        self.rbuf.clear();
        self.rbuf.push(&dgram[UDP_HEADER_SIZE..n]);
        ReadOutcome::Data
    }

    // ---- parsing -------------------------------------------------------

    /// Attempts to parse one complete request out of the read buffer.
    /// Returns false when more bytes are needed.
    pub(crate) fn try_parse(&mut self) -> bool {
        if self.rbuf.is_empty() {
            return false;
        }

        if self.protocol == Protocol::Negotiating {
            self.protocol = if self.rbuf.data()[0] == binary::MAGIC_REQ {
                Protocol::Binary
            } else {
                Protocol::Text
            };
            logging::debug!(self.log, "protocol negotiated";
                            "context" => "parse",
                            "protocol" => ?self.protocol);
        }

        if self.protocol == Protocol::Binary {
            binary::try_parse(self)
        } else {
            self.try_parse_text()
        }
    }

    fn try_parse_text(&mut self) -> bool {
        let data = self.rbuf.data();
        let nl = match data.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return false,
        };

        let mut end = nl;
        if end > 0 && data[end - 1] == b'\r' {
            end -= 1;
        }
        let line = data[..end].to_vec();
        self.rbuf.consume(nl + 1);

        self.begin_reply();
        text::process_command(self, &line);
        true
    }

    // ---- body reads ----------------------------------------------------

    fn nread_step(&mut self) -> Option<Next> {
        let remaining = match self.staged.as_ref() {
            Some(p) => p.total - p.filled,
            None => panic!("nread without a staged item"),
        };
        if remaining == 0 {
            self.complete_nread();
            return None;
        }

        // Drain pipelined bytes already in the read buffer first.
        if !self.rbuf.is_empty() {
            let pending = self.staged.as_mut().expect("nread without a staged item");
            let n = min(self.rbuf.len(), remaining);
            let filled = pending.filled;
            pending.item.value_mut()[filled..filled + n]
                .copy_from_slice(&self.rbuf.data()[..n]);
            pending.filled += n;
            self.rbuf.consume(n);
            return None;
        }

        let res = {
            let pending = self.staged.as_mut().expect("nread without a staged item");
            let filled = pending.filled;
            let total = pending.total;
            let dst = &mut pending.item.value_mut()[filled..total];
            self.transport
                .as_mut()
                .expect("read on a closed connection")
                .read(dst)
        };
        match Self::fold_result(res) {
            Ok(0) => {
                self.state = State::Closing;
                None
            }
            Ok(n) => {
                self.bump_bytes_read(n);
                self.staged.as_mut().expect("nread without a staged item").filled += n;
                None
            }
            Err(NetError::Wait) => {
                self.interest = mio::Ready::readable();
                Some(Next::Keep)
            }
            Err(NetError::Fatal(cause)) => {
                logging::debug!(self.log, "body read failed"; "context" => "nread", "cause" => ?cause);
                self.state = State::Closing;
                None
            }
        }
    }

    fn complete_nread(&mut self) {
        match self.protocol {
            Protocol::Binary => binary::complete_nread(self),
            _ => text::complete_nread(self),
        }
    }

    fn swallow_step(&mut self) -> Option<Next> {
        if self.sbytes == 0 {
            self.state = State::NewCmd;
            return None;
        }

        if !self.rbuf.is_empty() {
            let n = min(self.rbuf.len(), self.sbytes);
            self.rbuf.consume(n);
            self.sbytes -= n;
            return None;
        }

        let mut scratch = [0u8; DATA_BUFFER_SIZE];
        let want = min(self.sbytes, scratch.len());
        let res = self
            .transport
            .as_mut()
            .expect("read on a closed connection")
            .read(&mut scratch[..want]);
        match Self::fold_result(res) {
            Ok(0) => {
                self.state = State::Closing;
                None
            }
            Ok(n) => {
                self.bump_bytes_read(n);
                self.sbytes -= n;
                None
            }
            Err(NetError::Wait) => {
                self.interest = mio::Ready::readable();
                Some(Next::Keep)
            }
            Err(NetError::Fatal(cause)) => {
                logging::debug!(self.log, "swallow read failed"; "context" => "swallow", "cause" => ?cause);
                self.state = State::Closing;
                None
            }
        }
    }

    // ---- reply assembly ------------------------------------------------

    /// Starts a fresh reply: clears the scatter list and opens the first
    /// message header.
    pub(crate) fn begin_reply(&mut self) {
        self.iovs.clear();
        self.msgs.clear();
        self.msg_cur = 0;
        self.partial = 0;
        self.add_msghdr();
    }

    fn add_msghdr(&mut self) {
        let bytes = if self.protocol.is_udp() {
            UDP_HEADER_SIZE
        } else {
            0
        };
        self.msgs.push(MsgHdr {
            iov_start: self.iovs.len(),
            iov_count: 0,
            bytes,
        });
    }

    /// Appends bytes to the outgoing scatter list, honoring the IOV_MAX
    /// cap per message header and the 1400-byte cap on UDP payloads and on
    /// the first header of a TCP reply. Oversize fragments are split.
    ///
    /// The pointed-at bytes must stay valid until the reply finishes:
    /// static text, connection-owned buffers, or chunks pinned via
    /// `ilist`.
    pub(crate) fn add_iov_raw(&mut self, mut ptr: *const u8, mut len: usize) {
        debug_assert!(!self.msgs.is_empty(), "reply assembly without a message header");

        while len > 0 {
            let limit_to_mtu = self.protocol.is_udp() || self.msgs.len() == 1;

            let full = {
                let m = self.msgs.last().expect("no message header");
                m.iov_count == IOV_MAX || (limit_to_mtu && m.bytes >= UDP_MAX_PAYLOAD_SIZE)
            };
            if full {
                self.add_msghdr();
            }

            let take = {
                let m = self.msgs.last().expect("no message header");
                if limit_to_mtu {
                    min(len, UDP_MAX_PAYLOAD_SIZE - m.bytes)
                } else {
                    len
                }
            };

            self.iovs.push(RawIov { ptr, len: take });
            let m = self.msgs.last_mut().expect("no message header");
            m.iov_count += 1;
            m.bytes += take;

            ptr = unsafe { ptr.add(take) };
            len -= take;
        }
    }

    /// Appends a slice with a stable address (static text, pinned chunk
    /// windows, suffix scratch).
    #[inline]
    pub(crate) fn add_iov(&mut self, data: &[u8]) {
        self.add_iov_raw(data.as_ptr(), data.len());
    }

    /// Writes a one-line reply into the line buffer, replacing whatever
    /// partial assembly the handler may have staged. Suppressed (and the
    /// flag cleared) under noreply.
    pub(crate) fn out_string(&mut self, msg: &str) {
        if self.noreply {
            self.noreply = false;
            self.state = State::NewCmd;
            return;
        }

        let bytes = msg.as_bytes();
        let bytes = if bytes.len() + 2 > self.wbuf.len() {
            b"SERVER_ERROR output line too long".as_ref()
        } else {
            bytes
        };
        self.wbuf[..bytes.len()].copy_from_slice(bytes);
        self.wbuf[bytes.len()..bytes.len() + 2].copy_from_slice(b"\r\n");
        self.wbytes = bytes.len() + 2;
        self.wowned = None;

        self.begin_reply();
        let (ptr, len) = self.write_source();
        self.add_iov_raw(ptr, len);
        self.state = State::Write;
        self.write_and_go = State::NewCmd;
    }

    /// Error replies are sent even under noreply.
    pub(crate) fn out_error(&mut self, msg: &str) {
        self.noreply = false;
        self.out_string(msg);
    }

    /// Hands a generated buffer (stats dumps) to the write path; the
    /// connection owns it until the reply completes.
    pub(crate) fn write_owned(&mut self, buf: Vec<u8>) {
        self.wbytes = buf.len();
        self.wowned = Some(buf.into_boxed_slice());

        self.begin_reply();
        let (ptr, len) = self.write_source();
        self.add_iov_raw(ptr, len);
        self.state = State::Write;
        self.write_and_go = State::NewCmd;
    }

    fn write_source(&self) -> (*const u8, usize) {
        match &self.wowned {
            Some(owned) => (owned.as_ptr(), self.wbytes),
            None => (self.wbuf.as_ptr(), self.wbytes),
        }
    }

    /// Releases reply-scoped resources after the last byte is out.
    fn finish_reply(&mut self) {
        self.shared.cache.release_many(&mut self.ilist);
        for buf in self.suffixes.drain(..) {
            self.shared.suffixes.put(buf);
        }
        self.wowned = None;
    }

    // ---- transmit ------------------------------------------------------

    #[inline]
    fn msg_payload_len(&self, idx: usize) -> usize {
        let m = &self.msgs[idx];
        if self.protocol.is_udp() {
            m.bytes - UDP_HEADER_SIZE
        } else {
            m.bytes
        }
    }

    /// Sends the next chunk of the scatter list. Partial progress adjusts
    /// the consumed prefix and stays in `mwrite`.
    fn transmit(&mut self) -> Transmit {
        while self.msg_cur < self.msgs.len() && self.partial >= self.msg_payload_len(self.msg_cur)
        {
            self.msg_cur += 1;
            self.partial = 0;
        }
        if self.msg_cur >= self.msgs.len() {
            return Transmit::Complete;
        }

        if self.protocol.is_udp() {
            self.transmit_udp()
        } else {
            self.transmit_stream()
        }
    }

    fn transmit_stream(&mut self) -> Transmit {
        let m = self.msgs[self.msg_cur];
        let payload = self.msg_payload_len(self.msg_cur);

        let mut slices: Vec<&[u8]> = Vec::with_capacity(m.iov_count);
        let mut skip = self.partial;
        for raw in &self.iovs[m.iov_start..m.iov_start + m.iov_count] {
            if raw.len == 0 {
                continue;
            }
            if skip >= raw.len {
                skip -= raw.len;
                continue;
            }
            // SAFETY: the iovec sources are pinned for the lifetime of the
            // reply (see add_iov_raw).
            let slice = unsafe { std::slice::from_raw_parts(raw.ptr.add(skip), raw.len - skip) };
            skip = 0;
            slices.push(slice);
        }
        if slices.is_empty() {
            self.msg_cur += 1;
            self.partial = 0;
            return Transmit::Incomplete;
        }

        let res = match self.transport.as_mut().expect("write on a closed connection") {
            Transport::Tcp(s) => {
                let vecs: Vec<&IoVec> = slices.iter().map(|s| (*s).into()).collect();
                s.write_bufs(&vecs)
            }
            // No scattered write on the unix stream; the partial-progress
            // accounting picks up where each plain write ends.
            Transport::Unix(s) => s.write(slices[0]),
            Transport::Udp(_) => unreachable!("stream transmit on a datagram transport"),
        };

        match Self::fold_result(res) {
            Ok(n) => {
                self.bump_bytes_written(n);
                self.partial += n;
                if self.partial >= payload {
                    self.msg_cur += 1;
                    self.partial = 0;
                }
                Transmit::Incomplete
            }
            Err(NetError::Wait) => {
                self.interest = mio::Ready::writable();
                Transmit::SoftError
            }
            Err(NetError::Fatal(cause)) => {
                logging::debug!(self.log, "write failed"; "context" => "transmit", "cause" => ?cause);
                self.state = State::Closing;
                Transmit::HardError
            }
        }
    }

    /// Assembles and sends one reply datagram: the 8-byte frame header
    /// (request id, sequence, total, reserved) followed by this message
    /// header's iovecs.
    fn transmit_udp(&mut self) -> Transmit {
        let m = self.msgs[self.msg_cur];
        let total = self.msgs.len() as u16;
        let seq = self.msg_cur as u16;

        self.udp_scratch.clear();
        self.udp_scratch.extend_from_slice(&self.request_id.to_be_bytes());
        self.udp_scratch.extend_from_slice(&seq.to_be_bytes());
        self.udp_scratch.extend_from_slice(&total.to_be_bytes());
        self.udp_scratch.extend_from_slice(&[0, 0]);
        for raw in &self.iovs[m.iov_start..m.iov_start + m.iov_count] {
            if raw.len == 0 {
                continue;
            }
            // SAFETY: as in transmit_stream.
            let slice = unsafe { std::slice::from_raw_parts(raw.ptr, raw.len) };
            self.udp_scratch.extend_from_slice(slice);
        }

        let addr = self.request_addr.expect("udp reply without a source address");
        let res = {
            let sock = match self.transport.as_ref().expect("write on a closed connection") {
                Transport::Udp(s) => s,
                _ => unreachable!("datagram transmit on a stream transport"),
            };
            sock.send_to(&self.udp_scratch, &addr)
        };

        match Self::fold_result(res) {
            Ok(n) => {
                self.bump_bytes_written(n);
                self.msg_cur += 1;
                self.partial = 0;
                Transmit::Incomplete
            }
            Err(NetError::Wait) => {
                self.interest = mio::Ready::writable();
                Transmit::SoftError
            }
            Err(NetError::Fatal(cause)) => {
                logging::debug!(self.log, "send_to failed"; "context" => "transmit", "cause" => ?cause);
                self.state = State::Closing;
                Transmit::HardError
            }
        }
    }

    // ---- stats ---------------------------------------------------------

    fn bump_bytes_read(&self, n: usize) {
        self.stats
            .lock()
            .expect("worker stats lock poisoned")
            .bytes_read += n as u64;
    }

    fn bump_bytes_written(&self, n: usize) {
        self.stats
            .lock()
            .expect("worker stats lock poisoned")
            .bytes_written += n as u64;
    }

    // ---- test support --------------------------------------------------

    /// Feeds request bytes as though they arrived from the socket.
    #[cfg(test)]
    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.rbuf.push(data);
    }

    /// Copies out the assembled reply payload (all message headers) and
    /// completes the reply as a successful transmit would.
    #[cfg(test)]
    pub(crate) fn take_reply(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for raw in &self.iovs {
            if raw.len > 0 {
                out.extend_from_slice(unsafe { std::slice::from_raw_parts(raw.ptr, raw.len) });
            }
        }
        self.finish_reply();
        self.iovs.clear();
        self.msgs.clear();
        self.msg_cur = 0;
        self.partial = 0;
        self.state = self.write_and_go;
        out
    }

    #[cfg(test)]
    pub(crate) fn msg_summary(&self) -> Vec<usize> {
        self.msgs.iter().map(|m| m.bytes).collect()
    }

    /// Socket-free drive loop for protocol tests: processes whatever was
    /// `feed`-ed and returns the concatenated reply bytes. Stops when the
    /// machine needs the network or closes.
    #[cfg(test)]
    pub(crate) fn pump(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match self.state {
                State::NewCmd => {
                    self.reset_cmd();
                    if self.rbuf.is_empty() {
                        break;
                    }
                    self.state = State::ParseCmd;
                }
                State::ParseCmd => {
                    if !self.try_parse() {
                        break;
                    }
                }
                State::Nread => {
                    let starved = self
                        .staged
                        .as_ref()
                        .map(|p| p.filled < p.total)
                        .unwrap_or(false)
                        && self.rbuf.is_empty();
                    if starved || self.nread_step().is_some() {
                        break;
                    }
                }
                State::Swallow => {
                    if (self.sbytes > 0 && self.rbuf.is_empty()) || self.swallow_step().is_some()
                    {
                        break;
                    }
                }
                State::Write | State::Mwrite => {
                    out.extend(self.take_reply());
                }
                State::Waiting | State::Read | State::Closing => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::settings::Settings;
    use crate::store::{Cache, CacheConfig};

    fn shared() -> Arc<Shared> {
        let clock = Arc::new(Clock::new());
        clock.set(10);
        let cache = Arc::new(Cache::new(
            CacheConfig {
                page_size: 65536,
                hashpower: 8,
                ..CacheConfig::default()
            },
            clock,
            None,
        ));
        Arc::new(Shared::new(cache, Settings::default()))
    }

    fn conn(protocol: Protocol) -> Conn {
        let shared = shared();
        let stats = shared.hub.workers[0].clone();
        let mut c = Conn::new(shared, stats, None);
        c.protocol = protocol;
        c.state = State::NewCmd;
        c
    }

    #[test]
    fn test_first_tcp_header_is_mtu_capped() {
        let mut c = conn(Protocol::Text);
        c.begin_reply();

        let big = vec![b'x'; 4000];
        c.add_iov(&big);

        let msgs = c.msg_summary();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], UDP_MAX_PAYLOAD_SIZE);
        assert_eq!(msgs[1], 4000 - UDP_MAX_PAYLOAD_SIZE);
        assert_eq!(c.take_reply(), big);
    }

    #[test]
    fn test_udp_reply_fragments_to_payload_cap() {
        let mut c = conn(Protocol::TextUdp);
        c.begin_reply();

        // A ~4 KiB reply splits across three datagrams, each counting its
        // 8-byte frame header against the 1400-byte cap.
        let big = vec![b'y'; 4000];
        c.add_iov(&big);

        let msgs = c.msg_summary();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0], UDP_MAX_PAYLOAD_SIZE);
        assert_eq!(msgs[1], UDP_MAX_PAYLOAD_SIZE);
        assert_eq!(
            msgs[2],
            UDP_HEADER_SIZE + (4000 - 2 * (UDP_MAX_PAYLOAD_SIZE - UDP_HEADER_SIZE))
        );
        assert_eq!(c.take_reply(), big);
    }

    #[test]
    fn test_iov_max_starts_a_new_header() {
        let mut c = conn(Protocol::Text);
        c.begin_reply();

        // Push the first header past the MTU cap so subsequent adds land
        // in the unlimited second header.
        let filler = vec![b'f'; UDP_MAX_PAYLOAD_SIZE];
        c.add_iov(&filler);
        for _ in 0..IOV_MAX + 5 {
            c.add_iov(b"a");
        }

        let msgs = c.msg_summary();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1], IOV_MAX);
        assert_eq!(msgs[2], 5);
    }

    #[test]
    fn test_out_string_noreply_suppression() {
        let mut c = conn(Protocol::Text);
        c.begin_reply();
        c.noreply = true;
        c.out_string("STORED");
        assert_eq!(c.state, State::NewCmd);
        assert!(!c.noreply);

        // Errors always reach the client.
        c.noreply = true;
        c.out_error("CLIENT_ERROR bad data chunk");
        assert_eq!(c.state, State::Write);
        assert_eq!(c.take_reply(), b"CLIENT_ERROR bad data chunk\r\n");
    }

    #[test]
    fn test_oversize_reply_line_is_replaced() {
        let mut c = conn(Protocol::Text);
        let huge = "x".repeat(DATA_BUFFER_SIZE);
        c.out_string(&huge);
        assert_eq!(c.take_reply(), b"SERVER_ERROR output line too long\r\n");
    }
}
