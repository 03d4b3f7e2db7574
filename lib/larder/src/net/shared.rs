use std::io;
use std::sync::Mutex;

/// Every UDP datagram starts with request id, sequence, total count and a
/// reserved word, two bytes each, big-endian.
pub const UDP_HEADER_SIZE: usize = 8;

/// Cap per message header: smaller than the MTU to leave room for common
/// tunneling overhead.
pub const UDP_MAX_PAYLOAD_SIZE: usize = 1400;

/// Read buffer for UDP reactors; a datagram is a whole request.
pub const UDP_READ_BUFFER_SIZE: usize = 65536;

/// Most iovecs one scattered send will take.
pub const IOV_MAX: usize = 1024;

/// Baseline size of the per-connection read and reply line buffers.
pub const DATA_BUFFER_SIZE: usize = 2048;

/// Read buffers above this shrink back to baseline between requests.
pub const READ_BUFFER_HIGHWAT: usize = 8192;

pub const ITEM_LIST_INITIAL: usize = 200;
pub const ITEM_LIST_HIGHWAT: usize = 400;
pub const IOV_LIST_INITIAL: usize = 400;
pub const IOV_LIST_HIGHWAT: usize = 600;
pub const MSG_LIST_INITIAL: usize = 10;
pub const MSG_LIST_HIGHWAT: usize = 100;
pub const SUFFIX_LIST_HIGHWAT: usize = 50;

/// Scratch size for a formatted ` <cas>\r\n` decoration.
pub const SUFFIX_SIZE: usize = 24;

pub const MAX_VERBOSITY_LEVEL: u8 = 2;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level network error: `Wait` re-arms readiness and yields, `Fatal`
/// tears the connection down.
#[derive(Debug, PartialEq, Eq)]
pub enum NetError {
    Wait,
    Fatal(Cause),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Cause {
    /// Peer closed the stream.
    Closed,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            io::ErrorKind::UnexpectedEof => NetError::Fatal(Cause::Closed),
            kind => NetError::Fatal(Cause::Io(kind)),
        }
    }
}

/// Outcome of one scattered-send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    /// All message headers written.
    Complete,
    /// Progress was made, more remains.
    Incomplete,
    /// Would block; write interest has been requested.
    SoftError,
    /// Socket error; the connection state has been redirected.
    HardError,
}

pub type SuffixBuf = Box<[u8; SUFFIX_SIZE]>;

/// Pooled scratch buffers for the per-hit ` <cas>\r\n` decorations of
/// `gets` replies. A global freelist, shared by all workers.
pub struct SuffixPool {
    free: Mutex<Vec<SuffixBuf>>,
}

/// Buffers retained by the pool; beyond this they are dropped instead.
const SUFFIX_POOL_MAX: usize = 500;

impl SuffixPool {
    pub fn new() -> SuffixPool {
        SuffixPool {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> SuffixBuf {
        let mut free = self.free.lock().expect("suffix pool lock poisoned");
        free.pop().unwrap_or_else(|| Box::new([0u8; SUFFIX_SIZE]))
    }

    pub fn put(&self, buf: SuffixBuf) {
        let mut free = self.free.lock().expect("suffix pool lock poisoned");
        if free.len() < SUFFIX_POOL_MAX {
            free.push(buf);
        }
    }
}
