//! The binary protocol: 24-byte big-endian framed requests with fixed
//! extras shapes per opcode, quiet variants that suppress success replies,
//! and status-coded responses.

use crate::item::KEY_MAX_LENGTH;
use crate::net::conn::{Conn, PendingStore, State};
use crate::stats;
use crate::store::{AllocError, DeleteOutcome, DeltaOutcome, StoreOutcome, StoreVerb};
use byteorder::{BigEndian, ByteOrder};

pub const MAGIC_REQ: u8 = 0x80;
pub const MAGIC_RES: u8 = 0x81;

pub const HEADER_SIZE: usize = 24;

/// Largest extras shape (INCR/DECR: delta + initial + expiration).
const EXTRAS_MAX: usize = 20;

pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const INCREMENT: u8 = 0x05;
    pub const DECREMENT: u8 = 0x06;
    pub const QUIT: u8 = 0x07;
    pub const FLUSH: u8 = 0x08;
    pub const GETQ: u8 = 0x09;
    pub const NOOP: u8 = 0x0a;
    pub const VERSION: u8 = 0x0b;
    pub const GETK: u8 = 0x0c;
    pub const GETKQ: u8 = 0x0d;
    pub const APPEND: u8 = 0x0e;
    pub const PREPEND: u8 = 0x0f;
    pub const STAT: u8 = 0x10;
    pub const SETQ: u8 = 0x11;
    pub const ADDQ: u8 = 0x12;
    pub const REPLACEQ: u8 = 0x13;
    pub const DELETEQ: u8 = 0x14;
    pub const INCREMENTQ: u8 = 0x15;
    pub const DECREMENTQ: u8 = 0x16;
    pub const QUITQ: u8 = 0x17;
    pub const FLUSHQ: u8 = 0x18;
    pub const APPENDQ: u8 = 0x19;
    pub const PREPENDQ: u8 = 0x1a;
}

pub mod status {
    pub const OK: u16 = 0x0000;
    pub const KEY_ENOENT: u16 = 0x0001;
    pub const KEY_EEXISTS: u16 = 0x0002;
    pub const E2BIG: u16 = 0x0003;
    pub const EINVAL: u16 = 0x0004;
    pub const NOT_STORED: u16 = 0x0005;
    pub const DELTA_BADVAL: u16 = 0x0006;
    pub const UNKNOWN_COMMAND: u16 = 0x0081;
    pub const ENOMEM: u16 = 0x0082;
}

/// Parsed request header; multibyte fields already in host order.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestHeader {
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// `buf` must hold at least the 24 header bytes; the magic is the
    /// caller's business.
    pub fn parse(buf: &[u8]) -> RequestHeader {
        RequestHeader {
            opcode: buf[1],
            keylen: BigEndian::read_u16(&buf[2..4]),
            extlen: buf[4],
            bodylen: BigEndian::read_u32(&buf[8..12]),
            opaque: BigEndian::read_u32(&buf[12..16]),
            cas: BigEndian::read_u64(&buf[16..24]),
        }
    }
}

/// Encodes a response header in place.
pub fn write_response_header(
    buf: &mut [u8],
    opcode: u8,
    stat: u16,
    extlen: u8,
    keylen: u16,
    bodylen: u32,
    opaque: u32,
    cas: u64,
) {
    buf[0] = MAGIC_RES;
    buf[1] = opcode;
    BigEndian::write_u16(&mut buf[2..4], keylen);
    buf[4] = extlen;
    buf[5] = 0;
    BigEndian::write_u16(&mut buf[6..8], stat);
    BigEndian::write_u32(&mut buf[8..12], bodylen);
    BigEndian::write_u32(&mut buf[12..16], opaque);
    BigEndian::write_u64(&mut buf[16..24], cas);
}

/// Maps quiet opcodes onto their talkative twins.
fn unquiet(op: u8) -> (u8, bool) {
    match op {
        opcode::SETQ => (opcode::SET, true),
        opcode::ADDQ => (opcode::ADD, true),
        opcode::REPLACEQ => (opcode::REPLACE, true),
        opcode::DELETEQ => (opcode::DELETE, true),
        opcode::INCREMENTQ => (opcode::INCREMENT, true),
        opcode::DECREMENTQ => (opcode::DECREMENT, true),
        opcode::QUITQ => (opcode::QUIT, true),
        opcode::FLUSHQ => (opcode::FLUSH, true),
        opcode::APPENDQ => (opcode::APPEND, true),
        opcode::PREPENDQ => (opcode::PREPEND, true),
        opcode::GETQ => (opcode::GET, true),
        opcode::GETKQ => (opcode::GETK, true),
        op => (op, false),
    }
}

fn error_text(stat: u16) -> &'static str {
    match stat {
        status::ENOMEM => "Out of memory",
        status::UNKNOWN_COMMAND => "Unknown command",
        status::KEY_ENOENT => "Not found",
        status::EINVAL => "Invalid arguments",
        status::KEY_EEXISTS => "Data exists for key.",
        status::E2BIG => "Too large.",
        status::NOT_STORED => "Not stored.",
        status::DELTA_BADVAL => "Non-numeric server-side value for incr or decr",
        _ => "UNHANDLED ERROR",
    }
}

/// Attempts to parse and dispatch one framed request. Returns false when
/// the frame (header plus extras and key) is not complete yet.
pub(crate) fn try_parse(c: &mut Conn) -> bool {
    if c.rbuf.len() < HEADER_SIZE {
        return false;
    }
    let data = c.rbuf.data();

    if data[0] != MAGIC_REQ {
        c.state = State::Closing;
        return true;
    }

    let header = RequestHeader::parse(data);
    let elen = header.extlen as usize;
    let klen = header.keylen as usize;

    // Cheap sanity before waiting for more bytes; a violating frame costs
    // the connection.
    if elen > EXTRAS_MAX
        || klen > KEY_MAX_LENGTH
        || (header.bodylen as usize) < elen + klen
    {
        c.rbuf.consume(HEADER_SIZE);
        c.bin_header = header;
        c.cmd = header.opcode;
        c.opaque = header.opaque;
        c.cas = 0;
        c.noreply = false;
        write_bin_error(c, status::EINVAL, 0);
        c.write_and_go = State::Closing;
        return true;
    }

    if c.rbuf.len() < HEADER_SIZE + elen + klen {
        return false;
    }

    let mut extras = [0u8; EXTRAS_MAX];
    let mut keybuf = [0u8; KEY_MAX_LENGTH];
    {
        let data = c.rbuf.data();
        extras[..elen].copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + elen]);
        keybuf[..klen].copy_from_slice(&data[HEADER_SIZE + elen..HEADER_SIZE + elen + klen]);
    }
    c.rbuf.consume(HEADER_SIZE + elen + klen);

    c.bin_header = header;
    c.opaque = header.opaque;
    c.cas = 0;
    let (cmd, noreply) = unquiet(header.opcode);
    c.cmd = cmd;
    c.noreply = noreply;

    dispatch(c, &extras[..elen], &keybuf[..klen]);
    true
}

fn dispatch(c: &mut Conn, extras: &[u8], key: &[u8]) {
    let elen = extras.len();
    let klen = key.len();
    let bodylen = c.bin_header.bodylen as usize;
    let vlen = bodylen - elen - klen;

    let mut protocol_error = false;
    match c.cmd {
        opcode::VERSION => {
            if elen == 0 && klen == 0 && bodylen == 0 {
                c.cas = 0;
                add_bin_header(c, status::OK, 0, 0, crate::VERSION.len() as u32);
                c.add_iov(crate::VERSION.as_bytes());
                c.state = State::Mwrite;
                c.write_and_go = State::NewCmd;
            } else {
                protocol_error = true;
            }
        }
        opcode::NOOP => {
            if elen == 0 && klen == 0 && bodylen == 0 {
                write_bin_response_empty(c);
            } else {
                protocol_error = true;
            }
        }
        opcode::FLUSH => {
            if klen == 0 && vlen == 0 && (elen == 0 || elen == 4) {
                process_bin_flush(c, extras);
            } else {
                protocol_error = true;
            }
        }
        opcode::SET | opcode::ADD | opcode::REPLACE => {
            if elen == 8 && klen > 0 {
                process_bin_update(c, extras, key, vlen);
            } else {
                protocol_error = true;
            }
        }
        opcode::GET | opcode::GETK => {
            if elen == 0 && klen > 0 && vlen == 0 {
                process_bin_get(c, key);
            } else {
                protocol_error = true;
            }
        }
        opcode::DELETE => {
            if elen == 0 && klen > 0 && vlen == 0 {
                process_bin_delete(c, key);
            } else {
                protocol_error = true;
            }
        }
        opcode::INCREMENT | opcode::DECREMENT => {
            if elen == 20 && klen > 0 && vlen == 0 {
                process_bin_delta(c, extras, key);
            } else {
                protocol_error = true;
            }
        }
        opcode::APPEND | opcode::PREPEND => {
            if elen == 0 && klen > 0 {
                process_bin_concat(c, key, vlen);
            } else {
                protocol_error = true;
            }
        }
        opcode::STAT => {
            if elen == 0 && vlen == 0 {
                process_bin_stat(c, key);
            } else {
                protocol_error = true;
            }
        }
        opcode::QUIT => {
            if elen == 0 && klen == 0 && bodylen == 0 {
                if c.noreply {
                    c.state = State::Closing;
                } else {
                    write_bin_response_empty(c);
                    c.write_and_go = State::Closing;
                }
            } else {
                protocol_error = true;
            }
        }
        _ => {
            // Swallow the remaining body; extras and key are already gone.
            write_bin_error(c, status::UNKNOWN_COMMAND, vlen);
        }
    }

    if protocol_error {
        // Answer EINVAL and drop the connection; resynchronizing with a
        // confused client is not worth the guesswork.
        write_bin_error(c, status::EINVAL, 0);
        c.write_and_go = State::Closing;
    }
}

/// Starts a binary response: header in the line buffer, first iovec over
/// it. The CAS staged in `c.cas` rides along.
fn add_bin_header(c: &mut Conn, stat: u16, extlen: u8, keylen: u16, bodylen: u32) {
    c.begin_reply();
    write_response_header(
        &mut c.wbuf[..HEADER_SIZE],
        c.bin_header.opcode,
        stat,
        extlen,
        keylen,
        bodylen,
        c.opaque,
        c.cas,
    );
    let ptr = c.wbuf.as_ptr();
    c.add_iov_raw(ptr, HEADER_SIZE);
}

/// Success reply with no body. Quiet opcodes skip it entirely.
fn write_bin_response_empty(c: &mut Conn) {
    if c.noreply && c.cmd != opcode::GET && c.cmd != opcode::GETK {
        c.state = State::NewCmd;
        return;
    }
    add_bin_header(c, status::OK, 0, 0, 0);
    c.state = State::Mwrite;
    c.write_and_go = State::NewCmd;
}

/// Error replies always go out, quiet variant or not. A nonzero `swallow`
/// discards that many unread body bytes afterwards.
fn write_bin_error(c: &mut Conn, stat: u16, swallow: usize) {
    let msg = error_text(stat);
    c.cas = 0;
    add_bin_header(c, stat, 0, 0, msg.len() as u32);
    c.add_iov(msg.as_bytes());
    c.state = State::Mwrite;
    if swallow > 0 {
        c.sbytes = swallow;
        c.write_and_go = State::Swallow;
    } else {
        c.write_and_go = State::NewCmd;
    }
}

fn process_bin_update(c: &mut Conn, extras: &[u8], key: &[u8], vlen: usize) {
    let flags = BigEndian::read_u32(&extras[0..4]);
    let exptime = BigEndian::read_u32(&extras[4..8]);
    let exptime = c.shared.clock().realtime(i64::from(exptime));

    match c.shared.cache.alloc(key, flags, exptime, vlen + 2) {
        Ok(mut staged) => {
            staged.cas_req = c.bin_header.cas;
            // Any nonzero CAS turns the store into a compare-and-swap.
            let verb = if c.bin_header.cas != 0 {
                StoreVerb::Cas
            } else {
                match c.cmd {
                    opcode::ADD => StoreVerb::Add,
                    opcode::REPLACE => StoreVerb::Replace,
                    _ => StoreVerb::Set,
                }
            };
            c.staged = Some(PendingStore {
                item: staged,
                verb,
                filled: 0,
                total: vlen,
            });
            c.state = State::Nread;
        }
        Err(err) => {
            let stat = match err {
                AllocError::TooLarge => status::E2BIG,
                AllocError::OutOfMemory => status::ENOMEM,
            };
            write_bin_error(c, stat, vlen);
            if c.cmd == opcode::SET {
                c.shared.cache.delete(key, 0);
            }
        }
    }
}

fn process_bin_concat(c: &mut Conn, key: &[u8], vlen: usize) {
    match c.shared.cache.alloc(key, 0, 0, vlen + 2) {
        Ok(mut staged) => {
            staged.cas_req = c.bin_header.cas;
            let verb = if c.cmd == opcode::APPEND {
                StoreVerb::Append
            } else {
                StoreVerb::Prepend
            };
            c.staged = Some(PendingStore {
                item: staged,
                verb,
                filled: 0,
                total: vlen,
            });
            c.state = State::Nread;
        }
        Err(err) => {
            let stat = match err {
                AllocError::TooLarge => status::E2BIG,
                AllocError::OutOfMemory => status::ENOMEM,
            };
            write_bin_error(c, stat, vlen);
        }
    }
}

/// Runs once the value body is in place. Binary bodies do not carry the
/// CRLF; it is stamped here before the store.
pub(crate) fn complete_nread(c: &mut Conn) {
    let mut pending = c.staged.take().expect("completing a store with no staged item");
    {
        let mut st = c.stats.lock().expect("worker stats lock poisoned");
        st.slab[pending.item.clsid as usize].set_cmds += 1;
    }

    let nbytes = pending.item.nbytes as usize;
    pending.item.value_mut()[nbytes - 2..].copy_from_slice(b"\r\n");

    let verb = pending.verb;
    match c.shared.cache.store(pending.item, verb) {
        StoreOutcome::Stored { cas } => {
            c.cas = cas;
            write_bin_response_empty(c);
        }
        StoreOutcome::Exists => write_bin_error(c, status::KEY_EEXISTS, 0),
        StoreOutcome::NotFound => write_bin_error(c, status::KEY_ENOENT, 0),
        StoreOutcome::NotStored => {
            let stat = match verb {
                StoreVerb::Add => status::KEY_EEXISTS,
                StoreVerb::Replace => status::KEY_ENOENT,
                _ => status::NOT_STORED,
            };
            write_bin_error(c, stat, 0);
        }
    }
}

fn process_bin_get(c: &mut Conn, key: &[u8]) {
    let hit = c.shared.cache.get(key);
    {
        let mut st = c.stats.lock().expect("worker stats lock poisoned");
        st.get_cmds += 1;
        match &hit {
            Some(view) => st.slab[view.clsid as usize].get_hits += 1,
            None => st.get_misses += 1,
        }
    }

    match hit {
        Some(view) => {
            c.ilist.push(view.id);
            let with_key = c.cmd == opcode::GETK;
            let keylen = if with_key { view.nkey as u16 } else { 0 };
            let bodylen = 4 + (view.nbytes - 2) + keylen as usize;

            c.cas = view.cas;
            add_bin_header(c, status::OK, 4, keylen, bodylen as u32);

            // Flags ride as the four extras bytes right after the header.
            BigEndian::write_u32(&mut c.wbuf[HEADER_SIZE..HEADER_SIZE + 4], view.flags);
            let flags_ptr = unsafe { c.wbuf.as_ptr().add(HEADER_SIZE) };
            c.add_iov_raw(flags_ptr, 4);

            unsafe {
                if with_key {
                    c.add_iov(view.key());
                }
                let value = view.value();
                c.add_iov(&value[..value.len() - 2]);
            }
            c.state = State::Mwrite;
            c.write_and_go = State::NewCmd;
        }
        None => {
            if c.noreply {
                // Quiet get: a miss is silence.
                c.state = State::NewCmd;
            } else if c.cmd == opcode::GETK {
                // Echo the key back after the header.
                let klen = key.len();
                c.cas = 0;
                c.wbuf[HEADER_SIZE..HEADER_SIZE + klen].copy_from_slice(key);
                add_bin_header(c, status::KEY_ENOENT, 0, klen as u16, klen as u32);
                let key_ptr = unsafe { c.wbuf.as_ptr().add(HEADER_SIZE) };
                c.add_iov_raw(key_ptr, klen);
                c.state = State::Mwrite;
                c.write_and_go = State::NewCmd;
            } else {
                write_bin_error(c, status::KEY_ENOENT, 0);
            }
        }
    }
}

fn process_bin_delete(c: &mut Conn, key: &[u8]) {
    match c.shared.cache.delete(key, c.bin_header.cas) {
        DeleteOutcome::Deleted { clsid } => {
            c.stats
                .lock()
                .expect("worker stats lock poisoned")
                .slab[clsid as usize]
                .delete_hits += 1;
            write_bin_response_empty(c);
        }
        DeleteOutcome::Exists => write_bin_error(c, status::KEY_EEXISTS, 0),
        DeleteOutcome::NotFound => {
            c.stats
                .lock()
                .expect("worker stats lock poisoned")
                .delete_misses += 1;
            write_bin_error(c, status::KEY_ENOENT, 0);
        }
    }
}

fn process_bin_delta(c: &mut Conn, extras: &[u8], key: &[u8]) {
    let delta = BigEndian::read_u64(&extras[0..8]);
    let initial = BigEndian::read_u64(&extras[8..16]);
    let exptime = BigEndian::read_u32(&extras[16..20]);
    let incr = c.cmd == opcode::INCREMENT;

    match c.shared.cache.delta(key, incr, delta) {
        DeltaOutcome::Value { value, cas, clsid } => {
            {
                let mut st = c.stats.lock().expect("worker stats lock poisoned");
                if incr {
                    st.slab[clsid as usize].incr_hits += 1;
                } else {
                    st.slab[clsid as usize].decr_hits += 1;
                }
            }
            c.cas = cas;
            respond_bin_value(c, value);
        }
        DeltaOutcome::NonNumeric => write_bin_error(c, status::DELTA_BADVAL, 0),
        DeltaOutcome::OutOfMemory => write_bin_error(c, status::ENOMEM, 0),
        DeltaOutcome::NotFound => {
            if exptime == 0xffff_ffff {
                let mut st = c.stats.lock().expect("worker stats lock poisoned");
                if incr {
                    st.incr_misses += 1;
                } else {
                    st.decr_misses += 1;
                }
                drop(st);
                write_bin_error(c, status::KEY_ENOENT, 0);
            } else {
                // Seed the counter from the initial value.
                seed_bin_counter(c, key, initial, exptime);
            }
        }
    }
}

fn seed_bin_counter(c: &mut Conn, key: &[u8], initial: u64, exptime: u32) {
    let digits = initial.to_string();
    let exptime = c.shared.clock().realtime(i64::from(exptime));

    match c.shared.cache.alloc(key, 0, exptime, digits.len() + 2) {
        Err(_) => write_bin_error(c, status::ENOMEM, 0),
        Ok(mut staged) => {
            {
                let value = staged.value_mut();
                value[..digits.len()].copy_from_slice(digits.as_bytes());
                value[digits.len()..].copy_from_slice(b"\r\n");
            }
            match c.shared.cache.store(staged, StoreVerb::Set) {
                StoreOutcome::Stored { cas } => {
                    c.cas = cas;
                    respond_bin_value(c, initial);
                }
                _ => write_bin_error(c, status::NOT_STORED, 0),
            }
        }
    }
}

/// Arithmetic responses carry the new value as an 8-byte body.
fn respond_bin_value(c: &mut Conn, value: u64) {
    if c.noreply {
        c.state = State::NewCmd;
        return;
    }
    add_bin_header(c, status::OK, 0, 0, 8);
    BigEndian::write_u64(&mut c.wbuf[HEADER_SIZE..HEADER_SIZE + 8], value);
    let ptr = unsafe { c.wbuf.as_ptr().add(HEADER_SIZE) };
    c.add_iov_raw(ptr, 8);
    c.state = State::Mwrite;
    c.write_and_go = State::NewCmd;
}

fn process_bin_flush(c: &mut Conn, extras: &[u8]) {
    let clock = c.shared.clock();
    clock.tick();
    let now = clock.now();

    let watermark = if extras.len() == 4 {
        let exptime = BigEndian::read_u32(&extras[0..4]);
        if exptime > 0 {
            clock.realtime(i64::from(exptime)) - 1
        } else {
            now - 1
        }
    } else {
        now - 1
    };

    c.shared.cache.flush(watermark);
    write_bin_response_empty(c);
}

/// Stats ride as a packet per pair, terminated by an empty packet; the
/// whole sequence is generated into one owned buffer.
fn process_bin_stat(c: &mut Conn, key: &[u8]) {
    let pairs = if key.is_empty() {
        let engine = c.shared.cache.engine_stats();
        Some(stats::server_pairs(
            &c.shared.hub,
            &engine,
            c.shared.clock(),
            &c.shared.settings,
        ))
    } else if key == b"reset" {
        c.shared.hub.reset();
        c.shared.cache.reset_stats();
        Some(Vec::new())
    } else if key == b"items" {
        Some(c.shared.cache.items_pairs())
    } else if key == b"slabs" {
        Some(c.shared.cache.slabs_pairs())
    } else {
        None
    };

    match pairs {
        None => write_bin_error(c, status::KEY_ENOENT, 0),
        Some(pairs) => {
            let mut out = Vec::with_capacity((pairs.len() + 1) * 48);
            for (k, v) in &pairs {
                stat_packet(&mut out, c.opaque, k.as_bytes(), v.as_bytes());
            }
            stat_packet(&mut out, c.opaque, b"", b"");
            c.write_owned(out);
        }
    }
}

fn stat_packet(out: &mut Vec<u8>, opaque: u32, key: &[u8], value: &[u8]) {
    let mut header = [0u8; HEADER_SIZE];
    write_response_header(
        &mut header,
        opcode::STAT,
        status::OK,
        0,
        key.len() as u16,
        (key.len() + value.len()) as u32,
        opaque,
        0,
    );
    out.extend_from_slice(&header);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::context::Shared;
    use crate::net::conn::Protocol;
    use crate::settings::Settings;
    use crate::store::{Cache, CacheConfig};
    use std::sync::Arc;

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

    fn conn(shared: &Arc<Shared>) -> Conn {
        let stats = shared.hub.workers[0].clone();
        let mut c = Conn::new(Arc::clone(shared), stats, None);
        c.protocol = Protocol::Binary;
        c.state = State::NewCmd;
        c
    }

    fn request(op: u8, opaque: u32, cas: u64, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0] = MAGIC_REQ;
        buf[1] = op;
        BigEndian::write_u16(&mut buf[2..4], key.len() as u16);
        buf[4] = extras.len() as u8;
        BigEndian::write_u32(
            &mut buf[8..12],
            (extras.len() + key.len() + value.len()) as u32,
        );
        BigEndian::write_u32(&mut buf[12..16], opaque);
        BigEndian::write_u64(&mut buf[16..24], cas);
        buf.extend_from_slice(extras);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    fn set_extras(flags: u32, exptime: u32) -> [u8; 8] {
        let mut extras = [0u8; 8];
        BigEndian::write_u32(&mut extras[0..4], flags);
        BigEndian::write_u32(&mut extras[4..8], exptime);
        extras
    }

    #[test]
    fn test_header_roundtrip() {
        let req = request(opcode::SET, 0x11223344, 99, &set_extras(7, 0), b"key", b"value");
        let header = RequestHeader::parse(&req);
        assert_eq!(header.opcode, opcode::SET);
        assert_eq!(header.keylen, 3);
        assert_eq!(header.extlen, 8);
        assert_eq!(header.bodylen, 16);
        assert_eq!(header.opaque, 0x11223344);
        assert_eq!(header.cas, 99);
    }

    #[test]
    fn test_noop_roundtrip() {
        let shared = shared();
        let mut c = conn(&shared);

        c.feed(&request(opcode::NOOP, 0xdead_beef, 0, b"", b"", b""));
        let reply = c.pump();

        let mut expected = vec![0u8; HEADER_SIZE];
        expected[0] = MAGIC_RES;
        expected[1] = opcode::NOOP;
        BigEndian::write_u32(&mut expected[12..16], 0xdead_beef);
        assert_eq!(reply, expected);
    }

    #[test]
    fn test_set_then_get() {
        let shared = shared();
        let mut c = conn(&shared);

        c.feed(&request(opcode::SET, 1, 0, &set_extras(0xfeed, 0), b"foo", b"hello"));
        let reply = c.pump();
        assert_eq!(reply.len(), HEADER_SIZE);
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::OK);
        let set_cas = BigEndian::read_u64(&reply[16..24]);
        assert!(set_cas > 0);

        c.feed(&request(opcode::GET, 2, 0, b"", b"foo", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::OK);
        assert_eq!(reply[4], 4, "flags extras length");
        assert_eq!(BigEndian::read_u32(&reply[8..12]), 4 + 5);
        assert_eq!(BigEndian::read_u64(&reply[16..24]), set_cas);
        assert_eq!(BigEndian::read_u32(&reply[24..28]), 0xfeed);
        assert_eq!(&reply[28..], b"hello");
    }

    #[test]
    fn test_getk_echoes_key_on_miss() {
        let shared = shared();
        let mut c = conn(&shared);

        c.feed(&request(opcode::GETK, 3, 0, b"", b"ghost", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::KEY_ENOENT);
        assert_eq!(BigEndian::read_u16(&reply[2..4]), 5);
        assert_eq!(&reply[HEADER_SIZE..], b"ghost");

        // The quiet variant stays silent on a miss.
        c.feed(&request(opcode::GETKQ, 4, 0, b"", b"ghost", b""));
        assert!(c.pump().is_empty());
    }

    #[test]
    fn test_add_and_cas_statuses() {
        let shared = shared();
        let mut c = conn(&shared);

        c.feed(&request(opcode::ADD, 1, 0, &set_extras(0, 0), b"k", b"v1"));
        let reply = c.pump();
        let cas = BigEndian::read_u64(&reply[16..24]);

        // Second add: key exists.
        c.feed(&request(opcode::ADD, 2, 0, &set_extras(0, 0), b"k", b"v2"));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::KEY_EEXISTS);

        // Stale CAS on a set.
        c.feed(&request(opcode::SET, 3, cas + 1, &set_extras(0, 0), b"k", b"v3"));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::KEY_EEXISTS);

        // Matching CAS succeeds.
        c.feed(&request(opcode::SET, 4, cas, &set_extras(0, 0), b"k", b"v3"));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::OK);
    }

    #[test]
    fn test_replace_missing_key() {
        let shared = shared();
        let mut c = conn(&shared);

        c.feed(&request(opcode::REPLACE, 1, 0, &set_extras(0, 0), b"nope", b"v"));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::KEY_ENOENT);
    }

    #[test]
    fn test_incr_decr_and_seed() {
        let shared = shared();
        let mut c = conn(&shared);

        let mut extras = [0u8; 20];
        BigEndian::write_u64(&mut extras[0..8], 5);
        BigEndian::write_u64(&mut extras[8..16], 100);
        // Missing key + default expiration: seed from initial.
        c.feed(&request(opcode::INCREMENT, 1, 0, &extras, b"n", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::OK);
        assert_eq!(BigEndian::read_u64(&reply[24..32]), 100);

        c.feed(&request(opcode::INCREMENT, 2, 0, &extras, b"n", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u64(&reply[24..32]), 105);

        // 0xffffffff expiration means "do not create".
        BigEndian::write_u32(&mut extras[16..20], 0xffff_ffff);
        c.feed(&request(opcode::DECREMENT, 3, 0, &extras, b"ghost", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::KEY_ENOENT);
    }

    #[test]
    fn test_delete_with_cas_predicate() {
        let shared = shared();
        let mut c = conn(&shared);

        c.feed(&request(opcode::SET, 1, 0, &set_extras(0, 0), b"k", b"v"));
        let reply = c.pump();
        let cas = BigEndian::read_u64(&reply[16..24]);

        c.feed(&request(opcode::DELETE, 2, cas + 1, b"", b"k", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::KEY_EEXISTS);

        c.feed(&request(opcode::DELETE, 3, cas, b"", b"k", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::OK);

        c.feed(&request(opcode::DELETE, 4, 0, b"", b"k", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::KEY_ENOENT);
    }

    #[test]
    fn test_unknown_opcode() {
        let shared = shared();
        let mut c = conn(&shared);

        c.feed(&request(0x7f, 9, 0, b"", b"", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::UNKNOWN_COMMAND);
        assert_eq!(&reply[HEADER_SIZE..], b"Unknown command");
    }

    #[test]
    fn test_invalid_frame_disconnects() {
        let shared = shared();
        let mut c = conn(&shared);

        // GET must not carry extras.
        c.feed(&request(opcode::GET, 1, 0, &set_extras(0, 0), b"k", b""));
        let reply = c.pump();
        assert_eq!(BigEndian::read_u16(&reply[6..8]), status::EINVAL);
        assert_eq!(c.state, State::Closing);
    }

    #[test]
    fn test_quiet_set_is_silent() {
        let shared = shared();
        let mut c = conn(&shared);

        let mut input = request(opcode::SETQ, 1, 0, &set_extras(0, 0), b"k", b"v");
        input.extend_from_slice(&request(opcode::GET, 2, 0, b"", b"k", b""));
        c.feed(&input);
        let reply = c.pump();

        // Only the GET response is on the wire.
        assert_eq!(reply[1], opcode::GET);
        assert_eq!(&reply[28..], b"v");
    }

    #[test]
    fn test_stat_sequence_terminates() {
        let shared = shared();
        let mut c = conn(&shared);

        c.feed(&request(opcode::STAT, 7, 0, b"", b"", b""));
        let reply = c.pump();

        // Walk the packet sequence; the last one is empty.
        let mut off = 0;
        let mut packets = 0;
        while off < reply.len() {
            assert_eq!(reply[off], MAGIC_RES);
            assert_eq!(reply[off + 1], opcode::STAT);
            let bodylen = BigEndian::read_u32(&reply[off + 8..off + 12]) as usize;
            off += HEADER_SIZE + bodylen;
            packets += 1;
        }
        assert_eq!(off, reply.len());
        assert!(packets > 10);
        let tail_body = BigEndian::read_u32(&reply[reply.len() - 16..reply.len() - 12]);
        assert_eq!(tail_body, 0);
    }
}
