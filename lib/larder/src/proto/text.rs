//! The text protocol: whitespace-tokenized command lines, storage bodies
//! of declared length, CRLF-terminated ASCII replies.

use crate::item::KEY_MAX_LENGTH;
use crate::net::conn::{Conn, PendingStore, State};
use crate::slab::{Reassign, MAX_SLAB_CLASSES};
use crate::stats;
use crate::store::{AllocError, DeleteOutcome, DeltaOutcome, StoreOutcome, StoreVerb};
use std::io::Write;

/// Splits a command line on spaces; runs of spaces collapse.
pub(crate) fn tokenize(line: &[u8]) -> Vec<&[u8]> {
    line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect()
}

fn set_noreply_maybe(c: &mut Conn, tokens: &[&[u8]]) {
    if tokens.last().map_or(false, |t| **t == b"noreply"[..]) {
        c.noreply = true;
    }
}

fn parse_u64(token: &[u8]) -> Option<u64> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn parse_u32(token: &[u8]) -> Option<u32> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn parse_i64(token: &[u8]) -> Option<i64> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

/// Dispatches one tokenized command line, mirroring the reply contract of
/// the text protocol exactly.
pub(crate) fn process_command(c: &mut Conn, line: &[u8]) {
    let tokens = tokenize(line);
    if tokens.is_empty() {
        c.out_string("ERROR");
        return;
    }

    let cmd = tokens[0];
    let n = tokens.len();

    if (cmd == b"get" || cmd == b"bget") && n >= 2 {
        process_get(c, &tokens, false);
    } else if cmd == b"gets" && n >= 2 {
        process_get(c, &tokens, true);
    } else if (n == 5 || n == 6)
        && (cmd == b"set"
            || cmd == b"add"
            || cmd == b"replace"
            || cmd == b"append"
            || cmd == b"prepend")
    {
        let verb = match cmd {
            _ if cmd == b"add" => StoreVerb::Add,
            _ if cmd == b"replace" => StoreVerb::Replace,
            _ if cmd == b"append" => StoreVerb::Append,
            _ if cmd == b"prepend" => StoreVerb::Prepend,
            _ => StoreVerb::Set,
        };
        process_update(c, &tokens, verb, false);
    } else if (n == 6 || n == 7) && cmd == b"cas" {
        process_update(c, &tokens, StoreVerb::Cas, true);
    } else if (n == 3 || n == 4) && cmd == b"incr" {
        process_arithmetic(c, &tokens, true);
    } else if (n == 3 || n == 4) && cmd == b"decr" {
        process_arithmetic(c, &tokens, false);
    } else if (n == 2 || n == 3) && cmd == b"delete" {
        process_delete(c, &tokens);
    } else if cmd == b"stats" {
        process_stats(c, &tokens);
    } else if (1..=3).contains(&n) && cmd == b"flush_all" {
        process_flush(c, &tokens);
    } else if n == 1 && cmd == b"version" {
        c.out_string(&format!("VERSION {}", crate::VERSION));
    } else if n == 1 && cmd == b"quit" {
        c.state = State::Closing;
    } else if (n == 2 || n == 3) && cmd == b"verbosity" {
        process_verbosity(c, &tokens);
    } else if n == 4 && cmd == b"slabs" && tokens[1] == b"reassign" {
        process_reassign(c, &tokens);
    } else {
        c.out_string("ERROR");
    }
}

/// Multi-key lookup. Each hit contributes a `VALUE` record referencing the
/// pinned item's chunk; the reply is terminated by `END`.
fn process_get(c: &mut Conn, tokens: &[&[u8]], return_cas: bool) {
    let mut get_cmds = 0u64;
    let mut get_misses = 0u64;
    let mut get_hits = [0u64; MAX_SLAB_CLASSES];

    for key in &tokens[1..] {
        if key.len() > KEY_MAX_LENGTH {
            flush_get_stats(c, get_cmds, get_misses, &get_hits);
            c.out_error("CLIENT_ERROR bad command line format");
            return;
        }

        get_cmds += 1;
        match c.shared.cache.get(key) {
            Some(view) => {
                c.ilist.push(view.id);
                get_hits[view.clsid as usize] += 1;

                // Each hit adds "VALUE ", the key, then either the joint
                // suffix+value window or, for gets, the suffix with the
                // CAS decoration spliced in.
                c.add_iov(b"VALUE ");
                unsafe {
                    c.add_iov(view.key());
                }
                if return_cas {
                    unsafe {
                        c.add_iov(&view.suffix()[..view.nsuffix - 2]);
                    }
                    let mut buf = c.shared.suffixes.take();
                    let len = {
                        let mut cursor = std::io::Cursor::new(&mut buf[..]);
                        write!(cursor, " {}\r\n", view.cas).expect("cas suffix overflow");
                        cursor.position() as usize
                    };
                    let ptr = buf.as_ptr();
                    c.suffixes.push(buf);
                    c.add_iov_raw(ptr, len);
                    unsafe {
                        c.add_iov(view.value());
                    }
                } else {
                    unsafe {
                        c.add_iov(view.suffix_and_value());
                    }
                }
            }
            None => get_misses += 1,
        }
    }

    c.add_iov(b"END\r\n");
    c.state = State::Mwrite;
    c.write_and_go = State::NewCmd;

    flush_get_stats(c, get_cmds, get_misses, &get_hits);
}

fn flush_get_stats(c: &Conn, cmds: u64, misses: u64, hits: &[u64; MAX_SLAB_CLASSES]) {
    let mut st = c.stats.lock().expect("worker stats lock poisoned");
    st.get_cmds += cmds;
    st.get_misses += misses;
    for (acc, h) in st.slab.iter_mut().zip(hits.iter()) {
        acc.get_hits += h;
    }
}

fn process_update(c: &mut Conn, tokens: &[&[u8]], verb: StoreVerb, handle_cas: bool) {
    set_noreply_maybe(c, tokens);

    let key = tokens[1];
    if key.len() > KEY_MAX_LENGTH {
        c.out_error("CLIENT_ERROR bad command line format");
        return;
    }

    let parsed = (
        parse_u32(tokens[2]),
        parse_i64(tokens[3]),
        parse_i64(tokens[4]),
    );
    let (flags, exptime, vlen) = match parsed {
        (Some(flags), Some(exptime), Some(vlen)) if vlen >= 0 => (flags, exptime, vlen as usize),
        _ => {
            c.out_error("CLIENT_ERROR bad command line format");
            return;
        }
    };

    let cas_req = if handle_cas {
        match parse_u64(tokens[5]) {
            Some(cas) => cas,
            None => {
                c.out_error("CLIENT_ERROR bad command line format");
                return;
            }
        }
    } else {
        0
    };

    let exptime = c.shared.clock().realtime(exptime);
    match c.shared.cache.alloc(key, flags, exptime, vlen + 2) {
        Ok(mut staged) => {
            staged.cas_req = cas_req;
            c.staged = Some(PendingStore {
                item: staged,
                verb,
                filled: 0,
                total: vlen + 2,
            });
            c.state = State::Nread;
        }
        Err(err) => {
            match err {
                AllocError::TooLarge => c.out_error("SERVER_ERROR object too large for cache"),
                AllocError::OutOfMemory => {
                    c.out_error("SERVER_ERROR out of memory storing object")
                }
            }
            // The body still arrives; throw it away.
            c.write_and_go = State::Swallow;
            c.sbytes = vlen + 2;

            // A failed set must not leave stale data behind.
            if verb == StoreVerb::Set {
                c.shared.cache.delete(key, 0);
            }
        }
    }
}

/// Runs after the value body has been read into the staged item.
pub(crate) fn complete_nread(c: &mut Conn) {
    let pending = c.staged.take().expect("completing a store with no staged item");
    {
        let mut st = c.stats.lock().expect("worker stats lock poisoned");
        st.slab[pending.item.clsid as usize].set_cmds += 1;
    }

    if !pending.item.value().ends_with(b"\r\n") {
        c.shared.cache.discard(pending.item);
        c.out_error("CLIENT_ERROR bad data chunk");
        return;
    }

    match c.shared.cache.store(pending.item, pending.verb) {
        StoreOutcome::Stored { cas } => {
            c.cas = cas;
            c.out_string("STORED");
        }
        StoreOutcome::Exists => c.out_string("EXISTS"),
        StoreOutcome::NotFound => c.out_string("NOT_FOUND"),
        StoreOutcome::NotStored => c.out_string("NOT_STORED"),
    }
}

fn process_arithmetic(c: &mut Conn, tokens: &[&[u8]], incr: bool) {
    set_noreply_maybe(c, tokens);

    let key = tokens[1];
    if key.len() > KEY_MAX_LENGTH {
        c.out_error("CLIENT_ERROR bad command line format");
        return;
    }
    let delta = match parse_u64(tokens[2]) {
        Some(delta) => delta,
        None => {
            c.out_error("CLIENT_ERROR bad command line format");
            return;
        }
    };

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
            c.out_string(&value.to_string());
        }
        DeltaOutcome::NotFound => {
            {
                let mut st = c.stats.lock().expect("worker stats lock poisoned");
                if incr {
                    st.incr_misses += 1;
                } else {
                    st.decr_misses += 1;
                }
            }
            c.out_string("NOT_FOUND");
        }
        DeltaOutcome::NonNumeric => {
            c.out_error("CLIENT_ERROR cannot increment or decrement non-numeric value")
        }
        DeltaOutcome::OutOfMemory => c.out_error("SERVER_ERROR out of memory in incr/decr"),
    }
}

fn process_delete(c: &mut Conn, tokens: &[&[u8]]) {
    set_noreply_maybe(c, tokens);

    let key = tokens[1];
    if key.len() > KEY_MAX_LENGTH {
        c.out_error("CLIENT_ERROR bad command line format");
        return;
    }

    match c.shared.cache.delete(key, 0) {
        DeleteOutcome::Deleted { clsid } => {
            c.stats
                .lock()
                .expect("worker stats lock poisoned")
                .slab[clsid as usize]
                .delete_hits += 1;
            c.out_string("DELETED");
        }
        DeleteOutcome::NotFound | DeleteOutcome::Exists => {
            c.stats
                .lock()
                .expect("worker stats lock poisoned")
                .delete_misses += 1;
            c.out_string("NOT_FOUND");
        }
    }
}

fn process_stats(c: &mut Conn, tokens: &[&[u8]]) {
    if tokens.len() == 1 {
        let engine = c.shared.cache.engine_stats();
        let pairs = stats::server_pairs(
            &c.shared.hub,
            &engine,
            c.shared.clock(),
            &c.shared.settings,
        );
        c.write_owned(format_stat_pairs(&pairs));
        return;
    }

    let sub = tokens[1];
    if sub == b"reset" {
        c.shared.hub.reset();
        c.shared.cache.reset_stats();
        c.out_string("RESET");
    } else if sub == b"items" && tokens.len() == 2 {
        c.write_owned(format_stat_pairs(&c.shared.cache.items_pairs()));
    } else if sub == b"slabs" && tokens.len() == 2 {
        c.write_owned(format_stat_pairs(&c.shared.cache.slabs_pairs()));
    } else if sub == b"cachedump" && tokens.len() == 4 {
        let parsed = (parse_u64(tokens[2]), parse_u64(tokens[3]));
        match parsed {
            (Some(clsid), Some(limit)) => {
                match c.shared.cache.cachedump(clsid, limit as usize) {
                    Some(dump) => c.write_owned(dump),
                    None => c.out_error("CLIENT_ERROR bad command line format"),
                }
            }
            _ => c.out_error("CLIENT_ERROR bad command line format"),
        }
    } else {
        c.out_string("ERROR");
    }
}

fn format_stat_pairs(pairs: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pairs.len() * 32 + 5);
    for (key, value) in pairs {
        write!(out, "STAT {} {}\r\n", key, value).expect("stats formatting failed");
    }
    out.extend_from_slice(b"END\r\n");
    out
}

fn process_flush(c: &mut Conn, tokens: &[&[u8]]) {
    set_noreply_maybe(c, tokens);

    let clock = c.shared.clock();
    clock.tick();
    let now = clock.now();

    let args = tokens.len() - 1 - usize::from(c.noreply);
    let watermark = if args == 0 {
        now - 1
    } else {
        match parse_i64(tokens[1]) {
            Some(exptime) if exptime > 0 => clock.realtime(exptime) - 1,
            Some(_) => now - 1,
            None => {
                c.out_error("CLIENT_ERROR bad command line format");
                return;
            }
        }
    };

    c.shared.cache.flush(watermark);
    c.out_string("OK");
}

fn process_verbosity(c: &mut Conn, tokens: &[&[u8]]) {
    set_noreply_maybe(c, tokens);

    match parse_u64(tokens[1]) {
        Some(level) => {
            c.shared.set_verbosity(level.min(u64::from(u8::MAX)) as u8);
            c.out_string("OK");
        }
        None => c.out_error("CLIENT_ERROR bad command line format"),
    }
}

fn process_reassign(c: &mut Conn, tokens: &[&[u8]]) {
    let parsed = (parse_u64(tokens[2]), parse_u64(tokens[3]));
    let (src, dst) = match parsed {
        (Some(src), Some(dst)) => (src, dst),
        _ => {
            c.out_error("CLIENT_ERROR bad command line format");
            return;
        }
    };

    if src == dst || !c.shared.cache.valid_class(src) || !c.shared.cache.valid_class(dst) {
        c.out_error("CLIENT_ERROR bad command line format");
        return;
    }

    match c.shared.cache.reassign(src as u8, dst as u8) {
        Reassign::Done => c.out_string("DONE"),
        Reassign::Cant => c.out_string("CANT"),
        Reassign::Busy => c.out_string("BUSY"),
    }
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
        shared_with(CacheConfig {
            page_size: 65536,
            hashpower: 8,
            ..CacheConfig::default()
        })
    }

    fn shared_with(config: CacheConfig) -> Arc<Shared> {
        let clock = Arc::new(Clock::new());
        clock.set(10);
        let cache = Arc::new(Cache::new(config, clock, None));
        Arc::new(Shared::new(cache, Settings::default()))
    }

    fn conn(shared: &Arc<Shared>) -> Conn {
        let stats = shared.hub.workers[0].clone();
        let mut c = Conn::new(Arc::clone(shared), stats, None);
        c.protocol = Protocol::Text;
        c.state = State::NewCmd;
        c
    }

    fn roundtrip(c: &mut Conn, input: &[u8]) -> Vec<u8> {
        c.feed(input);
        c.pump()
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize(b"set  foo 0 0 5");
        assert_eq!(tokens, vec![&b"set"[..], b"foo", b"0", b"0", b"5"]);
        assert!(tokenize(b"").is_empty());
    }

    #[test]
    fn test_basic_set_get() {
        let shared = shared();
        let mut c = conn(&shared);

        let reply = roundtrip(&mut c, b"set foo 0 0 5\r\nhello\r\n");
        assert_eq!(reply, b"STORED\r\n");

        let reply = roundtrip(&mut c, b"get foo\r\n");
        assert_eq!(reply, b"VALUE foo 0 5\r\nhello\r\nEND\r\n");
    }

    #[test]
    fn test_multi_key_get_with_miss() {
        let shared = shared();
        let mut c = conn(&shared);

        roundtrip(&mut c, b"set foo 0 0 5\r\nhello\r\n");
        let reply = roundtrip(&mut c, b"get foo bar foo\r\n");
        assert_eq!(
            reply,
            b"VALUE foo 0 5\r\nhello\r\nVALUE foo 0 5\r\nhello\r\nEND\r\n".to_vec()
        );

        let st = shared.hub.workers[0].lock().unwrap();
        assert_eq!(st.get_misses, 1);
    }

    #[test]
    fn test_cas_conflict_flow() {
        let shared = shared();
        let mut c = conn(&shared);

        roundtrip(&mut c, b"set foo 0 0 5\r\nhello\r\n");
        let reply = roundtrip(&mut c, b"gets foo\r\n");

        // VALUE foo 0 5 <cas>\r\nhello\r\nEND\r\n
        let text = String::from_utf8(reply).unwrap();
        assert!(text.starts_with("VALUE foo 0 5 "));
        let cas: u64 = text
            .lines()
            .next()
            .unwrap()
            .rsplit(' ')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        let stale = format!("cas foo 0 0 5 {}\r\nhello\r\n", cas + 1);
        assert_eq!(roundtrip(&mut c, stale.as_bytes()), b"EXISTS\r\n");

        let fresh = format!("cas foo 0 0 5 {}\r\nworld\r\n", cas);
        assert_eq!(roundtrip(&mut c, fresh.as_bytes()), b"STORED\r\n");
        assert_eq!(
            roundtrip(&mut c, b"get foo\r\n"),
            b"VALUE foo 0 5\r\nworld\r\nEND\r\n"
        );
    }

    #[test]
    fn test_add_replace_append_prepend() {
        let shared = shared();
        let mut c = conn(&shared);

        assert_eq!(roundtrip(&mut c, b"replace k 0 0 1\r\nx\r\n"), b"NOT_STORED\r\n");
        assert_eq!(roundtrip(&mut c, b"add k 5 0 3\r\nmid\r\n"), b"STORED\r\n");
        assert_eq!(roundtrip(&mut c, b"add k 0 0 1\r\ny\r\n"), b"NOT_STORED\r\n");
        assert_eq!(roundtrip(&mut c, b"append k 0 0 4\r\n-end\r\n"), b"STORED\r\n");
        assert_eq!(roundtrip(&mut c, b"prepend k 0 0 6\r\nstart-\r\n"), b"STORED\r\n");
        // Flags stay from the original add.
        assert_eq!(
            roundtrip(&mut c, b"get k\r\n"),
            b"VALUE k 5 13\r\nstart-mid-end\r\nEND\r\n"
        );
    }

    #[test]
    fn test_incr_decr() {
        let shared = shared();
        let mut c = conn(&shared);

        roundtrip(&mut c, b"set n 0 0 1\r\n3\r\n");
        assert_eq!(roundtrip(&mut c, b"incr n 4\r\n"), b"7\r\n");
        assert_eq!(roundtrip(&mut c, b"decr n 10\r\n"), b"0\r\n");
        assert_eq!(roundtrip(&mut c, b"incr missing 1\r\n"), b"NOT_FOUND\r\n");

        roundtrip(&mut c, b"set s 0 0 4\r\npony\r\n");
        assert_eq!(
            roundtrip(&mut c, b"incr s 1\r\n"),
            b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec()
        );
        assert_eq!(roundtrip(&mut c, b"incr n x\r\n"), b"CLIENT_ERROR bad command line format\r\n".to_vec());
    }

    #[test]
    fn test_delete() {
        let shared = shared();
        let mut c = conn(&shared);

        assert_eq!(roundtrip(&mut c, b"set q 0 0 1\r\nv\r\n"), b"STORED\r\n");
        assert_eq!(roundtrip(&mut c, b"delete q\r\n"), b"DELETED\r\n");
        assert_eq!(roundtrip(&mut c, b"delete q\r\n"), b"NOT_FOUND\r\n");
        assert_eq!(roundtrip(&mut c, b"get q\r\n"), b"END\r\n");
    }

    #[test]
    fn test_noreply_suppresses_success_only() {
        let shared = shared();
        let mut c = conn(&shared);

        // Pipelined noreply set followed by a get: only the get replies.
        let reply = roundtrip(&mut c, b"set k 0 0 1 noreply\r\nw\r\nget k\r\n");
        assert_eq!(reply, b"VALUE k 0 1\r\nw\r\nEND\r\n");

        // Errors still reach the client under noreply.
        let reply = roundtrip(&mut c, b"set k 0 0 2 noreply\r\nxy!!");
        assert_eq!(reply, b"CLIENT_ERROR bad data chunk\r\n");
    }

    #[test]
    fn test_bad_data_chunk() {
        let shared = shared();
        let mut c = conn(&shared);

        let reply = roundtrip(&mut c, b"set k 0 0 5\r\nhelloXX");
        assert_eq!(reply, b"CLIENT_ERROR bad data chunk\r\n");
    }

    #[test]
    fn test_unknown_command_and_key_length() {
        let shared = shared();
        let mut c = conn(&shared);

        assert_eq!(roundtrip(&mut c, b"frobnicate\r\n"), b"ERROR\r\n");

        let long_key = vec![b'k'; KEY_MAX_LENGTH + 1];
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&long_key);
        line.extend_from_slice(b"\r\n");
        assert_eq!(
            roundtrip(&mut c, &line),
            b"CLIENT_ERROR bad command line format\r\n"
        );

        let mut line = b"set ".to_vec();
        line.extend_from_slice(&long_key);
        line.extend_from_slice(b" 0 0 1\r\n");
        assert_eq!(
            roundtrip(&mut c, &line),
            b"CLIENT_ERROR bad command line format\r\n"
        );
    }

    #[test]
    fn test_oversize_object_is_swallowed() {
        let shared = shared_with(CacheConfig {
            page_size: 2048,
            hashpower: 4,
            ..CacheConfig::default()
        });
        let mut c = conn(&shared);

        // Declared body far beyond the largest class: error now, body
        // discarded, next command still parses.
        let mut input = b"set big 0 0 5000\r\n".to_vec();
        input.extend_from_slice(&vec![b'z'; 5002]);
        input.extend_from_slice(b"version\r\n");

        let reply = roundtrip(&mut c, &input);
        let text = String::from_utf8(reply).unwrap();
        assert!(text.starts_with("SERVER_ERROR object too large for cache\r\n"));
        assert!(text.contains("VERSION"));
    }

    #[test]
    fn test_failed_set_drops_stale_item() {
        let shared = shared_with(CacheConfig {
            page_size: 2048,
            hashpower: 4,
            ..CacheConfig::default()
        });
        let mut c = conn(&shared);

        roundtrip(&mut c, b"set k 0 0 2\r\nok\r\n");
        let mut input = b"set k 0 0 5000\r\n".to_vec();
        input.extend_from_slice(&vec![b'z'; 5002]);
        roundtrip(&mut c, &input);

        assert_eq!(roundtrip(&mut c, b"get k\r\n"), b"END\r\n");
    }

    #[test]
    fn test_flush_all() {
        let shared = shared();
        let mut c = conn(&shared);

        roundtrip(&mut c, b"set k 0 0 1\r\nv\r\n");
        assert_eq!(roundtrip(&mut c, b"flush_all\r\n"), b"OK\r\n");
        assert_eq!(roundtrip(&mut c, b"get k\r\n"), b"END\r\n");
    }

    #[test]
    fn test_version_quit_verbosity() {
        let shared = shared();
        let mut c = conn(&shared);

        let reply = roundtrip(&mut c, b"version\r\n");
        assert_eq!(reply, format!("VERSION {}\r\n", crate::VERSION).as_bytes());

        assert_eq!(roundtrip(&mut c, b"verbosity 1\r\n"), b"OK\r\n");
        assert_eq!(shared.verbosity(), 1);
        // Clamped to the maximum level.
        assert_eq!(roundtrip(&mut c, b"verbosity 9\r\n"), b"OK\r\n");
        assert_eq!(shared.verbosity(), 2);

        roundtrip(&mut c, b"quit\r\n");
        assert_eq!(c.state, State::Closing);
    }

    #[test]
    fn test_stats_replies() {
        let shared = shared();
        let mut c = conn(&shared);

        roundtrip(&mut c, b"set k 0 0 1\r\nv\r\n");
        let reply = roundtrip(&mut c, b"stats\r\n");
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("STAT curr_items 1\r\n"));
        assert!(text.contains("STAT cmd_set 1\r\n"));
        assert!(text.ends_with("END\r\n"));

        let reply = roundtrip(&mut c, b"stats items\r\n");
        assert!(String::from_utf8(reply).unwrap().contains(":number 1"));

        let reply = roundtrip(&mut c, b"stats slabs\r\n");
        assert!(String::from_utf8(reply).unwrap().contains("total_malloced"));

        assert_eq!(roundtrip(&mut c, b"stats reset\r\n"), b"RESET\r\n");
        assert_eq!(roundtrip(&mut c, b"stats bogus\r\n"), b"ERROR\r\n");
    }

    #[test]
    fn test_slabs_reassign() {
        let shared = shared();
        let mut c = conn(&shared);

        assert_eq!(
            roundtrip(&mut c, b"slabs reassign 1 1\r\n"),
            b"CLIENT_ERROR bad command line format\r\n"
        );
        // Nothing allocated in class 1 yet.
        assert_eq!(roundtrip(&mut c, b"slabs reassign 1 2\r\n"), b"CANT\r\n");
    }

    #[test]
    fn test_pipelined_commands() {
        let shared = shared();
        let mut c = conn(&shared);

        let reply = roundtrip(
            &mut c,
            b"set a 0 0 1\r\nx\r\nset b 0 0 1\r\ny\r\nget a b\r\n",
        );
        assert_eq!(
            reply,
            b"STORED\r\nSTORED\r\nVALUE a 0 1\r\nx\r\nVALUE b 0 1\r\ny\r\nEND\r\n".to_vec()
        );
    }
}
