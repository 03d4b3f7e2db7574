use crate::clock::Clock;
use crate::settings::Settings;
use crate::slab::MAX_SLAB_CLASSES;
use crate::store::EngineStats;
use std::sync::{Arc, Mutex};

/// Per-slab-class operation counters.
#[derive(Clone, Copy, Default)]
pub struct SlabOpStats {
    pub set_cmds: u64,
    pub get_hits: u64,
    pub delete_hits: u64,
    pub incr_hits: u64,
    pub decr_hits: u64,
}

/// Counters accumulated by a single worker thread. Each worker owns one of
/// these behind its own mutex so the hot path never contends with siblings;
/// aggregation snapshots all of them and sums.
pub struct ThreadStats {
    pub get_cmds: u64,
    pub get_misses: u64,
    pub delete_misses: u64,
    pub incr_misses: u64,
    pub decr_misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub slab: [SlabOpStats; MAX_SLAB_CLASSES],
}

impl Default for ThreadStats {
    fn default() -> ThreadStats {
        ThreadStats {
            get_cmds: 0,
            get_misses: 0,
            delete_misses: 0,
            incr_misses: 0,
            decr_misses: 0,
            bytes_read: 0,
            bytes_written: 0,
            slab: [SlabOpStats::default(); MAX_SLAB_CLASSES],
        }
    }
}

impl ThreadStats {
    pub fn reset(&mut self) {
        *self = ThreadStats::default();
    }

    fn add(&mut self, other: &ThreadStats) {
        self.get_cmds += other.get_cmds;
        self.get_misses += other.get_misses;
        self.delete_misses += other.delete_misses;
        self.incr_misses += other.incr_misses;
        self.decr_misses += other.decr_misses;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        for (acc, s) in self.slab.iter_mut().zip(other.slab.iter()) {
            acc.set_cmds += s.set_cmds;
            acc.get_hits += s.get_hits;
            acc.delete_hits += s.delete_hits;
            acc.incr_hits += s.incr_hits;
            acc.decr_hits += s.decr_hits;
        }
    }

    /// Sums the per-class counters into whole-cache totals.
    pub fn slab_totals(&self) -> SlabOpStats {
        let mut total = SlabOpStats::default();
        for s in self.slab.iter() {
            total.set_cmds += s.set_cmds;
            total.get_hits += s.get_hits;
            total.delete_hits += s.delete_hits;
            total.incr_hits += s.incr_hits;
            total.decr_hits += s.decr_hits;
        }
        total
    }
}

/// Counters shared by the dispatcher and all workers.
#[derive(Default)]
pub struct GlobalStats {
    pub curr_conns: u64,
    pub total_conns: u64,
    pub conn_structs: u64,
}

/// All statistics surfaces in one place: one mutex per worker, one for the
/// globals.
pub struct StatsHub {
    pub workers: Vec<Arc<Mutex<ThreadStats>>>,
    pub global: Mutex<GlobalStats>,
}

impl StatsHub {
    pub fn new(num_workers: usize) -> StatsHub {
        StatsHub {
            workers: (0..num_workers)
                .map(|_| Arc::new(Mutex::new(ThreadStats::default())))
                .collect(),
            global: Mutex::new(GlobalStats::default()),
        }
    }

    /// Snapshot-and-sum across all workers.
    pub fn aggregate(&self) -> ThreadStats {
        let mut agg = ThreadStats::default();
        for w in &self.workers {
            let snap = w.lock().expect("worker stats lock poisoned");
            agg.add(&snap);
        }
        agg
    }

    pub fn reset(&self) {
        for w in &self.workers {
            w.lock().expect("worker stats lock poisoned").reset();
        }
        self.global
            .lock()
            .expect("global stats lock poisoned")
            .total_conns = 0;
    }
}

/// Builds the key/value pairs for a bare `stats` request. Both protocols
/// render the same pairs, each in its own framing.
pub fn server_pairs(
    hub: &StatsHub,
    engine: &EngineStats,
    clock: &Clock,
    settings: &Settings,
) -> Vec<(String, String)> {
    let agg = hub.aggregate();
    let slab = agg.slab_totals();
    let global = hub.global.lock().expect("global stats lock poisoned");
    let now = clock.now();

    let mut pairs = Vec::with_capacity(32);
    pairs.push(("pid".into(), std::process::id().to_string()));
    pairs.push(("uptime".into(), now.to_string()));
    pairs.push(("time".into(), (u64::from(now) + clock.started()).to_string()));
    pairs.push(("version".into(), crate::VERSION.into()));
    pairs.push((
        "pointer_size".into(),
        (8 * std::mem::size_of::<usize>()).to_string(),
    ));
    pairs.push((
        "curr_connections".into(),
        global.curr_conns.to_string(),
    ));
    pairs.push(("total_connections".into(), global.total_conns.to_string()));
    pairs.push((
        "connection_structures".into(),
        global.conn_structs.to_string(),
    ));
    pairs.push(("cmd_get".into(), agg.get_cmds.to_string()));
    pairs.push(("cmd_set".into(), slab.set_cmds.to_string()));
    pairs.push(("get_hits".into(), slab.get_hits.to_string()));
    pairs.push(("get_misses".into(), agg.get_misses.to_string()));
    pairs.push(("delete_hits".into(), slab.delete_hits.to_string()));
    pairs.push(("delete_misses".into(), agg.delete_misses.to_string()));
    pairs.push(("incr_hits".into(), slab.incr_hits.to_string()));
    pairs.push(("incr_misses".into(), agg.incr_misses.to_string()));
    pairs.push(("decr_hits".into(), slab.decr_hits.to_string()));
    pairs.push(("decr_misses".into(), agg.decr_misses.to_string()));
    pairs.push(("bytes_read".into(), agg.bytes_read.to_string()));
    pairs.push(("bytes_written".into(), agg.bytes_written.to_string()));
    pairs.push(("limit_maxbytes".into(), settings.max_bytes.to_string()));
    pairs.push(("threads".into(), settings.num_threads.to_string()));
    pairs.push(("curr_items".into(), engine.curr_items.to_string()));
    pairs.push(("total_items".into(), engine.total_items.to_string()));
    pairs.push(("bytes".into(), engine.curr_bytes.to_string()));
    pairs.push(("evictions".into(), engine.evictions.to_string()));
    pairs.push(("reclaimed".into(), engine.reclaimed.to_string()));
    pairs
}
