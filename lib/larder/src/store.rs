//! The item store: a chained hash index with background incremental
//! rehashing, per-class LRU lists, reference counting, lazy expiration and
//! eviction-on-insert. Everything mutable lives behind a single cache
//! mutex; operations lock, delegate to the `do_*` body, and unlock.

use crate::clock::{Clock, RelTime};
use crate::item::{suffix_len, Item, ItemId, StagedItem, ITEM_HEADER_SIZE};
use crate::settings::Settings;
use crate::slab::{ClassId, Reassign, SlabAllocator, SLAB_PAGE_SIZE};
use hearth::logging;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

/// An item accessed within the last interval is not re-inserted at the LRU
/// head; this bounds list churn under hot-key workloads.
const ITEM_UPDATE_INTERVAL: RelTime = 60;

/// Bound on the LRU tail walk when hunting for an eviction victim.
const EVICTION_SEARCH_DEPTH: usize = 50;

/// Cap on the `stats cachedump` reply.
const CACHEDUMP_LIMIT_BYTES: usize = 128 * 1024;

/// Storage verbs shared by both protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored { cas: u64 },
    NotStored,
    Exists,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { clsid: ClassId },
    NotFound,
    /// A CAS predicate was supplied and did not match.
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Value { value: u64, cas: u64, clsid: ClassId },
    NotFound,
    NonNumeric,
    OutOfMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The item exceeds the largest slab class.
    TooLarge,
    /// The class is full and no evictable candidate was found.
    OutOfMemory,
}

/// Engine-level counters, all maintained under the cache lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub curr_items: u64,
    pub total_items: u64,
    pub curr_bytes: u64,
    pub evictions: u64,
    pub reclaimed: u64,
    pub mem_allocated: u64,
}

/// A refcount-pinned window onto a linked item. The raw pointers stay valid
/// until the holder releases the item id back to the cache: the refcount
/// keeps the chunk alive and linked chunks are never mutated.
pub struct ItemView {
    pub id: ItemId,
    pub clsid: ClassId,
    pub flags: u32,
    pub cas: u64,
    pub nkey: usize,
    pub nsuffix: usize,
    pub nbytes: usize,
    base: *const u8,
}

// SAFETY: the pointer targets a chunk pinned by the refcount held together
// with this view; chunks do not move and are immutable while linked.
unsafe impl Send for ItemView {}

impl ItemView {
    /// # Safety
    /// The caller must still hold the item reference this view was created
    /// with.
    #[inline]
    pub unsafe fn key<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.base, self.nkey)
    }

    /// # Safety
    /// As [`ItemView::key`].
    #[inline]
    pub unsafe fn suffix<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.base.add(self.nkey), self.nsuffix)
    }

    /// Suffix and value as one contiguous slice (they are adjacent in the
    /// chunk), the shape a plain text GET reply wants.
    ///
    /// # Safety
    /// As [`ItemView::key`].
    #[inline]
    pub unsafe fn suffix_and_value<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.base.add(self.nkey), self.nsuffix + self.nbytes)
    }

    /// Value bytes including the trailing CRLF.
    ///
    /// # Safety
    /// As [`ItemView::key`].
    #[inline]
    pub unsafe fn value<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.base.add(self.nkey + self.nsuffix), self.nbytes)
    }

    /// Owned copy of the value without the trailing CRLF.
    pub fn value_vec(&self) -> Vec<u8> {
        unsafe {
            let v = self.value();
            v[..v.len() - 2].to_vec()
        }
    }
}

/// Construction parameters for the engine. Split out from [`Settings`] so
/// tests can shrink pages and the hash table.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub mem_limit: usize,
    pub factor: f64,
    pub min_chunk: usize,
    pub page_size: usize,
    pub hashpower: u32,
    pub preallocate: bool,
    pub evict_to_free: bool,
    pub use_cas: bool,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            mem_limit: 64 * 1024 * 1024,
            factor: 1.25,
            min_chunk: 48,
            page_size: SLAB_PAGE_SIZE,
            hashpower: 16,
            preallocate: false,
            evict_to_free: true,
            use_cas: true,
        }
    }
}

impl CacheConfig {
    pub fn from_settings(settings: &Settings) -> CacheConfig {
        CacheConfig {
            mem_limit: settings.max_bytes,
            factor: settings.factor,
            min_chunk: settings.chunk_size,
            preallocate: settings.preallocate,
            evict_to_free: settings.evict_to_free,
            use_cas: settings.use_cas,
            ..CacheConfig::default()
        }
    }
}

#[derive(Clone, Copy, Default)]
struct LruList {
    head: Option<ItemId>,
    tail: Option<ItemId>,
    count: usize,
}

#[derive(Clone, Copy)]
enum Loc {
    Primary(usize),
    Old(usize),
}

struct StoreInner {
    slabs: SlabAllocator,
    slots: Vec<Option<Item>>,
    free_slots: Vec<ItemId>,
    primary: Vec<Option<ItemId>>,
    old: Vec<Option<ItemId>>,
    hashpower: u32,
    expanding: bool,
    expand_bucket: usize,
    notify_maint: bool,
    run_maintenance: bool,
    lru: Vec<LruList>,
    cas_counter: u64,
    use_cas: bool,
    evict_to_free: bool,
    oldest_live: RelTime,
    curr_items: u64,
    total_items: u64,
    curr_bytes: u64,
    evictions: u64,
    reclaimed: u64,
}

/// The shared cache: slab allocator + item index + LRU behind one mutex,
/// plus the condvar that wakes the rehash maintenance thread.
pub struct Cache {
    inner: Mutex<StoreInner>,
    maint: Condvar,
    clock: Arc<Clock>,
    log: logging::Logger,
}

impl Cache {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: CacheConfig,
        clock: Arc<Clock>,
        log: L,
    ) -> Cache {
        let cache_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let slabs = SlabAllocator::new(
            config.mem_limit,
            config.factor,
            config.min_chunk,
            ITEM_HEADER_SIZE,
            config.page_size,
            config.preallocate,
        );
        let lru = vec![LruList::default(); slabs.num_classes() + 1];

        Cache {
            inner: Mutex::new(StoreInner {
                slabs,
                slots: Vec::new(),
                free_slots: Vec::new(),
                primary: vec![None; 1 << config.hashpower],
                old: Vec::new(),
                hashpower: config.hashpower,
                expanding: false,
                expand_bucket: 0,
                notify_maint: false,
                run_maintenance: true,
                lru,
                cas_counter: 0,
                use_cas: config.use_cas,
                evict_to_free: config.evict_to_free,
                oldest_live: 0,
                curr_items: 0,
                total_items: 0,
                curr_bytes: 0,
                evictions: 0,
                reclaimed: 0,
            }),
            maint: Condvar::new(),
            clock,
            log: cache_log,
        }
    }

    #[inline]
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<StoreInner> {
        self.inner.lock().expect("cache lock poisoned")
    }

    fn nudge_maintenance(&self, inner: &mut StoreInner) {
        if inner.notify_maint {
            inner.notify_maint = false;
            self.maint.notify_one();
        }
    }

    /// Looks a key up, treating expired and flushed items as absent. A hit
    /// pins the item and bumps its LRU position; the caller must `release`
    /// the returned view's id when done with it.
    pub fn get(&self, key: &[u8]) -> Option<ItemView> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let id = inner.do_find_live(key, now)?;
        inner.it_mut(id).refcount += 1;
        inner.do_item_update(id, now);
        Some(inner.view(id))
    }

    /// Drops one reference on an item.
    pub fn release(&self, id: ItemId) {
        let mut inner = self.lock();
        inner.release_ref(id);
    }

    /// Drops one reference on each listed item.
    pub fn release_many(&self, ids: &mut Vec<ItemId>) {
        if ids.is_empty() {
            return;
        }
        let mut inner = self.lock();
        for id in ids.drain(..) {
            inner.release_ref(id);
        }
    }

    /// Allocates a staged item sized for `vlen` value bytes (CRLF
    /// included), evicting from the target class tail if it is full.
    pub fn alloc(
        &self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        vlen: usize,
    ) -> Result<StagedItem, AllocError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.do_alloc(key, flags, exptime, vlen, now)
    }

    /// Returns an abandoned staged item's chunk to the slab allocator.
    pub fn discard(&self, staged: StagedItem) {
        let mut inner = self.lock();
        inner.discard_staged(staged);
    }

    /// Applies a storage verb. Consumes the staged item either way.
    pub fn store(&self, staged: StagedItem, verb: StoreVerb) -> StoreOutcome {
        let now = self.clock.now();
        let mut inner = self.lock();
        let outcome = inner.do_store(staged, verb, now);
        self.nudge_maintenance(&mut inner);
        outcome
    }

    /// Unlinks a key. A nonzero `cas_req` turns this into compare-and-delete.
    pub fn delete(&self, key: &[u8], cas_req: u64) -> DeleteOutcome {
        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.do_find_live(key, now) {
            None => DeleteOutcome::NotFound,
            Some(id) => {
                let (cas, clsid) = {
                    let it = inner.it(id);
                    (it.cas, it.clsid)
                };
                if cas_req != 0 && cas_req != cas {
                    DeleteOutcome::Exists
                } else {
                    inner.do_unlink(id);
                    DeleteOutcome::Deleted { clsid }
                }
            }
        }
    }

    /// Adds or subtracts an unsigned decimal delta. Increment wraps modulo
    /// 2^64, decrement saturates at zero. The result is stored in a freshly
    /// allocated item with a fresh CAS and an exact stored length.
    pub fn delta(&self, key: &[u8], incr: bool, delta: u64) -> DeltaOutcome {
        let now = self.clock.now();
        let mut inner = self.lock();
        let outcome = inner.do_delta(key, incr, delta, now);
        self.nudge_maintenance(&mut inner);
        outcome
    }

    /// Installs the flush watermark and proactively unlinks items accessed
    /// at or after it (everything older is caught lazily on lookup).
    pub fn flush(&self, watermark: RelTime) {
        let mut inner = self.lock();
        inner.oldest_live = watermark;
        if watermark == 0 {
            return;
        }
        for cls in 1..inner.lru.len() {
            let mut cur = inner.lru[cls].head;
            while let Some(id) = cur {
                let (time, next) = {
                    let it = inner.it(id);
                    (it.time, it.next)
                };
                if time >= watermark {
                    cur = next;
                    inner.do_unlink(id);
                } else {
                    break;
                }
            }
        }
    }

    /// Moves one free page from `src` to `dst`.
    pub fn reassign(&self, src: ClassId, dst: ClassId) -> Reassign {
        let mut inner = self.lock();
        inner.slabs.reassign(src, dst)
    }

    /// True when `id` names a usable slab class.
    pub fn valid_class(&self, id: u64) -> bool {
        let inner = self.lock();
        id >= 1 && id <= inner.slabs.num_classes() as u64
    }

    pub fn engine_stats(&self) -> EngineStats {
        let inner = self.lock();
        EngineStats {
            curr_items: inner.curr_items,
            total_items: inner.total_items,
            curr_bytes: inner.curr_bytes,
            evictions: inner.evictions,
            reclaimed: inner.reclaimed,
            mem_allocated: inner.slabs.mem_allocated() as u64,
        }
    }

    /// Zeroes the resettable engine counters (`stats reset`).
    pub fn reset_stats(&self) {
        let mut inner = self.lock();
        inner.total_items = 0;
        inner.evictions = 0;
        inner.reclaimed = 0;
    }

    /// Per-class LRU counters for `stats items`.
    pub fn items_pairs(&self) -> Vec<(String, String)> {
        let now = self.clock.now();
        let inner = self.lock();
        let mut pairs = Vec::new();
        for cls in 1..inner.lru.len() {
            let list = inner.lru[cls];
            if list.count == 0 {
                continue;
            }
            let age = list
                .tail
                .map(|id| now.saturating_sub(inner.it(id).time))
                .unwrap_or(0);
            pairs.push((format!("items:{}:number", cls), list.count.to_string()));
            pairs.push((format!("items:{}:age", cls), age.to_string()));
        }
        pairs
    }

    /// Per-class chunk accounting for `stats slabs`.
    pub fn slabs_pairs(&self) -> Vec<(String, String)> {
        let inner = self.lock();
        let mut pairs = Vec::new();
        let mut active = 0;
        for id in 1..=inner.slabs.num_classes() {
            let class = inner.slabs.class(id as ClassId);
            if class.pages() == 0 {
                continue;
            }
            active += 1;
            pairs.push((format!("{}:chunk_size", id), class.chunk_size().to_string()));
            pairs.push((format!("{}:chunks_per_page", id), class.per_page().to_string()));
            pairs.push((format!("{}:total_pages", id), class.pages().to_string()));
            pairs.push((format!("{}:total_chunks", id), class.total_chunks().to_string()));
            pairs.push((format!("{}:used_chunks", id), class.used_chunks().to_string()));
            pairs.push((format!("{}:free_chunks", id), class.free_chunks().to_string()));
        }
        pairs.push(("active_slabs".into(), active.to_string()));
        pairs.push((
            "total_malloced".into(),
            inner.slabs.mem_allocated().to_string(),
        ));
        pairs
    }

    /// Bounded dump of one class's LRU, head first. `None` for an invalid
    /// class id.
    pub fn cachedump(&self, clsid: u64, limit: usize) -> Option<Vec<u8>> {
        use std::io::Write;

        if !self.valid_class(clsid) {
            return None;
        }
        let inner = self.lock();
        let mut out = Vec::new();
        let mut shown = 0;
        let mut cur = inner.lru[clsid as usize].head;
        while let Some(id) = cur {
            if limit != 0 && shown >= limit {
                break;
            }
            let it = inner.it(id);
            let mut line = Vec::with_capacity(it.nkey as usize + 32);
            line.extend_from_slice(b"ITEM ");
            line.extend_from_slice(it.key());
            write!(
                line,
                " [{} b; {} s]\r\n",
                it.nbytes - 2,
                u64::from(it.exptime) + self.clock.started()
            )
            .expect("cachedump line formatting failed");
            if out.len() + line.len() + 5 > CACHEDUMP_LIMIT_BYTES {
                break;
            }
            out.extend_from_slice(&line);
            shown += 1;
            cur = it.next;
        }
        out.extend_from_slice(b"END\r\n");
        Some(out)
    }

    /// Starts the background rehash thread. It sleeps on the condvar until
    /// an insert pushes the load factor over the expansion threshold, then
    /// migrates one bucket per lock acquisition.
    pub fn spawn_maintenance(cache: &Arc<Cache>) -> thread::JoinHandle<()> {
        let cache = Arc::clone(cache);
        thread::Builder::new()
            .name("maintenance".into())
            .spawn(move || cache.maintenance_loop())
            .expect("Error spawning maintenance thread")
    }

    /// Stops the maintenance thread at its next wake-up.
    pub fn shutdown_maintenance(&self) {
        let mut inner = self.lock();
        inner.run_maintenance = false;
        self.maint.notify_one();
    }

    fn maintenance_loop(&self) {
        let mut inner = self.lock();
        loop {
            while inner.run_maintenance && !inner.expanding {
                inner = self
                    .maint
                    .wait(inner)
                    .expect("cache lock poisoned while waiting");
            }
            if !inner.run_maintenance {
                return;
            }

            logging::debug!(self.log, "hash expansion started";
                            "buckets" => 1usize << inner.hashpower);
            while inner.expanding && inner.run_maintenance {
                inner.migrate_bucket();
                // Yield the cache mutex between buckets so workers are not
                // stalled for the whole migration.
                drop(inner);
                inner = self.lock();
            }
            logging::debug!(self.log, "hash expansion done";
                            "buckets" => 1usize << inner.hashpower);
        }
    }

    /// Runs any pending migration to completion on the calling thread.
    /// Used by tests in place of the maintenance thread.
    #[cfg(test)]
    pub(crate) fn run_pending_rehash(&self) {
        let mut inner = self.lock();
        while inner.expanding {
            inner.migrate_bucket();
        }
    }
}

impl StoreInner {
    #[inline]
    fn it(&self, id: ItemId) -> &Item {
        self.slots[id].as_ref().expect("dangling item id")
    }

    #[inline]
    fn it_mut(&mut self, id: ItemId) -> &mut Item {
        self.slots[id].as_mut().expect("dangling item id")
    }

    fn view(&self, id: ItemId) -> ItemView {
        let it = self.it(id);
        ItemView {
            id,
            clsid: it.clsid,
            flags: it.flags,
            cas: it.cas,
            nkey: it.nkey as usize,
            nsuffix: it.nsuffix as usize,
            nbytes: it.nbytes as usize,
            base: it.chunk.as_ptr(),
        }
    }

    // ---- hash table ----------------------------------------------------

    fn locate(&self, hv: u32) -> Loc {
        let mask = (1usize << self.hashpower) - 1;
        if self.expanding {
            let old_mask = (1usize << (self.hashpower - 1)) - 1;
            let ob = (hv as usize) & old_mask;
            if ob >= self.expand_bucket {
                return Loc::Old(ob);
            }
        }
        Loc::Primary(hv as usize & mask)
    }

    #[inline]
    fn bucket(&self, loc: Loc) -> Option<ItemId> {
        match loc {
            Loc::Primary(i) => self.primary[i],
            Loc::Old(i) => self.old[i],
        }
    }

    #[inline]
    fn set_bucket(&mut self, loc: Loc, head: Option<ItemId>) {
        match loc {
            Loc::Primary(i) => self.primary[i] = head,
            Loc::Old(i) => self.old[i] = head,
        }
    }

    fn hash_find(&self, key: &[u8], hv: u32) -> Option<ItemId> {
        let mut cur = self.bucket(self.locate(hv));
        while let Some(id) = cur {
            let it = self.it(id);
            if it.key() == key {
                return Some(id);
            }
            cur = it.h_next;
        }
        None
    }

    fn hash_insert(&mut self, id: ItemId, hv: u32) {
        let loc = self.locate(hv);
        let head = self.bucket(loc);
        self.it_mut(id).h_next = head;
        self.set_bucket(loc, Some(id));
    }

    fn hash_delete(&mut self, id: ItemId, hv: u32) {
        let loc = self.locate(hv);
        let head = self.bucket(loc);
        if head == Some(id) {
            let next = self.it(id).h_next;
            self.set_bucket(loc, next);
        } else {
            let mut pred = head.expect("item missing from its hash bucket");
            loop {
                let next = self
                    .it(pred)
                    .h_next
                    .expect("item missing from its hash chain");
                if next == id {
                    let skip = self.it(id).h_next;
                    self.it_mut(pred).h_next = skip;
                    break;
                }
                pred = next;
            }
        }
        self.it_mut(id).h_next = None;
    }

    fn start_expand(&mut self) {
        let new_size = 1usize << (self.hashpower + 1);
        self.old = std::mem::replace(&mut self.primary, vec![None; new_size]);
        self.hashpower += 1;
        self.expand_bucket = 0;
        self.expanding = true;
        self.notify_maint = true;
    }

    fn migrate_bucket(&mut self) {
        if !self.expanding {
            return;
        }
        let mut cur = self.old[self.expand_bucket].take();
        while let Some(id) = cur {
            let next = self.it(id).h_next;
            let hv = hash(self.it(id).key());
            let nb = (hv as usize) & ((1usize << self.hashpower) - 1);
            self.it_mut(id).h_next = self.primary[nb];
            self.primary[nb] = Some(id);
            cur = next;
        }
        self.expand_bucket += 1;
        if self.expand_bucket >= self.old.len() {
            self.old = Vec::new();
            self.expanding = false;
        }
    }

    // ---- LRU -----------------------------------------------------------

    fn lru_insert_head(&mut self, id: ItemId) {
        let cls = self.it(id).clsid as usize;
        let head = self.lru[cls].head;
        {
            let it = self.it_mut(id);
            it.prev = None;
            it.next = head;
        }
        match head {
            Some(h) => self.it_mut(h).prev = Some(id),
            None => self.lru[cls].tail = Some(id),
        }
        self.lru[cls].head = Some(id);
        self.lru[cls].count += 1;
    }

    fn lru_remove(&mut self, id: ItemId) {
        let (cls, prev, next) = {
            let it = self.it(id);
            (it.clsid as usize, it.prev, it.next)
        };
        match prev {
            Some(p) => self.it_mut(p).next = next,
            None => self.lru[cls].head = next,
        }
        match next {
            Some(n) => self.it_mut(n).prev = prev,
            None => self.lru[cls].tail = prev,
        }
        {
            let it = self.it_mut(id);
            it.prev = None;
            it.next = None;
        }
        self.lru[cls].count -= 1;
    }

    // ---- item lifecycle ------------------------------------------------

    /// Find a key, lazily unlinking it when expired or flushed. Does not
    /// take a reference.
    fn do_find_live(&mut self, key: &[u8], now: RelTime) -> Option<ItemId> {
        let hv = hash(key);
        let id = self.hash_find(key, hv)?;

        let (dead_flush, dead_expired) = {
            let it = self.it(id);
            (
                self.oldest_live != 0 && self.oldest_live <= now && it.time <= self.oldest_live,
                it.exptime != 0 && it.exptime <= now,
            )
        };
        if dead_flush || dead_expired {
            self.do_unlink(id);
            return None;
        }
        Some(id)
    }

    /// LRU bump, coalesced to once per interval.
    fn do_item_update(&mut self, id: ItemId, now: RelTime) {
        let bump = {
            let it = self.it(id);
            it.linked && it.time < now.wrapping_sub(ITEM_UPDATE_INTERVAL)
        };
        if bump {
            self.lru_remove(id);
            self.it_mut(id).time = now;
            self.lru_insert_head(id);
        }
    }

    fn do_alloc(
        &mut self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        vlen: usize,
        now: RelTime,
    ) -> Result<StagedItem, AllocError> {
        let nsuffix = suffix_len(flags, vlen);
        let ntotal = ITEM_HEADER_SIZE + key.len() + nsuffix + vlen;
        let clsid = self.slabs.clsid(ntotal).ok_or(AllocError::TooLarge)?;

        let chunk = match self.slabs.alloc(clsid) {
            Some(chunk) => chunk,
            None => {
                if !self.evict_to_free {
                    return Err(AllocError::OutOfMemory);
                }
                self.evict_one(clsid, now)?;
                self.slabs.alloc(clsid).ok_or(AllocError::OutOfMemory)?
            }
        };

        Ok(StagedItem::build(chunk, clsid, key, flags, exptime, vlen))
    }

    /// Walks the class tail for the first item nothing but the index holds,
    /// and unlinks it to recycle its chunk.
    fn evict_one(&mut self, clsid: ClassId, now: RelTime) -> Result<(), AllocError> {
        let mut tries = EVICTION_SEARCH_DEPTH;
        let mut cur = self.lru[clsid as usize].tail;
        while tries > 0 {
            let id = match cur {
                Some(id) => id,
                None => break,
            };
            let (refcount, prev, expired) = {
                let it = self.it(id);
                (it.refcount, it.prev, it.exptime != 0 && it.exptime <= now)
            };
            if refcount == 1 {
                if expired {
                    self.reclaimed += 1;
                } else {
                    self.evictions += 1;
                }
                self.do_unlink(id);
                return Ok(());
            }
            cur = prev;
            tries -= 1;
        }
        Err(AllocError::OutOfMemory)
    }

    fn discard_staged(&mut self, staged: StagedItem) {
        self.slabs.free(staged.clsid, staged.chunk);
    }

    /// Moves a staged item into the arena and links it: fresh CAS, hash
    /// head insert, LRU head insert, counter updates, expansion check.
    fn insert_staged(&mut self, staged: StagedItem, now: RelTime) -> ItemId {
        let item = Item {
            chunk: staged.chunk,
            nkey: staged.nkey,
            nsuffix: staged.nsuffix,
            nbytes: staged.nbytes,
            flags: staged.flags,
            exptime: staged.exptime,
            time: now,
            cas: 0,
            refcount: 0,
            linked: false,
            clsid: staged.clsid,
            h_next: None,
            prev: None,
            next: None,
        };
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(item);
                id
            }
            None => {
                self.slots.push(Some(item));
                self.slots.len() - 1
            }
        };
        self.do_link(id);
        id
    }

    fn do_link(&mut self, id: ItemId) {
        let hv = hash(self.it(id).key());
        let cas = if self.use_cas {
            self.cas_counter += 1;
            self.cas_counter
        } else {
            0
        };
        let ntotal = {
            let it = self.it_mut(id);
            debug_assert!(!it.linked);
            it.cas = cas;
            it.linked = true;
            // The index itself holds one reference.
            it.refcount += 1;
            it.ntotal()
        };

        self.hash_insert(id, hv);
        self.lru_insert_head(id);
        self.curr_items += 1;
        self.total_items += 1;
        self.curr_bytes += ntotal as u64;

        let buckets = 1u64 << self.hashpower;
        if !self.expanding && self.curr_items > buckets + buckets / 2 {
            self.start_expand();
        }
    }

    /// Removes visibility: hash, LRU and the index's reference. Physical
    /// free happens when the last reference drops.
    fn do_unlink(&mut self, id: ItemId) {
        if !self.it(id).linked {
            return;
        }
        let (hv, ntotal) = {
            let it = self.it_mut(id);
            it.linked = false;
            (hash(it.key()), it.ntotal())
        };
        self.hash_delete(id, hv);
        self.lru_remove(id);
        self.curr_items -= 1;
        self.curr_bytes -= ntotal as u64;
        self.release_ref(id);
    }

    fn release_ref(&mut self, id: ItemId) {
        let free = {
            let it = self.it_mut(id);
            debug_assert!(it.refcount > 0, "refcount underflow");
            it.refcount -= 1;
            it.refcount == 0 && !it.linked
        };
        if free {
            let item = self.slots[id].take().expect("dangling item id");
            self.slabs.free(item.clsid, item.chunk);
            self.free_slots.push(id);
        }
    }

    // ---- operations ----------------------------------------------------

    fn do_store(&mut self, staged: StagedItem, verb: StoreVerb, now: RelTime) -> StoreOutcome {
        let old = self.do_find_live(staged.key(), now);
        if let Some(o) = old {
            self.it_mut(o).refcount += 1;
        }
        let mut staged = Some(staged);

        let outcome = match (verb, old) {
            (StoreVerb::Add, Some(o)) => {
                // add only adds a nonexistent item, but promotes the
                // existing one.
                self.do_item_update(o, now);
                self.discard_staged(staged.take().expect("staged item consumed twice"));
                StoreOutcome::NotStored
            }
            (StoreVerb::Replace, None)
            | (StoreVerb::Append, None)
            | (StoreVerb::Prepend, None) => {
                self.discard_staged(staged.take().expect("staged item consumed twice"));
                StoreOutcome::NotStored
            }
            (StoreVerb::Cas, None) => {
                self.discard_staged(staged.take().expect("staged item consumed twice"));
                StoreOutcome::NotFound
            }
            (StoreVerb::Cas, Some(o)) => {
                let st = staged.take().expect("staged item consumed twice");
                if st.cas_req == self.it(o).cas {
                    self.do_unlink(o);
                    let id = self.insert_staged(st, now);
                    StoreOutcome::Stored {
                        cas: self.it(id).cas,
                    }
                } else {
                    self.discard_staged(st);
                    StoreOutcome::Exists
                }
            }
            (StoreVerb::Append, Some(o)) | (StoreVerb::Prepend, Some(o)) => {
                let st = staged.take().expect("staged item consumed twice");
                self.do_concat(o, st, verb == StoreVerb::Append, now)
            }
            (StoreVerb::Set, _) | (StoreVerb::Add, None) | (StoreVerb::Replace, Some(_)) => {
                let st = staged.take().expect("staged item consumed twice");
                if let Some(o) = old {
                    self.do_unlink(o);
                }
                let id = self.insert_staged(st, now);
                StoreOutcome::Stored {
                    cas: self.it(id).cas,
                }
            }
        };

        if let Some(o) = old {
            self.release_ref(o);
        }
        outcome
    }

    /// Combines the old value with the staged one into a new item,
    /// preserving the existing flags and expiration.
    fn do_concat(
        &mut self,
        old: ItemId,
        st: StagedItem,
        append: bool,
        now: RelTime,
    ) -> StoreOutcome {
        if st.cas_req != 0 && st.cas_req != self.it(old).cas {
            self.discard_staged(st);
            return StoreOutcome::Exists;
        }

        let (flags, exptime, old_len) = {
            let it = self.it(old);
            (it.flags, it.exptime, it.nbytes as usize)
        };
        let key: Vec<u8> = st.key().to_vec();
        // Both halves carry a CRLF; the seam drops one of them.
        let combined = old_len + st.nbytes as usize - 2;

        let mut merged = match self.do_alloc(&key, flags, exptime, combined, now) {
            Ok(merged) => merged,
            Err(_) => {
                // An oversize or unallocatable concatenation is refused,
                // leaving the old item in place.
                self.discard_staged(st);
                return StoreOutcome::NotStored;
            }
        };

        {
            let old_v = self.it(old).value();
            let new_v = st.value();
            let dst = merged.value_mut();
            if append {
                dst[..old_len].copy_from_slice(old_v);
                dst[old_len - 2..].copy_from_slice(new_v);
            } else {
                dst[..new_v.len()].copy_from_slice(new_v);
                dst[new_v.len() - 2..].copy_from_slice(old_v);
            }
        }

        self.discard_staged(st);
        self.do_unlink(old);
        let id = self.insert_staged(merged, now);
        StoreOutcome::Stored {
            cas: self.it(id).cas,
        }
    }

    fn do_delta(&mut self, key: &[u8], incr: bool, delta: u64, now: RelTime) -> DeltaOutcome {
        let id = match self.do_find_live(key, now) {
            Some(id) => id,
            None => return DeltaOutcome::NotFound,
        };
        self.it_mut(id).refcount += 1;

        let parsed = {
            let v = self.it(id).value();
            parse_delta_value(&v[..v.len() - 2])
        };

        let outcome = match parsed {
            None => DeltaOutcome::NonNumeric,
            Some(current) => {
                let value = if incr {
                    current.wrapping_add(delta)
                } else {
                    current.saturating_sub(delta)
                };
                let digits = value.to_string();
                let (flags, exptime) = {
                    let it = self.it(id);
                    (it.flags, it.exptime)
                };
                let key: Vec<u8> = key.to_vec();

                match self.do_alloc(&key, flags, exptime, digits.len() + 2, now) {
                    Err(_) => DeltaOutcome::OutOfMemory,
                    Ok(mut fresh) => {
                        {
                            let dst = fresh.value_mut();
                            dst[..digits.len()].copy_from_slice(digits.as_bytes());
                            dst[digits.len()..].copy_from_slice(b"\r\n");
                        }
                        self.do_unlink(id);
                        let nid = self.insert_staged(fresh, now);
                        DeltaOutcome::Value {
                            value,
                            cas: self.it(nid).cas,
                            clsid: self.it(nid).clsid,
                        }
                    }
                }
            }
        };

        self.release_ref(id);
        outcome
    }
}

/// Jenkins one-at-a-time; cheap, well distributed, and stable across
/// platforms.
pub fn hash(key: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in key {
        h = h.wrapping_add(u32::from(b));
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

/// Parses the stored value of an arithmetic target: skip leading
/// non-digits, then read the decimal run. `None` when there are no digits
/// or the number overflows u64.
pub(crate) fn parse_delta_value(v: &[u8]) -> Option<u64> {
    let start = v.iter().position(|b| b.is_ascii_digit())?;
    let mut value: u64 = 0;
    for &b in &v[start..] {
        if !b.is_ascii_digit() {
            break;
        }
        value = value
            .checked_mul(10)?
            .checked_add(u64::from(b - b'0'))?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::KEY_MAX_LENGTH;

    const PAGE: usize = 2048;

    fn cache_with(config: CacheConfig) -> Cache {
        let clock = Arc::new(Clock::new());
        clock.set(10);
        Cache::new(config, clock, None)
    }

    fn small_cache() -> Cache {
        cache_with(CacheConfig {
            mem_limit: 1024 * 1024,
            page_size: PAGE,
            hashpower: 4,
            ..CacheConfig::default()
        })
    }

    fn set(cache: &Cache, key: &[u8], value: &[u8]) -> StoreOutcome {
        set_full(cache, key, value, 0, 0)
    }

    fn set_full(
        cache: &Cache,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: RelTime,
    ) -> StoreOutcome {
        let mut staged = cache
            .alloc(key, flags, exptime, value.len() + 2)
            .expect("alloc failed");
        staged.value_mut()[..value.len()].copy_from_slice(value);
        staged.value_mut()[value.len()..].copy_from_slice(b"\r\n");
        cache.store(staged, StoreVerb::Set)
    }

    fn verb(cache: &Cache, key: &[u8], value: &[u8], v: StoreVerb, cas_req: u64) -> StoreOutcome {
        let mut staged = cache.alloc(key, 0, 0, value.len() + 2).expect("alloc failed");
        staged.value_mut()[..value.len()].copy_from_slice(value);
        staged.value_mut()[value.len()..].copy_from_slice(b"\r\n");
        staged.cas_req = cas_req;
        cache.store(staged, v)
    }

    fn get_value(cache: &Cache, key: &[u8]) -> Option<Vec<u8>> {
        cache.get(key).map(|view| {
            let v = view.value_vec();
            cache.release(view.id);
            v
        })
    }

    fn check_invariants(cache: &Cache) {
        let inner = cache.lock();

        // Chunk conservation: occupied arena slots of a class account for
        // exactly the chunks missing from its freelist.
        let mut per_class = vec![0usize; inner.slabs.num_classes() + 1];
        for slot in inner.slots.iter().flatten() {
            per_class[slot.clsid as usize] += 1;
        }
        for id in 1..=inner.slabs.num_classes() {
            let class = inner.slabs.class(id as ClassId);
            assert_eq!(class.used_chunks(), per_class[id], "class {} chunks", id);
        }

        // Hash membership: every chained item is linked, referenced and
        // counted once.
        let mut hashed = 0u64;
        let buckets = inner
            .primary
            .iter()
            .chain(inner.old.iter().skip(inner.expand_bucket));
        for bucket in buckets {
            let mut cur = *bucket;
            while let Some(id) = cur {
                let it = inner.it(id);
                assert!(it.linked);
                assert!(it.refcount >= 1);
                hashed += 1;
                cur = it.h_next;
            }
        }
        assert_eq!(hashed, inner.curr_items);

        // LRU membership matches the item count.
        let mut lru_total = 0u64;
        for list in inner.lru.iter() {
            let mut cur = list.head;
            let mut n = 0;
            while let Some(id) = cur {
                n += 1;
                cur = inner.it(id).next;
            }
            assert_eq!(n, list.count);
            lru_total += n as u64;
        }
        assert_eq!(lru_total, inner.curr_items);
    }

    #[test]
    fn test_set_get_roundtrip() {
        let cache = small_cache();
        assert!(matches!(set(&cache, b"foo", b"hello"), StoreOutcome::Stored { .. }));
        assert_eq!(get_value(&cache, b"foo").unwrap(), b"hello");
        assert_eq!(get_value(&cache, b"bar"), None);
        check_invariants(&cache);
    }

    #[test]
    fn test_set_is_idempotent() {
        let cache = small_cache();
        set(&cache, b"foo", b"hello");
        set(&cache, b"foo", b"hello");
        assert_eq!(get_value(&cache, b"foo").unwrap(), b"hello");
        assert_eq!(cache.engine_stats().curr_items, 1);
        check_invariants(&cache);
    }

    #[test]
    fn test_cas_tokens_strictly_increase() {
        let cache = small_cache();
        let mut last = 0;
        for i in 0..10 {
            let key = format!("k{}", i);
            match set(&cache, key.as_bytes(), b"v") {
                StoreOutcome::Stored { cas } => {
                    assert!(cas > last);
                    last = cas;
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn test_add_excludes_existing() {
        let cache = small_cache();
        set(&cache, b"k", b"v1");
        assert_eq!(verb(&cache, b"k", b"v2", StoreVerb::Add, 0), StoreOutcome::NotStored);
        assert_eq!(get_value(&cache, b"k").unwrap(), b"v1");
        assert!(matches!(
            verb(&cache, b"fresh", b"v", StoreVerb::Add, 0),
            StoreOutcome::Stored { .. }
        ));
    }

    #[test]
    fn test_replace_requires_existing() {
        let cache = small_cache();
        assert_eq!(verb(&cache, b"k", b"v", StoreVerb::Replace, 0), StoreOutcome::NotStored);
        set(&cache, b"k", b"v1");
        assert!(matches!(
            verb(&cache, b"k", b"v2", StoreVerb::Replace, 0),
            StoreOutcome::Stored { .. }
        ));
        assert_eq!(get_value(&cache, b"k").unwrap(), b"v2");
    }

    #[test]
    fn test_cas_conflict() {
        let cache = small_cache();
        let cas = match set(&cache, b"k", b"hello") {
            StoreOutcome::Stored { cas } => cas,
            other => panic!("unexpected outcome {:?}", other),
        };

        assert_eq!(verb(&cache, b"k", b"x", StoreVerb::Cas, cas + 1), StoreOutcome::Exists);
        assert!(matches!(
            verb(&cache, b"k", b"world", StoreVerb::Cas, cas),
            StoreOutcome::Stored { .. }
        ));
        assert_eq!(get_value(&cache, b"k").unwrap(), b"world");
        // The old token is stale now.
        assert_eq!(verb(&cache, b"k", b"again", StoreVerb::Cas, cas), StoreOutcome::Exists);
        assert_eq!(verb(&cache, b"missing", b"v", StoreVerb::Cas, 1), StoreOutcome::NotFound);
    }

    #[test]
    fn test_append_prepend() {
        let cache = small_cache();
        assert_eq!(verb(&cache, b"k", b"x", StoreVerb::Append, 0), StoreOutcome::NotStored);

        set_full(&cache, b"k", b"mid", 7, 0);
        assert!(matches!(
            verb(&cache, b"k", b"-end", StoreVerb::Append, 0),
            StoreOutcome::Stored { .. }
        ));
        assert!(matches!(
            verb(&cache, b"k", b"start-", StoreVerb::Prepend, 0),
            StoreOutcome::Stored { .. }
        ));

        let view = cache.get(b"k").unwrap();
        assert_eq!(view.value_vec(), b"start-mid-end");
        // Flags survive concatenation.
        assert_eq!(view.flags, 7);
        cache.release(view.id);
        check_invariants(&cache);
    }

    #[test]
    fn test_append_oversize_is_refused() {
        let cache = small_cache();
        set(&cache, b"big", b"x");
        let huge = vec![b'a'; PAGE];
        assert_eq!(
            verb(&cache, b"big", &huge, StoreVerb::Append, 0),
            StoreOutcome::NotStored
        );
        assert_eq!(get_value(&cache, b"big").unwrap(), b"x");
    }

    #[test]
    fn test_delete() {
        let cache = small_cache();
        assert_eq!(cache.delete(b"k", 0), DeleteOutcome::NotFound);

        let cas = match set(&cache, b"k", b"v") {
            StoreOutcome::Stored { cas } => cas,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(cache.delete(b"k", cas + 1), DeleteOutcome::Exists);
        assert!(matches!(cache.delete(b"k", cas), DeleteOutcome::Deleted { .. }));
        assert_eq!(get_value(&cache, b"k"), None);
        check_invariants(&cache);
    }

    #[test]
    fn test_delta_basics() {
        let cache = small_cache();
        assert_eq!(cache.delta(b"n", true, 1), DeltaOutcome::NotFound);

        set(&cache, b"n", b"41");
        assert!(matches!(cache.delta(b"n", true, 1), DeltaOutcome::Value { value: 42, .. }));
        assert_eq!(get_value(&cache, b"n").unwrap(), b"42");

        // Decrement saturates at zero.
        set(&cache, b"n", b"3");
        assert!(matches!(cache.delta(b"n", false, 10), DeltaOutcome::Value { value: 0, .. }));
        assert_eq!(get_value(&cache, b"n").unwrap(), b"0");

        // Increment wraps modulo 2^64.
        set(&cache, b"n", b"18446744073709551615");
        assert!(matches!(cache.delta(b"n", true, 1), DeltaOutcome::Value { value: 0, .. }));

        set(&cache, b"s", b"pony");
        assert_eq!(cache.delta(b"s", true, 1), DeltaOutcome::NonNumeric);
    }

    #[test]
    fn test_delta_regenerates_cas_and_length() {
        let cache = small_cache();
        let cas = match set(&cache, b"n", b"9") {
            StoreOutcome::Stored { cas } => cas,
            other => panic!("unexpected outcome {:?}", other),
        };
        cache.delta(b"n", true, 1);

        let view = cache.get(b"n").unwrap();
        assert!(view.cas > cas);
        assert_eq!(view.value_vec(), b"10");
        assert_eq!(view.nbytes, 4);
        cache.release(view.id);
    }

    #[test]
    fn test_parse_delta_value() {
        assert_eq!(parse_delta_value(b"123"), Some(123));
        assert_eq!(parse_delta_value(b"  77"), Some(77));
        assert_eq!(parse_delta_value(b"12abc"), Some(12));
        assert_eq!(parse_delta_value(b"abc"), None);
        assert_eq!(parse_delta_value(b""), None);
        assert_eq!(parse_delta_value(b"99999999999999999999999"), None);
    }

    #[test]
    fn test_expiration_is_lazy() {
        let cache = small_cache();
        set_full(&cache, b"k", b"v", 0, 11);
        assert_eq!(get_value(&cache, b"k").unwrap(), b"v");

        cache.clock().set(12);
        assert_eq!(get_value(&cache, b"k"), None);
        assert_eq!(cache.engine_stats().curr_items, 0);
        check_invariants(&cache);
    }

    #[test]
    fn test_flush_watermark() {
        let cache = small_cache();
        set(&cache, b"a", b"1");
        set(&cache, b"b", b"2");

        // Items stored in the same second as the flush are swept
        // proactively; older ones die lazily on lookup.
        let now = cache.clock().now();
        cache.flush(now - 1);

        assert_eq!(get_value(&cache, b"a"), None);
        assert_eq!(get_value(&cache, b"b"), None);
        assert_eq!(cache.engine_stats().curr_items, 0);

        // Stores after the flush live normally.
        cache.clock().set(now + 5);
        set(&cache, b"c", b"3");
        assert_eq!(get_value(&cache, b"c").unwrap(), b"3");
    }

    fn two_item_cache(evict: bool) -> Cache {
        // One chunk per page and a two-page budget: the relevant class
        // holds exactly two items.
        cache_with(CacheConfig {
            mem_limit: 2 * PAGE,
            page_size: PAGE,
            hashpower: 4,
            evict_to_free: evict,
            ..CacheConfig::default()
        })
    }

    fn big_value() -> Vec<u8> {
        vec![b'x'; PAGE * 3 / 5]
    }

    #[test]
    fn test_eviction_under_pressure() {
        let cache = two_item_cache(true);
        let v = big_value();

        assert!(matches!(set(&cache, b"K1", &v), StoreOutcome::Stored { .. }));
        assert!(matches!(set(&cache, b"K2", &v), StoreOutcome::Stored { .. }));
        assert!(matches!(set(&cache, b"K3", &v), StoreOutcome::Stored { .. }));

        assert_eq!(get_value(&cache, b"K1"), None);
        assert!(get_value(&cache, b"K2").is_some());
        assert!(get_value(&cache, b"K3").is_some());
        assert_eq!(cache.engine_stats().evictions, 1);
        check_invariants(&cache);
    }

    #[test]
    fn test_eviction_disabled_reports_oom() {
        let cache = two_item_cache(false);
        let v = big_value();

        set(&cache, b"K1", &v);
        set(&cache, b"K2", &v);
        assert_eq!(cache.alloc(b"K3", 0, 0, v.len() + 2).err(), Some(AllocError::OutOfMemory));

        assert!(get_value(&cache, b"K1").is_some());
        assert!(get_value(&cache, b"K2").is_some());
        assert_eq!(cache.engine_stats().evictions, 0);
    }

    #[test]
    fn test_eviction_skips_pinned_items() {
        let cache = two_item_cache(true);
        let v = big_value();

        set(&cache, b"K1", &v);
        set(&cache, b"K2", &v);

        // Pin K1 as an in-flight reply would, then touch K2 so the pinned
        // item sits at the LRU tail.
        let pinned = cache.get(b"K1").unwrap();
        let touched = cache.get(b"K2").unwrap();
        cache.release(touched.id);

        set(&cache, b"K3", &v);

        // K2 was evicted instead of the pinned tail item K1.
        assert!(get_value(&cache, b"K1").is_some());
        assert_eq!(get_value(&cache, b"K2"), None);
        assert!(get_value(&cache, b"K3").is_some());
        cache.release(pinned.id);
        check_invariants(&cache);
    }

    #[test]
    fn test_unlinked_item_survives_while_pinned() {
        let cache = small_cache();
        set(&cache, b"k", b"payload");
        let view = cache.get(b"k").unwrap();

        assert!(matches!(cache.delete(b"k", 0), DeleteOutcome::Deleted { .. }));
        // The reply can still read the bytes it pinned.
        assert_eq!(view.value_vec(), b"payload");
        assert_eq!(get_value(&cache, b"k"), None);

        cache.release(view.id);
        check_invariants(&cache);
    }

    #[test]
    fn test_key_and_value_boundaries() {
        let cache = small_cache();
        let key = vec![b'k'; KEY_MAX_LENGTH];
        assert!(matches!(set(&cache, &key, b"v"), StoreOutcome::Stored { .. }));

        // Largest storable value for a one-byte key: fill the largest
        // class exactly, then push one byte past it.
        let mut vlen = PAGE;
        while ITEM_HEADER_SIZE + 1 + suffix_len(0, vlen) + vlen > PAGE {
            vlen -= 1;
        }
        assert!(cache.alloc(b"k", 0, 0, vlen).is_ok());
        assert_eq!(cache.alloc(b"k", 0, 0, vlen + 1).err(), Some(AllocError::TooLarge));
    }

    #[test]
    fn test_hash_expansion_preserves_lookups() {
        let cache = cache_with(CacheConfig {
            mem_limit: 1024 * 1024,
            page_size: 64 * 1024,
            hashpower: 2,
            ..CacheConfig::default()
        });

        for i in 0..64 {
            let key = format!("key-{}", i);
            set(&cache, key.as_bytes(), format!("v{}", i).as_bytes());
        }
        assert!(cache.lock().expanding, "load factor should trigger expansion");

        // Lookups must work mid-migration.
        {
            let mut inner = cache.lock();
            inner.migrate_bucket();
            inner.migrate_bucket();
        }
        for i in 0..64 {
            let key = format!("key-{}", i);
            assert_eq!(get_value(&cache, key.as_bytes()).unwrap(), format!("v{}", i).as_bytes());
        }

        cache.run_pending_rehash();
        assert!(!cache.lock().expanding);
        for i in 0..64 {
            let key = format!("key-{}", i);
            assert_eq!(get_value(&cache, key.as_bytes()).unwrap(), format!("v{}", i).as_bytes());
        }
        check_invariants(&cache);
    }

    #[test]
    fn test_cachedump_lists_class_members() {
        let cache = small_cache();
        set(&cache, b"alpha", b"12345");
        let clsid = cache.get(b"alpha").map(|v| {
            cache.release(v.id);
            v.clsid
        });

        let dump = cache.cachedump(u64::from(clsid.unwrap()), 10).unwrap();
        let text = String::from_utf8_lossy(&dump);
        assert!(text.starts_with("ITEM alpha [5 b;"));
        assert!(text.ends_with("END\r\n"));

        assert!(cache.cachedump(0, 10).is_none());
    }
}
