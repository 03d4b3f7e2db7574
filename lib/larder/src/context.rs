use crate::clock::Clock;
use crate::net::shared::{SuffixPool, MAX_VERBOSITY_LEVEL};
use crate::settings::Settings;
use crate::stats::StatsHub;
use crate::store::Cache;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Everything the dispatcher, workers and command handlers share: the
/// cache, the clock behind it, the statistics surfaces, the suffix scratch
/// pool and the runtime-adjustable verbosity.
pub struct Shared {
    pub cache: Arc<Cache>,
    pub settings: Settings,
    pub hub: StatsHub,
    pub suffixes: SuffixPool,
    verbosity: AtomicU8,
}

impl Shared {
    pub fn new(cache: Arc<Cache>, settings: Settings) -> Shared {
        let workers = settings.num_threads;
        let verbose = settings.verbose;
        Shared {
            cache,
            settings,
            hub: StatsHub::new(workers),
            suffixes: SuffixPool::new(),
            verbosity: AtomicU8::new(verbose),
        }
    }

    #[inline]
    pub fn clock(&self) -> &Arc<Clock> {
        self.cache.clock()
    }

    #[inline]
    pub fn verbosity(&self) -> u8 {
        self.verbosity.load(Ordering::Relaxed)
    }

    /// Clamps and installs a new verbosity level (the `verbosity` command).
    pub fn set_verbosity(&self, level: u8) {
        self.verbosity
            .store(level.min(MAX_VERBOSITY_LEVEL), Ordering::Relaxed);
    }
}
