//! Eviction Clock and Policy
//!
//! Every stored value carries 24 bits of eviction metadata whose meaning
//! depends on a process-wide policy flag:
//!
//! - **LRU mode**: the metadata is a coarse clock reading in seconds
//!   (wrapping at 24 bits). `OBJECT IDLETIME` derives idle seconds from it.
//! - **LFU mode**: the high 16 bits hold a minute-granularity timestamp and
//!   the low 8 bits a logarithmic access counter. `OBJECT FREQ` reports the
//!   counter after decaying it for elapsed time, so keys that went cold
//!   report low values even if nothing read them since.
//!
//! The policy is read unlocked on every object construction. Switching it
//! at runtime is treated as a rare, pause-the-world event: metadata already
//! stamped under the old policy keeps its bits and yields meaningless
//! readings until the value is touched again.

use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Initial value of the LFU logarithmic counter for new objects.
///
/// Starting above zero gives new keys a grace period before eviction
/// considers them cold.
pub const LFU_INIT: u8 = 5;

/// The LRU clock wraps at 24 bits.
pub const LRU_CLOCK_MAX: u32 = (1 << 24) - 1;

/// Minutes between halvings of the LFU counter.
const LFU_DECAY_MINUTES: u64 = 1;

/// Probability dampening factor for LFU counter increments.
const LFU_LOG_FACTOR: u64 = 10;

/// Process-wide memory policy. Determines how the 24-bit metadata field of
/// every value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EvictionPolicy {
    /// Never evict; metadata uses the LRU clock.
    NoEviction = 0,
    /// Evict by recency; metadata is the LRU clock.
    AllKeysLru = 1,
    /// Evict by frequency; metadata is (minutes << 8) | counter.
    AllKeysLfu = 2,
}

impl EvictionPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "noeviction" => Some(Self::NoEviction),
            "allkeys-lru" => Some(Self::AllKeysLru),
            "allkeys-lfu" => Some(Self::AllKeysLfu),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoEviction => "noeviction",
            Self::AllKeysLru => "allkeys-lru",
            Self::AllKeysLfu => "allkeys-lfu",
        }
    }
}

static POLICY: AtomicU8 = AtomicU8::new(EvictionPolicy::NoEviction as u8);
static MAXMEMORY: AtomicUsize = AtomicUsize::new(0);

/// Returns the current process-wide eviction policy.
pub fn policy() -> EvictionPolicy {
    match POLICY.load(Ordering::Relaxed) {
        1 => EvictionPolicy::AllKeysLru,
        2 => EvictionPolicy::AllKeysLfu,
        _ => EvictionPolicy::NoEviction,
    }
}

/// Installs a new eviction policy. Existing metadata bits are left as-is.
pub fn set_policy(p: EvictionPolicy) {
    POLICY.store(p as u8, Ordering::Relaxed);
}

pub fn maxmemory() -> usize {
    MAXMEMORY.load(Ordering::Relaxed)
}

pub fn set_maxmemory(bytes: usize) {
    MAXMEMORY.store(bytes, Ordering::Relaxed);
}

/// True when the metadata field is in LFU form.
pub fn uses_lfu() -> bool {
    policy() == EvictionPolicy::AllKeysLfu
}

/// Shared integer singletons are disabled under a memory limit with an
/// LRU/LFU policy: every value then needs a private metadata field for the
/// eviction algorithm to rank it.
pub fn shared_integers_enabled() -> bool {
    maxmemory() == 0 || policy() == EvictionPolicy::NoEviction
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current LRU clock reading: seconds, truncated to 24 bits.
pub fn lru_clock() -> u32 {
    (unix_seconds() as u32) & LRU_CLOCK_MAX
}

/// Current LFU timestamp: minutes, truncated to 16 bits.
pub fn lfu_minutes() -> u16 {
    ((unix_seconds() / 60) & 0xffff) as u16
}

/// Computes the metadata stamp for a freshly constructed value under the
/// current policy.
pub fn initial_meta() -> u32 {
    if uses_lfu() {
        ((lfu_minutes() as u32) << 8) | LFU_INIT as u32
    } else {
        lru_clock()
    }
}

/// Seconds elapsed since the LRU stamp `meta`, handling clock wrap.
pub fn idle_seconds(meta: u32) -> u64 {
    idle_seconds_at(meta, lru_clock())
}

fn idle_seconds_at(meta: u32, clock: u32) -> u64 {
    let meta = meta & LRU_CLOCK_MAX;
    if clock >= meta {
        (clock - meta) as u64
    } else {
        (clock + (LRU_CLOCK_MAX - meta)) as u64
    }
}

/// Minutes elapsed since the LFU timestamp in `meta`, handling wrap.
fn lfu_elapsed_minutes(meta: u32, now: u16) -> u64 {
    let stamp = (meta >> 8) as u16;
    if now >= stamp {
        (now - stamp) as u64
    } else {
        (now as u64) + 0x10000 - stamp as u64
    }
}

/// Returns the LFU counter of `meta` after applying time decay.
///
/// Does not modify the stored metadata; pure read used by `OBJECT FREQ`
/// and by the touch path before re-stamping.
pub fn lfu_decayed_counter(meta: u32) -> u8 {
    lfu_decayed_counter_at(meta, lfu_minutes())
}

fn lfu_decayed_counter_at(meta: u32, now: u16) -> u8 {
    let counter = (meta & 0xff) as u8;
    let periods = lfu_elapsed_minutes(meta, now) / LFU_DECAY_MINUTES;
    counter.saturating_sub(periods.min(u8::MAX as u64) as u8)
}

/// Logarithmically increments an LFU counter.
///
/// The counter saturates at 255; the probability of an increment shrinks
/// as the counter grows, so the 8-bit field can represent a wide range of
/// access frequencies.
pub fn lfu_log_incr(counter: u8) -> u8 {
    if counter == u8::MAX {
        return counter;
    }
    let base = counter.saturating_sub(LFU_INIT) as u64;
    let odds = base * LFU_LOG_FACTOR + 1;
    if next_random() % odds == 0 {
        counter + 1
    } else {
        counter
    }
}

/// Metadata value after an access under the current policy: LRU re-stamps
/// the clock, LFU decays then bumps the counter and refreshes the minutes.
pub fn touch_meta(meta: u32) -> u32 {
    if uses_lfu() {
        let counter = lfu_log_incr(lfu_decayed_counter(meta));
        ((lfu_minutes() as u32) << 8) | counter as u32
    } else {
        lru_clock()
    }
}

// xorshift state for the probabilistic LFU increment. Quality does not
// matter here, only cheapness.
static RNG_STATE: AtomicU64 = AtomicU64::new(0x9e3779b97f4a7c15);

fn next_random() -> u64 {
    let mut x = RNG_STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    RNG_STATE.store(x, Ordering::Relaxed);
    x
}

/// Serializes tests that flip the process-wide policy flag.
#[cfg(test)]
pub(crate) static TEST_POLICY_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_roundtrip() {
        assert_eq!(
            EvictionPolicy::parse("allkeys-lfu"),
            Some(EvictionPolicy::AllKeysLfu)
        );
        assert_eq!(EvictionPolicy::parse("bogus"), None);
        assert_eq!(EvictionPolicy::AllKeysLru.name(), "allkeys-lru");
    }

    #[test]
    fn test_idle_seconds_simple() {
        assert_eq!(idle_seconds_at(100, 160), 60);
        assert_eq!(idle_seconds_at(100, 100), 0);
    }

    #[test]
    fn test_idle_seconds_wraps() {
        // Stamp near the top of the 24-bit range, clock has wrapped.
        let stamp = LRU_CLOCK_MAX - 10;
        assert_eq!(idle_seconds_at(stamp, 5), 15);
    }

    #[test]
    fn test_lfu_decay_lowers_counter() {
        let now: u16 = 1000;
        let meta = ((now as u32 - 7) << 8) | 20;
        // 7 elapsed minutes with a 1-minute decay period.
        assert_eq!(lfu_decayed_counter_at(meta, now), 13);
    }

    #[test]
    fn test_lfu_decay_saturates_at_zero() {
        let now: u16 = 1000;
        let meta = ((now as u32 - 500) << 8) | 20;
        assert_eq!(lfu_decayed_counter_at(meta, now), 0);
    }

    #[test]
    fn test_lfu_counter_never_exceeds_max() {
        assert_eq!(lfu_log_incr(u8::MAX), u8::MAX);
    }

    #[test]
    fn test_initial_meta_has_init_counter_under_lfu() {
        let _guard = TEST_POLICY_LOCK.lock().unwrap();
        set_policy(EvictionPolicy::AllKeysLfu);
        let meta = initial_meta();
        assert_eq!((meta & 0xff) as u8, LFU_INIT);
        set_policy(EvictionPolicy::NoEviction);
    }
}
