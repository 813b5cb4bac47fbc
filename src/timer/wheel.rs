//! # Hierarchical Timing Wheel
//!
//! Five levels with `{256, 64, 64, 64, 64}` slots. Level 0 has 1 ms resolution;
//! each higher level covers its predecessor's full revolution per slot, so the
//! largest representable delay is `256 * 64^4` ms.
//!
//! Nodes store their absolute expiry tick. When level 0 wraps, the current slot
//! of the next level is emptied and its nodes are re-placed at finer resolution.
//!
//! The wheel itself never runs callbacks: [`TimingWheel::tick`] hands back what
//! expired and the caller decides where it runs, then reports the result with
//! [`TimingWheel::finish`]. Between the two the id stays reserved, so a cancel
//! issued while the callback runs still prevents the re-arm.
//! [`TimingWheel::advance`] is the inline variant used by tests and simple drivers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub const WHEEL_COUNT: usize = 5;
pub const SLOTS_PER_WHEEL: [usize; WHEEL_COUNT] = [256, 64, 64, 64, 64];
pub const SHIFT_PER_WHEEL: [u32; WHEEL_COUNT] = [8, 6, 6, 6, 6];

/// Largest delay the wheel can hold, in ticks
pub const MAX_DELAY: u64 = (1 << 32) - 1;

/// Timer body. A positive return value re-arms the timer with that delay.
pub type TimerCallback = Arc<dyn Fn() -> u32 + Send + Sync>;

struct TimerNode {
    expire: u64,
    callback: Option<TimerCallback>,
}

/// A timer that reached its expiry tick
pub struct FiredTimer {
    pub id: u32,
    callback: TimerCallback,
}

impl FiredTimer {
    /// Run the timer body and return the requested re-arm delay
    pub fn run(&self) -> u32 {
        (self.callback)()
    }

    pub fn callback(&self) -> TimerCallback {
        Arc::clone(&self.callback)
    }
}

impl fmt::Debug for FiredTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiredTimer").field("id", &self.id).finish()
    }
}

pub struct TimingWheel {
    /// Next tick to be processed
    next: u64,
    levels: Vec<Vec<Vec<u32>>>,
    nodes: HashMap<u32, TimerNode>,
    /// Fired timers whose callback has not reported back yet
    running: HashSet<u32>,
    last_id: u32,
}

impl TimingWheel {
    pub fn new() -> Self {
        Self {
            next: 0,
            levels: SLOTS_PER_WHEEL
                .iter()
                .map(|&slots| vec![Vec::new(); slots])
                .collect(),
            nodes: HashMap::new(),
            running: HashSet::new(),
            last_id: 0,
        }
    }

    /// Ticks processed so far
    pub fn now(&self) -> u64 {
        self.next
    }

    /// Timers that will still run
    pub fn pending(&self) -> usize {
        self.nodes.values().filter(|n| n.callback.is_some()).count()
    }

    /// Schedule `callback` to run after `delay_ms` ticks.
    ///
    /// Returns `None` for a zero delay, otherwise the id used for [`cancel`](Self::cancel).
    pub fn set_timeout<F>(&mut self, delay_ms: u32, callback: F) -> Option<u32>
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        self.set_timeout_arc(delay_ms, Arc::new(callback))
    }

    pub fn set_timeout_arc(&mut self, delay_ms: u32, callback: TimerCallback) -> Option<u32> {
        if delay_ms == 0 {
            return None;
        }
        let id = self.next_id();
        self.insert(id, delay_ms, callback);
        Some(id)
    }

    /// Report that a fired timer's callback returned `delay_ms`.
    ///
    /// A positive delay re-arms the timer under the same id, unless it was
    /// cancelled while the callback ran.
    pub fn finish(&mut self, id: u32, delay_ms: u32, callback: TimerCallback) {
        if !self.running.remove(&id) || delay_ms == 0 {
            return;
        }
        self.insert(id, delay_ms, callback);
    }

    /// Stop a timer from running again.
    ///
    /// A pending node stays in its slot and is dropped when that slot is
    /// visited. A timer whose callback is running is not re-armed.
    pub fn cancel(&mut self, id: u32) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => node.callback.take().is_some(),
            None => self.running.remove(&id),
        }
    }

    /// Process one tick and return the timers that expired on it
    pub fn tick(&mut self) -> Vec<FiredTimer> {
        let index = (self.next & 0xff) as usize;
        if index == 0 {
            for level in 1..WHEEL_COUNT {
                let slot = self.slot_index(level, self.next);
                self.cascade(level, slot);
                if slot != 0 {
                    break;
                }
            }
        }
        self.next += 1;

        let ids = std::mem::take(&mut self.levels[0][index]);
        let mut fired = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.nodes.remove(&id) {
                if let Some(callback) = node.callback {
                    self.running.insert(id);
                    fired.push(FiredTimer { id, callback });
                }
            }
        }
        fired
    }

    /// Process `ticks` ticks, running expired callbacks inline.
    ///
    /// Returns how many callbacks ran.
    pub fn advance(&mut self, ticks: u64) -> usize {
        let mut ran = 0;
        for _ in 0..ticks {
            for timer in self.tick() {
                ran += 1;
                let delay = timer.run();
                self.finish(timer.id, delay, timer.callback);
            }
        }
        ran
    }

    fn next_id(&mut self) -> u32 {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            let id = self.last_id;
            if id != 0 && !self.nodes.contains_key(&id) && !self.running.contains(&id) {
                return self.last_id;
            }
        }
    }

    fn insert(&mut self, id: u32, delay_ms: u32, callback: TimerCallback) {
        // Firing on tick `next + delay - 1` means `delay` ticks from now
        let expire = self.next + delay_ms as u64 - 1;
        self.nodes.insert(
            id,
            TimerNode {
                expire,
                callback: Some(callback),
            },
        );
        self.place(id, expire);
    }

    fn slot_index(&self, level: usize, at: u64) -> usize {
        let shift: u32 = SHIFT_PER_WHEEL[..level].iter().sum();
        ((at >> shift) as usize) & (SLOTS_PER_WHEEL[level] - 1)
    }

    fn place(&mut self, id: u32, expire: u64) {
        let expire = expire.max(self.next);
        let diff = (expire - self.next).min(MAX_DELAY);
        let expire = self.next + diff;

        let mut level = 0;
        let mut bound: u64 = SLOTS_PER_WHEEL[0] as u64;
        while level + 1 < WHEEL_COUNT && diff >= bound {
            level += 1;
            bound <<= SHIFT_PER_WHEEL[level];
        }
        let slot = self.slot_index(level, expire);
        self.levels[level][slot].push(id);
    }

    fn cascade(&mut self, level: usize, slot: usize) {
        let ids = std::mem::take(&mut self.levels[level][slot]);
        for id in ids {
            match self.nodes.get(&id) {
                Some(node) if node.callback.is_some() => {
                    let expire = node.expire;
                    self.place(id, expire);
                }
                Some(_) => {
                    self.nodes.remove(&id);
                }
                None => {}
            }
        }
    }
}

impl Default for TimingWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimingWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimingWheel")
            .field("now", &self.next)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
