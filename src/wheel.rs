//! Hierarchical timing wheel.
//!
//! Four levels of 256 slots cover delays up to 2^32 ms at millisecond
//! resolution. Nodes live in a slab arena and are threaded into per-slot
//! doubly-linked lists by u32 index, so schedule, cancel, and unlink are all
//! O(1). `tick` walks each elapsed millisecond, cascading one bucket from
//! the next level whenever a level's index wraps, and fires due nodes in
//! insertion order.
//!
//! Handlers run outside the wheel lock. While one runs, a separate running
//! mutex is held so that a concurrent `cancel`/`release` of the firing node
//! blocks until the handler returns; the caller may then free whatever the
//! handler references. Cancelling from inside the handler's own thread does
//! not block.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use slab::Slab;

const LEVELS: usize = 4;
const SLOT_BITS: u64 = 8;
const SLOTS: usize = 1 << SLOT_BITS;
const SLOT_MASK: u64 = SLOTS as u64 - 1;
const NIL: u32 = u32::MAX;

/// Longest representable delay; anything further out is parked at the wheel
/// edge and re-cascades until its real expiry is in range.
const MAX_SPAN: u64 = u32::MAX as u64;

pub(crate) type TimerFn = Box<dyn FnMut() + Send>;

struct Node {
    expiry: u64,
    /// Re-arm interval in ms; 0 for one-shot.
    period: u64,
    cancelled: bool,
    pending: bool,
    prev: u32,
    next: u32,
    level: u8,
    slot: u16,
    handler: Option<TimerFn>,
}

impl Node {
    fn new() -> Self {
        Node {
            expiry: 0,
            period: 0,
            cancelled: false,
            pending: false,
            prev: NIL,
            next: NIL,
            level: 0,
            slot: 0,
            handler: None,
        }
    }
}

#[derive(Clone, Copy)]
struct ListHead {
    head: u32,
    tail: u32,
}

const EMPTY: ListHead = ListHead {
    head: NIL,
    tail: NIL,
};

struct WheelState {
    nodes: Slab<Node>,
    wheel: [[ListHead; SLOTS]; LEVELS],
    last_tick: u64,
    /// Number of nodes currently linked into a slot.
    live: usize,
}

pub(crate) struct TimingWheel {
    state: Mutex<WheelState>,
    /// Held for the duration of each handler invocation.
    running: Mutex<()>,
    running_node: AtomicU32,
    running_thread: Mutex<Option<ThreadId>>,
    origin: Instant,
}

impl TimingWheel {
    pub(crate) fn new() -> Self {
        TimingWheel {
            state: Mutex::new(WheelState {
                nodes: Slab::new(),
                wheel: [[EMPTY; SLOTS]; LEVELS],
                last_tick: 0,
                live: 0,
            }),
            running: Mutex::new(()),
            running_node: AtomicU32::new(NIL),
            running_thread: Mutex::new(None),
            origin: Instant::now(),
        }
    }

    /// Milliseconds since the wheel was created; the tick domain.
    pub(crate) fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Allocate an unscheduled node. The caller owns the id until `release`.
    pub(crate) fn alloc(&self) -> u32 {
        self.state.lock().nodes.insert(Node::new()) as u32
    }

    /// Schedule (or re-schedule) a node. A pending node is unlinked first,
    /// which cancels the previous scheduling. `delay_ms == 0` fires on the
    /// very next tick.
    pub(crate) fn schedule(&self, id: u32, delay_ms: u64, period_ms: u64, handler: TimerFn) {
        let now = self.now_ms();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let last_tick = state.last_tick;
        let old;
        match state.nodes.get_mut(id as usize) {
            Some(node) => {
                old = node.handler.replace(handler);
                node.cancelled = false;
                node.period = period_ms;
                node.expiry = (now + delay_ms).max(last_tick + 1).min(last_tick + MAX_SPAN);
                if node.pending {
                    Self::unlink(state, id);
                }
                Self::insert(state, id, last_tick);
            }
            None => {
                old = Some(handler);
            }
        }
        drop(guard);
        // Displaced handlers may own resources with arbitrary drop code;
        // never drop them under the wheel lock.
        drop(old);
    }

    /// Cancel a node. A pending node is unlinked and will not fire. If the
    /// node's handler is running on another thread, block until it returns.
    pub(crate) fn cancel(&self, id: u32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let handler = match state.nodes.get_mut(id as usize) {
            Some(node) => {
                node.cancelled = true;
                let was_pending = node.pending;
                let h = node.handler.take();
                if was_pending {
                    Self::unlink(state, id);
                }
                h
            }
            None => None,
        };
        drop(guard);
        self.wait_if_running(id);
        drop(handler);
    }

    /// Cancel and free a node. Blocks like `cancel` if the handler is
    /// mid-run, guaranteeing the arena slot is not touched after return.
    pub(crate) fn release(&self, id: u32) {
        self.cancel(id);
        let mut guard = self.state.lock();
        let node = if guard.nodes.contains(id as usize) {
            Some(guard.nodes.remove(id as usize))
        } else {
            None
        };
        drop(guard);
        drop(node);
    }

    fn wait_if_running(&self, id: u32) {
        if self.running_node.load(Ordering::SeqCst) != id {
            return;
        }
        if *self.running_thread.lock() == Some(thread::current().id()) {
            return;
        }
        drop(self.running.lock());
    }

    /// Advance the wheel to `now`, firing every due node. Returns the number
    /// of handlers invoked.
    pub(crate) fn tick(&self, now: u64) -> usize {
        let mut fired = 0;
        let mut due: Vec<u32> = Vec::new();
        loop {
            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                due.clear();
                while state.last_tick < now && due.is_empty() {
                    if state.live == 0 {
                        state.last_tick = now;
                        break;
                    }
                    let tk = state.last_tick + 1;
                    let idx = (tk & SLOT_MASK) as usize;
                    if idx == 0 {
                        Self::cascade(state, tk);
                    }
                    Self::detach_slot(state, 0, idx, &mut due);
                    state.last_tick = tk;
                }
                if due.is_empty() {
                    return fired;
                }
            }
            for &id in &due {
                if self.fire_one(id) {
                    fired += 1;
                }
            }
        }
    }

    /// Fire one detached node: take its handler under the wheel lock (also
    /// claiming the running guard so cancellers block), invoke it unlocked,
    /// then restore or re-arm.
    fn fire_one(&self, id: u32) -> bool {
        let mut run_guard: Option<MutexGuard<'_, ()>> = None;
        let taken = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.nodes.get_mut(id as usize) {
                // `pending` means it was re-scheduled into a future slot
                // while this batch was being fired.
                Some(node) if !node.cancelled && !node.pending => match node.handler.take() {
                    Some(h) => {
                        self.running_node.store(id, Ordering::SeqCst);
                        *self.running_thread.lock() = Some(thread::current().id());
                        run_guard = Some(self.running.lock());
                        Some((h, node.expiry, node.period))
                    }
                    None => None,
                },
                _ => None,
            }
        };
        let (mut handler, expiry, period) = match taken {
            Some(t) => t,
            None => return false,
        };

        handler();

        drop(run_guard);
        self.running_node.store(NIL, Ordering::SeqCst);
        *self.running_thread.lock() = None;

        let mut leftover = Some(handler);
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut rearm = false;
            if let Some(node) = state.nodes.get_mut(id as usize) {
                // A fresh handler means the callback (or another thread)
                // re-scheduled the node; leave that scheduling alone.
                if node.handler.is_none() && !node.cancelled && !node.pending {
                    node.handler = leftover.take();
                    if period > 0 {
                        // Re-arm from the expected expiry so repeat jitter
                        // does not accumulate.
                        node.expiry = (expiry + period).max(state.last_tick + 1);
                        rearm = true;
                    }
                }
            }
            if rearm {
                let last_tick = state.last_tick;
                Self::insert(state, id, last_tick);
            }
        }
        drop(leftover);
        true
    }

    /// Milliseconds until the next node can fire, measured from the last
    /// processed tick. Exact for level-0 residents; otherwise the distance
    /// to the next cascade boundary, after which the wheel re-evaluates.
    /// `None` when nothing is scheduled.
    pub(crate) fn next_expiry_ms(&self) -> Option<u64> {
        let state = self.state.lock();
        if state.live == 0 {
            return None;
        }
        for dist in 1..SLOTS as u64 {
            let slot = ((state.last_tick + dist) & SLOT_MASK) as usize;
            if state.wheel[0][slot].head != NIL {
                return Some(dist);
            }
        }
        Some(SLOTS as u64 - (state.last_tick & SLOT_MASK))
    }

    /// Number of scheduled (pending) nodes.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().live
    }

    fn cascade(state: &mut WheelState, tk: u64) {
        let mut moved: Vec<u32> = Vec::new();
        for level in 1..LEVELS {
            let idx = ((tk >> (SLOT_BITS * level as u64)) & SLOT_MASK) as usize;
            moved.clear();
            Self::detach_slot(state, level, idx, &mut moved);
            for &id in &moved {
                Self::insert(state, id, tk);
            }
            if idx != 0 {
                break;
            }
        }
    }

    /// Unlink every node in a slot, appending ids to `out` in list order.
    fn detach_slot(state: &mut WheelState, level: usize, idx: usize, out: &mut Vec<u32>) {
        let mut cur = state.wheel[level][idx].head;
        state.wheel[level][idx] = EMPTY;
        while cur != NIL {
            let next;
            {
                let node = &mut state.nodes[cur as usize];
                next = node.next;
                node.pending = false;
                node.prev = NIL;
                node.next = NIL;
            }
            state.live -= 1;
            out.push(cur);
            cur = next;
        }
    }

    fn insert(state: &mut WheelState, id: u32, now: u64) {
        let expiry = state.nodes[id as usize].expiry;
        let delta = expiry.saturating_sub(now);
        let (level, slot) = if delta == 0 {
            // Overdue (cascade of an already-due node): park in the current
            // slot so it fires within this tick.
            (0usize, (now & SLOT_MASK) as usize)
        } else if delta < 1 << SLOT_BITS {
            (0, (expiry & SLOT_MASK) as usize)
        } else if delta < 1 << (2 * SLOT_BITS) {
            (1, ((expiry >> SLOT_BITS) & SLOT_MASK) as usize)
        } else if delta < 1 << (3 * SLOT_BITS) {
            (2, ((expiry >> (2 * SLOT_BITS)) & SLOT_MASK) as usize)
        } else {
            let capped = expiry.min(now + MAX_SPAN);
            (3, ((capped >> (3 * SLOT_BITS)) & SLOT_MASK) as usize)
        };

        let tail = state.wheel[level][slot].tail;
        {
            let node = &mut state.nodes[id as usize];
            node.level = level as u8;
            node.slot = slot as u16;
            node.pending = true;
            node.next = NIL;
            node.prev = tail;
        }
        if tail == NIL {
            state.wheel[level][slot].head = id;
        } else {
            state.nodes[tail as usize].next = id;
        }
        state.wheel[level][slot].tail = id;
        state.live += 1;
    }

    fn unlink(state: &mut WheelState, id: u32) {
        let (prev, next, level, slot) = {
            let node = &mut state.nodes[id as usize];
            debug_assert!(node.pending);
            node.pending = false;
            (node.prev, node.next, node.level as usize, node.slot as usize)
        };
        if prev != NIL {
            state.nodes[prev as usize].next = next;
        } else {
            state.wheel[level][slot].head = next;
        }
        if next != NIL {
            state.nodes[next as usize].prev = prev;
        } else {
            state.wheel[level][slot].tail = prev;
        }
        {
            let node = &mut state.nodes[id as usize];
            node.prev = NIL;
            node.next = NIL;
        }
        state.live -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counted(counter: &Arc<AtomicUsize>) -> TimerFn {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn zero_delay_fires_on_next_tick() {
        let wheel = TimingWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = wheel.alloc();
        wheel.schedule(id, 0, 0, counted(&hits));
        wheel.tick(wheel.now_ms() + 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        wheel.release(id);
    }

    #[test]
    fn cancelled_node_never_fires() {
        let wheel = TimingWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = wheel.alloc();
        wheel.schedule(id, 5, 0, counted(&hits));
        wheel.cancel(id);
        wheel.tick(wheel.now_ms() + 1000);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        wheel.release(id);
    }

    #[test]
    fn reschedule_supersedes_previous() {
        let wheel = TimingWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = wheel.alloc();
        wheel.schedule(id, 5, 0, counted(&hits));
        wheel.schedule(id, 50_000, 0, counted(&hits));
        assert_eq!(wheel.len(), 1);
        wheel.tick(wheel.now_ms() + 1_000);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        wheel.tick(wheel.now_ms() + 60_000);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        wheel.release(id);
    }

    #[test]
    fn long_delays_cascade_down() {
        let wheel = TimingWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        // One per level: 100ms, ~70s, ~5h, ~50d.
        let delays: [u64; 4] = [100, 70_000, 18_000_000, 4_400_000_000];
        let ids: Vec<u32> = delays
            .iter()
            .map(|&d| {
                let id = wheel.alloc();
                wheel.schedule(id, d, 0, counted(&hits));
                id
            })
            .collect();
        assert_eq!(wheel.len(), 4);
        let base = wheel.now_ms();
        for (i, &d) in delays.iter().enumerate() {
            wheel.tick(base + d + 2);
            assert_eq!(hits.load(Ordering::SeqCst), i + 1, "delay {d} did not fire");
        }
        for id in ids {
            wheel.release(id);
        }
    }

    #[test]
    fn never_fires_early() {
        let wheel = TimingWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for delay in [3u64, 200, 255, 256, 257, 1000, 65_536, 100_000] {
            let id = wheel.alloc();
            wheel.schedule(id, delay, 0, counted(&hits));
            let expiry = wheel.state.lock().nodes[id as usize].expiry;
            let before = hits.load(Ordering::SeqCst);
            // One tick short of the deadline: must not fire.
            wheel.tick(expiry - 1);
            assert_eq!(hits.load(Ordering::SeqCst), before, "delay {delay} fired early");
            wheel.tick(expiry);
            assert_eq!(hits.load(Ordering::SeqCst), before + 1, "delay {delay} missing");
            wheel.release(id);
        }
    }

    #[test]
    fn same_slot_fires_in_schedule_order() {
        let wheel = TimingWheel::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let ids: Vec<u32> = (0..8)
            .map(|i| {
                let id = wheel.alloc();
                let order = order.clone();
                wheel.schedule(
                    id,
                    20,
                    0,
                    Box::new(move || {
                        order.lock().push(i);
                    }),
                );
                id
            })
            .collect();
        wheel.tick(wheel.now_ms() + 50);
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
        for id in ids {
            wheel.release(id);
        }
    }

    #[test]
    fn repeating_rearm_is_drift_free() {
        let wheel = TimingWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = wheel.alloc();
        wheel.schedule(id, 10, 10, counted(&hits));
        let first = wheel.state.lock().nodes[id as usize].expiry;
        // Jump far past several periods in one tick call: each elapsed
        // period fires once as the wheel walks the gap.
        wheel.tick(first + 45);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        wheel.release(id);
    }

    #[test]
    fn next_expiry_tracks_nearest_node() {
        let wheel = TimingWheel::new();
        assert_eq!(wheel.next_expiry_ms(), None);
        let id = wheel.alloc();
        wheel.tick(wheel.now_ms());
        wheel.schedule(id, 40, 0, Box::new(|| {}));
        let next = wheel.next_expiry_ms().unwrap();
        assert!(next <= 60, "next_expiry {next} too far for a 40ms timer");
        wheel.release(id);
        assert_eq!(wheel.next_expiry_ms(), None);
    }

    #[test]
    fn release_from_foreign_thread_waits_for_handler() {
        use std::sync::mpsc;
        let wheel = Arc::new(TimingWheel::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let id = wheel.alloc();
        wheel.schedule(
            id,
            1,
            0,
            Box::new(move || {
                entered_tx.send(()).unwrap();
                // Hold the handler until the canceller has had a chance to
                // observe it running.
                done_rx.recv().unwrap();
            }),
        );

        let w = wheel.clone();
        let ticker = thread::spawn(move || {
            w.tick(w.now_ms() + 10);
        });
        entered_rx.recv().unwrap();

        let w = wheel.clone();
        let canceller = thread::spawn(move || {
            w.release(id);
        });
        thread::sleep(std::time::Duration::from_millis(20));
        done_tx.send(()).unwrap();
        canceller.join().unwrap();
        ticker.join().unwrap();
        assert_eq!(wheel.len(), 0);
    }

    #[test]
    fn cancel_from_inside_own_handler_does_not_deadlock() {
        let wheel = Arc::new(TimingWheel::new());
        let id = wheel.alloc();
        let w = wheel.clone();
        wheel.schedule(
            id,
            1,
            10,
            Box::new(move || {
                w.cancel(id);
            }),
        );
        wheel.tick(wheel.now_ms() + 5);
        // Cancelled from its own callback: must not re-arm.
        assert_eq!(wheel.len(), 0);
        wheel.release(id);
    }
}
