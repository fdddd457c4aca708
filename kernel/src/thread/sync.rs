//! Synchronisation primitives (component E): semaphore, lock with priority
//! donation, condition variable.

use alloc::{sync::Arc, sync::Weak, vec::Vec};
use spin::Mutex;

use super::{
    scheduler::{self, current_thread},
    Thread,
};

/// Donation chains are followed at most this many locks deep (§4.1).
const MAX_DONATION_DEPTH: u32 = 8;

/// Integer-count semaphore with FIFO-by-insertion waiters, woken
/// highest-priority-first.
pub struct Semaphore {
    inner: Mutex<SemaphoreInner>,
}

struct SemaphoreInner {
    count: u32,
    waiters: Vec<Arc<Mutex<Thread>>>,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Semaphore {
            inner: Mutex::new(SemaphoreInner {
                count,
                waiters: Vec::new(),
            }),
        }
    }

    /// Blocks the caller while the count is zero, then decrements it.
    pub fn down(&self) {
        loop {
            let mut inner = scheduler::without_interrupts(|| self.inner.lock());
            if inner.count > 0 {
                inner.count -= 1;
                return;
            }
            let me = current_thread();
            inner.waiters.push(me.clone());
            drop(inner);
            // Not holding `inner` across the block: another CPU (were there
            // one) or interrupt handler must be able to push onto / read the
            // waiter list independently of this thread's suspension.
            scheduler::block();
        }
    }

    /// Increments the count and wakes the highest-priority waiter, if any.
    /// Waiters are re-sorted first since their priority may have changed
    /// under donation since they were enqueued.
    pub fn up(&self) {
        let woken = scheduler::without_interrupts(|| {
            let mut inner = self.inner.lock();
            inner.count += 1;
            if inner.waiters.is_empty() {
                return None;
            }
            inner.waiters.sort_by(|a, b| b.lock().priority.cmp(&a.lock().priority));
            Some(inner.waiters.remove(0))
        });
        if let Some(thread) = woken {
            scheduler::unblock(thread);
        }
    }

    fn highest_waiter_priority(&self) -> Option<u8> {
        self.inner.lock().waiters.iter().map(|t| t.lock().priority).max()
    }
}

/// Binary semaphore plus an owner pointer and donor bookkeeping (§4.3).
///
/// Deliberately *not* wrapped in its own outer `Mutex<Lock>`: `holder` has
/// its own short-lived inner lock so `acquire`'s eventual `sema.down()` can
/// block without holding anything that `release` on another thread would
/// need.
pub struct Lock {
    sema: Semaphore,
    holder: Mutex<Option<Arc<Mutex<Thread>>>>,
}

impl Lock {
    pub fn new() -> Arc<Lock> {
        Arc::new(Lock {
            sema: Semaphore::new(1),
            holder: Mutex::new(None),
        })
    }

    pub fn holder(&self) -> Option<Arc<Mutex<Thread>>> {
        self.holder.lock().clone()
    }
}

/// Acquires `lock`, donating the caller's priority up the chain of lock
/// holders if the immediate holder's priority is lower.
pub fn acquire(lock: &Arc<Lock>) {
    let me = current_thread();

    scheduler::without_interrupts(|| {
        if let Some(holder) = lock.holder() {
            me.lock().waiting_on_lock = Some(Arc::downgrade(lock));
            let my_priority = me.lock().priority;
            donate_priority(&holder, my_priority, MAX_DONATION_DEPTH);
        }
    });

    lock.sema.down();

    scheduler::without_interrupts(|| {
        me.lock().waiting_on_lock = None;
        *lock.holder.lock() = Some(me.clone());
        me.lock().held_locks.push(Arc::downgrade(lock));
    });
}

/// Walks the "waiting on" chain, bumping each holder's effective priority
/// in turn. Bounded to `depth` hops so a malformed chain cannot spin
/// forever.
fn donate_priority(holder: &Arc<Mutex<Thread>>, priority: u8, depth: u32) {
    if depth == 0 {
        return;
    }
    let next = {
        let mut h = holder.lock();
        if h.priority >= priority {
            return;
        }
        h.priority = priority;
        h.waiting_on_lock.clone()
    };
    scheduler::resort_ready_if_present(holder.lock().tid);

    if let Some(next_lock) = next.and_then(|w| w.upgrade()) {
        if let Some(next_holder) = next_lock.holder() {
            donate_priority(&next_holder, priority, depth - 1);
        }
    }
}

/// Releases `lock`. The holder's effective priority drops to the maximum of
/// its base priority and any donations still owed through locks it still
/// holds.
pub fn release(lock: &Arc<Lock>) {
    let me = current_thread();

    scheduler::without_interrupts(|| {
        *lock.holder.lock() = None;

        let mut m = me.lock();
        m.held_locks.retain(|w| match w.upgrade() {
            Some(l) => !Arc::ptr_eq(&l, lock),
            None => false,
        });
        refresh_priority(&mut m);
    });

    lock.sema.up();
}

/// Recomputes `t.priority = max(t.base_priority, donations still owed)`.
fn refresh_priority(t: &mut Thread) {
    let mut highest = t.base_priority;
    for weak_lock in &t.held_locks {
        if let Some(l) = weak_lock.upgrade() {
            if let Some(p) = l.sema.highest_waiter_priority() {
                highest = highest.max(p);
            }
        }
    }
    t.priority = highest;
    scheduler::resort_ready_if_present(t.tid);
}

/// Sets the caller's base priority. Effective priority becomes
/// `max(base, donations)`; if this lowers the caller below the highest
/// ready thread, it yields immediately (pintos' `thread_set_priority`).
pub fn set_priority(new_base: u8) {
    let me = current_thread();
    scheduler::without_interrupts(|| {
        let mut m = me.lock();
        m.base_priority = new_base;
        if m.held_locks.is_empty() {
            m.priority = new_base;
        } else {
            drop(m);
            refresh_priority(&mut me.lock());
        }
    });
    scheduler::maybe_preempt();
}

pub fn get_priority() -> u8 {
    current_thread().lock().priority
}

/// FIFO-by-insertion waiter list of per-wait semaphores, as in pintos'
/// `cond_wait` (each waiter gets its own private binary semaphore so
/// `signal` can wake exactly one).
pub struct Condvar {
    waiters: Mutex<Vec<Arc<Semaphore>>>,
}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Atomically releases `lock`, waits to be signalled, then re-acquires
    /// `lock`.
    pub fn wait(&self, lock: &Arc<Lock>) {
        let my_sema = Arc::new(Semaphore::new(0));
        self.waiters.lock().push(my_sema.clone());

        release(lock);
        my_sema.down();
        acquire(lock);
    }

    pub fn signal(&self) {
        let woken = self.waiters.lock().pop();
        if let Some(sema) = woken {
            sema.up();
        }
    }

    pub fn broadcast(&self) {
        let mut waiters = self.waiters.lock();
        for sema in waiters.drain(..) {
            sema.up();
        }
    }
}
