//! Component C: the scheduler. Two interchangeable policies share one ready
//! list and one context-switch primitive:
//!
//! - Strict priority scheduling with donation (default): always run the
//!   highest-priority ready thread; ties broken FIFO.
//! - MLFQ (`-o mlfqs`): per-thread priority is recomputed from `recent_cpu`
//!   and `nice` every four ticks, and `recent_cpu`/`load_avg` decay once a
//!   second, all in 17.14 fixed point (§4.1).
//!
//! The context switch itself (`switch_to`/`switch_finish_hook`) is carried
//! over from the donor crate's scheduler almost unchanged: it is hardware
//! plumbing the policy above doesn't touch.

use core::{
    mem::offset_of,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
};

use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::{instructions::interrupts, VirtAddr};

use crate::{debug_println, fixed_point::Fixed, CPUS};

use super::{Context, Thread, ThreadStatus, Tid, PRI_DEFAULT, PRI_MAX, PRI_MIN, TIME_SLICE};

/// Ticks per second, matching the LAPIC timer's configured rate (§6).
const TIMER_HZ: u64 = 100;

static READY: OnceCell<Mutex<Vec<Arc<Mutex<Thread>>>>> = OnceCell::uninit();
/// Every thread ever spawned, for MLFQ's whole-system recompute pass.
/// Entries for threads that have since exited are pruned lazily.
static ALL_THREADS: OnceCell<Mutex<Vec<Weak<Mutex<Thread>>>>> = OnceCell::uninit();

static MLFQS: AtomicBool = AtomicBool::new(false);
static TICKS: AtomicU64 = AtomicU64::new(0);
/// System load average, 17.14 fixed point, stored as its raw bit pattern so
/// it can live in an atomic.
static LOAD_AVG_BITS: AtomicI64 = AtomicI64::new(0);

pub fn init(mlfqs: bool) {
    READY
        .try_init_once(|| Mutex::new(Vec::new()))
        .expect("scheduler::init should only be called once");
    ALL_THREADS
        .try_init_once(|| Mutex::new(Vec::new()))
        .expect("scheduler::init should only be called once");
    MLFQS.store(mlfqs, Ordering::Relaxed);
}

pub fn mlfqs_enabled() -> bool {
    MLFQS.load(Ordering::Relaxed)
}

fn load_avg() -> Fixed {
    Fixed::from_bits(LOAD_AVG_BITS.load(Ordering::Relaxed))
}

fn set_load_avg(v: Fixed) {
    LOAD_AVG_BITS.store(v.to_bits(), Ordering::Relaxed);
}

pub fn load_avg_x100() -> i64 {
    load_avg().mul_int(100).to_int_round()
}

/// Runs `f` with interrupts disabled, restoring the prior interrupt flag
/// state afterwards. All ready-list and thread-state mutation happens
/// inside one of these so a timer tick can never interleave with it.
pub fn without_interrupts<F: FnOnce() -> R, R>(f: F) -> R {
    interrupts::without_interrupts(f)
}

/// The thread presently assigned to this CPU.
pub fn current_thread() -> Arc<Mutex<Thread>> {
    CPUS.get()
        .unwrap()
        .get_cpu()
        .current_thread
        .clone()
        .expect("current_thread called before any thread was scheduled")
}

fn register(thread: &Arc<Mutex<Thread>>) {
    ALL_THREADS.get().unwrap().lock().push(Arc::downgrade(thread));
}

/// Wraps a freshly built thread, registers it for MLFQ bookkeeping and
/// places it on the ready list.
pub fn spawn(thread: Thread) -> Arc<Mutex<Thread>> {
    let arc = Arc::new(Mutex::new(thread));
    register(&arc);
    enqueue(arc.clone());
    arc
}

/// Places an already-constructed thread on the ready list. Used both for
/// freshly spawned threads and for threads waking from a block.
pub fn enqueue(thread: Arc<Mutex<Thread>>) {
    thread.lock().status = ThreadStatus::Ready;
    READY.get().expect("scheduler::init should have been called").lock().push(thread);
}

/// Marks the calling thread `Blocked` and yields the CPU. The thread stays
/// off every list; whatever woke it (a semaphore waiter entry, a sleep
/// queue) is responsible for calling [`unblock`] later.
pub fn block() {
    {
        let me = current_thread();
        me.lock().status = ThreadStatus::Blocked;
    }
    yield_execution();
}

/// Moves a blocked thread back onto the ready list.
pub fn unblock(thread: Arc<Mutex<Thread>>) {
    without_interrupts(|| {
        enqueue(thread);
    });
    maybe_preempt();
}

/// If some ready thread now outranks the one currently running, yields
/// immediately instead of waiting for the next timer tick. Called after
/// priority donation and after `set_priority` lowers the caller.
pub fn maybe_preempt() {
    let should_yield = without_interrupts(|| {
        let cpu = CPUS.get().unwrap().get_cpu();
        let Some(current) = cpu.current_thread.as_ref() else {
            return false;
        };
        let current_priority = current.lock().priority;
        let ready = READY.get().unwrap().lock();
        ready.iter().any(|t| t.lock().priority > current_priority)
    });
    if should_yield {
        yield_and_continue();
    }
}

/// Donation recomputation found the named thread might now outrank the
/// thread running on some CPU; since this crate runs a single CPU, that
/// just means "check for preemption".
pub fn resort_ready_if_present(_tid: Tid) {
    maybe_preempt();
}

/// Pops the ready thread that should run next: highest priority, FIFO
/// among ties. Falls back to the idle thread if the ready list is empty,
/// since idle is always ready-able (§2 Supplement).
fn next_to_run(cpu: &mut crate::cpu::PerCpu) -> Arc<Mutex<Thread>> {
    let mut ready = READY.get().unwrap().lock();
    if ready.is_empty() {
        return cpu.idle_thread.clone();
    }
    let mut best = 0;
    let mut best_priority = ready[0].lock().priority;
    for (i, t) in ready.iter().enumerate().skip(1) {
        let p = t.lock().priority;
        if p > best_priority {
            best = i;
            best_priority = p;
        }
    }
    ready.remove(best)
}

/// Yields to the scheduler, re-enqueueing the current thread if it is
/// still runnable (used for a voluntary yield or an expired time slice, as
/// opposed to [`block`]).
pub fn yield_and_continue() {
    without_interrupts(|| {
        let cpu = CPUS.get().unwrap().get_cpu();
        if let Some(thread) = cpu.current_thread.as_ref() {
            if thread.lock().status != ThreadStatus::Dying {
                enqueue(thread.clone());
            }
        }
    });
    yield_execution();
}

/// Performs the actual context switch to whichever thread `next_to_run`
/// selects. Ported near-verbatim from the donor crate's `yield_execution`.
pub fn yield_execution() {
    interrupts::disable();

    let cpu = CPUS.get().unwrap().get_cpu();
    let next_thread = next_to_run(cpu);

    let current_thread = cpu.current_thread.as_mut();

    let prev: &mut Context = match current_thread {
        None => &mut Context::new(),
        Some(thread) => {
            if Arc::ptr_eq(thread, &next_thread) {
                thread.lock().status = ThreadStatus::Running;
                interrupts::enable();
                return;
            }
            let mut guard = thread.lock();
            guard.assert_alive();
            if guard.status == ThreadStatus::Running {
                guard.status = ThreadStatus::Ready;
                enqueue(thread.clone());
            }
            // SAFETY: `switch_to` releases this lock via `switch_finish_hook`
            // once the switch has completed on the new stack.
            unsafe { &mut *(&mut guard.context as *mut Context) }
        }
    };

    next_thread.lock().status = ThreadStatus::Running;
    let next = { next_thread.lock().context.clone() };

    cpu.next_thread = Some(next_thread);

    unsafe {
        switch_to(prev, &next);
    }
}

/// Ported from the donor crate's Redox-derived switch primitive.
/// `next`'s context is a read-only snapshot, sidestepping its lock for
/// the duration of the switch.
#[unsafe(naked)]
unsafe extern "sysv64" fn switch_to(_prev: &mut Context, _next: &Context) {
    core::arch::naked_asm!(
        concat!(
            "
            mov [rdi + {off_rbx}], rbx
            mov rbx, [rsi + {off_rbx}]

            mov [rdi + {off_r12}], r12
            mov r12, [rsi + {off_r12}]

            mov [rdi + {off_r13}], r13
            mov r13, [rsi + {off_r13}]

            mov [rdi + {off_r14}], r14
            mov r14, [rsi + {off_r14}]

            mov [rdi + {off_r15}], r15
            mov r15, [rsi + {off_r15}]

            mov [rdi + {off_rbp}], rbp
            mov rbp, [rsi + {off_rbp}]

            mov [rdi + {off_rsp}], rsp
            mov rsp, [rsi + {off_rsp}]

            pushfq
            pop QWORD PTR [rdi + {off_rflags}]

            push QWORD PTR [rsi + {off_rflags}]
            popfq

            jmp {switch_hook}
            "
        ),
        off_rflags = const(offset_of!(Context, rflags)),
        off_rbx = const(offset_of!(Context, rbx)),
        off_r12 = const(offset_of!(Context, r12)),
        off_r13 = const(offset_of!(Context, r13)),
        off_r14 = const(offset_of!(Context, r14)),
        off_r15 = const(offset_of!(Context, r15)),
        off_rbp = const(offset_of!(Context, rbp)),
        off_rsp = const(offset_of!(Context, rsp)),
        switch_hook = sym switch_finish_hook,
    );
}

unsafe extern "sysv64" fn switch_finish_hook() {
    let cpu = CPUS.get().unwrap().get_cpu();
    if let Some(thread) = cpu.current_thread.as_ref() {
        unsafe {
            thread.force_unlock();
        }
    }

    cpu.current_thread = cpu.next_thread.take();

    unsafe {
        cpu.set_ist(VirtAddr::new(cpu.current_thread.clone().unwrap().lock().context.rsp));
    }
}

/// Timer IRQ entry point. Bumps accounting, runs the MLFQ recompute
/// schedule, and preempts the running thread once its slice is spent.
pub fn tick() {
    let tick = TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    let should_yield = without_interrupts(|| {
        let cpu = CPUS.get().unwrap().get_cpu();
        let Some(current) = cpu.current_thread.clone() else {
            return false;
        };

        if mlfqs_enabled() {
            let is_idle = Arc::ptr_eq(&current, &cpu.idle_thread);
            if !is_idle {
                let mut c = current.lock();
                c.recent_cpu = c.recent_cpu.add_int(1);
            }

            if tick % TIMER_HZ == 0 {
                recompute_load_avg();
                recompute_all_recent_cpu();
            }
            if tick % 4 == 0 {
                recompute_all_priorities();
            }
        }

        let mut c = current.lock();
        c.ticks_used += 1;
        let expired = c.ticks_used >= TIME_SLICE;
        if expired {
            c.ticks_used = 0;
        }
        expired
    });

    if should_yield {
        debug_println!(".");
        yield_and_continue();
    }
}

fn ready_thread_count() -> i64 {
    let cpu = CPUS.get().unwrap().get_cpu();
    let running = match &cpu.current_thread {
        Some(t) if !Arc::ptr_eq(t, &cpu.idle_thread) => 1,
        _ => 0,
    };
    READY.get().unwrap().lock().len() as i64 + running
}

/// `load_avg = (59/60) * load_avg + (1/60) * ready_threads`
fn recompute_load_avg() {
    let ready = Fixed::from_int(ready_thread_count());
    let coeff = Fixed::from_int(59).div_int(60);
    let next = coeff.mul(load_avg()).add(Fixed::from_int(1).div_int(60).mul(ready));
    set_load_avg(next);
}

/// `recent_cpu = (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice`, for
/// every thread in the system, not just ready ones.
fn recompute_all_recent_cpu() {
    let two_load_avg = load_avg().mul_int(2);
    let coeff = two_load_avg.div(two_load_avg.add_int(1));
    for_each_live_thread(|t| {
        t.recent_cpu = coeff.mul(t.recent_cpu).add_int(t.nice);
    });
}

/// `priority = PRI_MAX - (recent_cpu/4) - (nice*2)`, clamped to
/// `[PRI_MIN, PRI_MAX]`.
fn recompute_all_priorities() {
    for_each_live_thread(|t| {
        let computed = Fixed::from_int(PRI_MAX as i64)
            .sub(t.recent_cpu.div_int(4))
            .sub_int(t.nice * 2)
            .to_int_trunc();
        t.priority = computed.clamp(PRI_MIN as i64, PRI_MAX as i64) as u8;
    });
    maybe_preempt();
}

fn for_each_live_thread(mut f: impl FnMut(&mut Thread)) {
    let mut threads = ALL_THREADS.get().unwrap().lock();
    threads.retain(|weak| {
        if let Some(t) = weak.upgrade() {
            f(&mut t.lock());
            true
        } else {
            false
        }
    });
}

pub fn set_nice(nice: i64) {
    let me = current_thread();
    without_interrupts(|| {
        let mut m = me.lock();
        m.nice = nice.clamp(-20, 20);
        if mlfqs_enabled() {
            let computed = Fixed::from_int(PRI_MAX as i64)
                .sub(m.recent_cpu.div_int(4))
                .sub_int(m.nice * 2)
                .to_int_trunc();
            m.priority = computed.clamp(PRI_MIN as i64, PRI_MAX as i64) as u8;
        }
    });
    maybe_preempt();
}

pub fn get_nice() -> i64 {
    current_thread().lock().nice
}

pub fn get_recent_cpu_x100() -> i64 {
    current_thread().lock().recent_cpu.mul_int(100).to_int_round()
}

pub fn priority_of(tid: Tid) -> Option<u8> {
    ALL_THREADS
        .get()
        .unwrap()
        .lock()
        .iter()
        .filter_map(|w| w.upgrade())
        .find(|t| t.lock().tid == tid)
        .map(|t| t.lock().priority)
}

pub fn default_priority() -> u8 {
    PRI_DEFAULT
}
