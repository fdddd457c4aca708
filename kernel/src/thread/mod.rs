//! Thread descriptors, the ready/block/destruction lists, and the TID
//! allocator (component B in the design). The scheduler itself (component C)
//! lives in [`scheduler`]; synchronisation primitives (component E) live in
//! [`sync`].

pub mod scheduler;
pub mod sync;

use core::{
    mem::offset_of,
    sync::atomic::{AtomicU32, Ordering},
};

use alloc::{borrow::ToOwned, string::String, sync::Weak, vec, vec::Vec};
use spin::Mutex;

use crate::{fixed_point::Fixed, process::Task};

pub type Tid = u32;

const THREAD_MAGIC: u32 = 0xcd6abf4b;

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

pub fn alloc_tid() -> Tid {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Redox-derived callee-saved register save area. The rest of the machine
/// state is pushed to the kernel stack on function call, per the System V
/// ABI.
#[derive(Default, Clone, Debug)]
#[repr(C)]
pub struct Context {
    pub rflags: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }
}

pub(crate) const OFF_RFLAGS: usize = offset_of!(Context, rflags);
pub(crate) const OFF_RBX: usize = offset_of!(Context, rbx);
pub(crate) const OFF_R12: usize = offset_of!(Context, r12);
pub(crate) const OFF_R13: usize = offset_of!(Context, r13);
pub(crate) const OFF_R14: usize = offset_of!(Context, r14);
pub(crate) const OFF_R15: usize = offset_of!(Context, r15);
pub(crate) const OFF_RBP: usize = offset_of!(Context, rbp);
pub(crate) const OFF_RSP: usize = offset_of!(Context, rsp);

/// Base priority bounds (pintos' PRI_MIN/PRI_MAX/PRI_DEFAULT).
pub const PRI_MIN: u8 = 0;
pub const PRI_MAX: u8 = 63;
pub const PRI_DEFAULT: u8 = 31;

/// Per-tick preemption budget for the priority scheduler (§4.1).
pub const TIME_SLICE: u32 = 4;

pub struct Thread {
    pub magic: u32,
    pub tid: Tid,
    pub name: Option<String>,
    pub status: ThreadStatus,

    pub context: Context,
    /// Kernel stack, grows down; `context.rsp` always points somewhere
    /// within it.
    pub kstack: Vec<u64>,

    pub base_priority: u8,
    pub priority: u8,
    pub nice: i64,
    pub recent_cpu: Fixed,
    /// Ticks spent running since the last reschedule decision, reset on
    /// every context switch away.
    pub ticks_used: u32,

    /// Absolute tick at which a parked thread should be woken.
    pub wakeup_tick: Option<u64>,

    /// Lock this thread is currently blocked acquiring, if any. Used to
    /// chase transitive priority donation up the "waiting on" chain.
    pub waiting_on_lock: Option<Weak<sync::Lock>>,
    /// Locks currently held by this thread; priority donation is recomputed
    /// by scanning the waiters of these locks (see [`sync::Lock`]).
    pub held_locks: Vec<Weak<sync::Lock>>,

    pub process: Weak<Mutex<Task>>,
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name.clone().unwrap_or("<no name>".to_owned()))
            .field("status", &self.status)
            .field("priority", &self.priority)
            .finish()
    }
}

impl Thread {
    /// Builds a kernel thread whose first instruction is `func`. The thread
    /// starts `Blocked`; callers enqueue it once fully initialised.
    pub fn from_func(
        func: unsafe extern "sysv64" fn(),
        process: Weak<Mutex<Task>>,
        name: Option<String>,
    ) -> Thread {
        let mut thread = Thread {
            magic: THREAD_MAGIC,
            tid: alloc_tid(),
            name,
            status: ThreadStatus::Blocked,
            context: Context::new(),
            kstack: vec![0; 2 * 4096],
            base_priority: PRI_DEFAULT,
            priority: PRI_DEFAULT,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            ticks_used: 0,
            wakeup_tick: None,
            waiting_on_lock: None,
            held_locks: Vec::new(),
            process,
        };

        *thread.kstack.last_mut().unwrap() = func as u64;
        thread.context.rsp = thread.kstack.last_mut().unwrap() as *const u64 as u64;
        thread
    }

    /// Re-targets a not-yet-scheduled thread's entry point (used when
    /// `execve` replaces a still-forming thread's body, and when building a
    /// forked child's initial context).
    pub fn set_func(&mut self, func: unsafe extern "sysv64" fn()) {
        *self.kstack.last_mut().unwrap() = func as u64;
        self.context.rsp = self.kstack.last_mut().unwrap() as *const u64 as u64;
    }

    pub fn kstack_top(&self) -> u64 {
        self.kstack.last().unwrap() as *const u64 as u64
    }

    /// Panics if the stack-overflow canary has been clobbered.
    pub fn assert_alive(&self) {
        assert_eq!(self.magic, THREAD_MAGIC, "thread {} stack overflowed", self.tid);
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.upgrade().map(|p| p.lock().pid)
    }
}
