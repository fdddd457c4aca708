//! Components F/H: the task table and process descriptor. Ties a kernel
//! thread to a user address space, an open-file table, and the
//! supplemental page table that backs its virtual memory.

use alloc::{
    collections::btree_map::BTreeMap,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use conquer_once::spin::OnceCell;
use spin::{Mutex, RwLock};

pub mod elf;
pub mod errno;
pub mod lifecycle;
pub mod pagetable;
pub mod syscalls;

use crate::{
    filesystem::vfs::Inode,
    thread::{sync::Semaphore, Thread},
    vm::{frame::FrameOwner, spt::SupplementalPageTable},
};

use pagetable::UserPageTable;

/// Page-cache-backed file, reference-counted so `reopen`-style sharing
/// (mmap, fork) is just another `Arc` clone.
pub type FileHandle = Arc<Inode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    Running,
    Waiting,
    Dying,
    Exited,
    Fail,
}

pub struct FileDescriptor {
    pub inode: FileHandle,
    pub offset: u64,
    pub flags: u32,
}

pub struct Task {
    pub pid: u32,
    pub name: String,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    pub exit_code: Option<i32>,
    pub status: TaskStatus,

    pub files: BTreeMap<u32, Arc<RwLock<FileDescriptor>>>,
    next_fd: u32,
    /// The loaded binary, kept write-denied for the task's lifetime.
    pub executable: Option<FileHandle>,

    pub page_table: UserPageTable,
    pub spt: SupplementalPageTable<FileHandle>,

    pub thread: Arc<Mutex<Thread>>,

    pub brk: u64,
    pub brk_initial: u64,

    /// Signalled once by `__do_fork` when the child's address space is
    /// either ready or has failed; the parent's `fork` blocks on it.
    pub fork_sema: Arc<Semaphore>,
    /// Signalled by `exit`; a parent's `wait` blocks on it.
    pub wait_sema: Arc<Semaphore>,
    /// The user interrupt frame captured at the `fork` syscall boundary,
    /// cloned into the child's kernel stack by `__do_fork`.
    pub parent_frame: Option<[u64; 6]>,
}

impl Task {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn alloc_fd(&mut self, fd: Arc<RwLock<FileDescriptor>>) -> u32 {
        let n = self.next_fd;
        self.next_fd += 1;
        self.files.insert(n, fd);
        n
    }
}

static NEXT_PID: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(1);

pub fn alloc_pid() -> u32 {
    NEXT_PID.fetch_add(1, core::sync::atomic::Ordering::Relaxed)
}

static TASKS: OnceCell<RwLock<BTreeMap<u32, Arc<Mutex<Task>>>>> = OnceCell::uninit();

/// Known-dead sentinel: once initd has exited, fork/exec refuse to run
/// rather than re-parent orphans into a task that no longer exists
/// (Open Question iii).
static INITD_PID: OnceCell<Mutex<Option<u32>>> = OnceCell::uninit();

pub struct ProcessTable;

impl ProcessTable {
    pub fn init() {
        TASKS.init_once(|| RwLock::new(BTreeMap::new()));
        INITD_PID.init_once(|| Mutex::new(None));
    }

    pub fn set_initd(pid: u32) {
        *INITD_PID.get().unwrap().lock() = Some(pid);
    }

    pub fn initd_is_alive() -> bool {
        match *INITD_PID.get().unwrap().lock() {
            Some(pid) => tasks().read().contains_key(&pid),
            None => false,
        }
    }

    pub fn current_initd_pid() -> Option<u32> {
        *INITD_PID.get().unwrap().lock()
    }

    pub fn insert(task: Task) -> Arc<Mutex<Task>> {
        let pid = task.pid;
        let task = Arc::new(Mutex::new(task));
        tasks().write().insert(pid, task.clone());
        task
    }

    pub fn get(pid: u32) -> Option<Arc<Mutex<Task>>> {
        tasks().read().get(&pid).cloned()
    }

    pub fn remove(pid: u32) -> Option<Arc<Mutex<Task>>> {
        tasks().write().remove(&pid)
    }
}

fn tasks() -> &'static RwLock<BTreeMap<u32, Arc<Mutex<Task>>>> {
    TASKS.get().expect("ProcessTable::init() not called")
}

/// Called by the frame table's eviction closure (see `FrameTable::frame_get`)
/// to swap out the page that currently owns `victim.va` in `victim.pid`'s
/// address space. Lives here rather than in `vm::frame` because it needs
/// the task table and the per-task page table / SPT.
pub fn evict_owner(victim: FrameOwner) -> Result<(), crate::vm::SwapError> {
    let Some(task) = ProcessTable::get(victim.pid) else {
        // Process already gone; its frames were already reclaimed on exit.
        return Ok(());
    };
    let mut t = task.lock();
    let kva = t.page_table.kernel_view_for(victim.va).ok_or(crate::vm::SwapError::DiskError)?;
    let dirty = t.page_table.is_dirty(victim.va);

    let mut bytes = [0u8; crate::vm::PAGE_SIZE as usize];
    unsafe {
        bytes.copy_from_slice(core::slice::from_raw_parts(kva as *const u8, crate::vm::PAGE_SIZE as usize));
    }

    let mut swap = crate::SWAP.get().unwrap().lock();
    let page = t.spt.find_mut(victim.va).ok_or(crate::vm::SwapError::DiskError)?;
    page.swap_out(&bytes, dirty, &mut *swap).map_err(|_| crate::vm::SwapError::DiskError)?;
    t.page_table.clear_page(victim.va);
    Ok(())
}

/// Weak handle stashed on `Thread` so the scheduler/fault path can look a
/// task up without the task table taking a hard reference to every thread.
pub type TaskRef = Weak<Mutex<Task>>;
