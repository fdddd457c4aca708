//! Component H: process lifecycle — `create_initd`, `fork`, `exec`, `wait`,
//! `exit`. Builds on the task table ([`super`]), the ELF loader
//! ([`super::elf`]), and the SPT/frame/fault machinery in [`crate::vm`].

use core::arch::naked_asm;

use alloc::{
    borrow::ToOwned,
    collections::btree_map::BTreeMap,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};
use spin::Mutex;

use crate::{
    kernel_log,
    thread::{scheduler, sync::Semaphore, Thread, ThreadStatus},
    vm::{
        fault,
        spt::{ForkedPage, Initializer, Marker, Page, PageKind, SupplementalPageTable},
        File, PageTable as _, PAGE_SIZE, USER_STACK,
    },
};

use super::{
    elf::{self, LoadingError},
    pagetable::UserPageTable,
    ProcessTable, Task, TaskStatus,
};

/// How much of the user stack is reserved up front; the rest grows lazily
/// on fault, up to `vm::MAX_STACK_GROWTH`.
const INITIAL_STACK_RESERVE: u64 = 0x4000;

fn new_task_shell(pid: u32, name: String, parent: Option<u32>, thread: Arc<Mutex<Thread>>, page_table: UserPageTable) -> Task {
    Task {
        pid,
        name,
        parent,
        children: Vec::new(),
        exit_code: None,
        status: TaskStatus::Running,
        files: BTreeMap::new(),
        next_fd: 0,
        executable: None,
        page_table,
        spt: SupplementalPageTable::new(),
        thread,
        brk: 0,
        brk_initial: 0,
        fork_sema: Arc::new(Semaphore::new(0)),
        wait_sema: Arc::new(Semaphore::new(0)),
        parent_frame: None,
    }
}

/// Creates the first process: a task whose kernel thread immediately
/// `exec`s `cmdline`. Reuses the bootstrap address space until that exec
/// replaces it.
pub fn create_initd(cmdline: &str) -> u32 {
    let pid = super::alloc_pid();
    let thread = Arc::new(Mutex::new(Thread::from_func(initd_entry, Weak::new(), Some("initd".to_owned()))));

    let task = new_task_shell(pid, "initd".to_owned(), None, thread.clone(), UserPageTable::current());
    let task = ProcessTable::insert(task);
    thread.lock().process = Arc::downgrade(&task);
    ProcessTable::set_initd(pid);

    stage_initd_cmdline(thread.lock().tid, cmdline);

    thread.lock().status = ThreadStatus::Ready;
    scheduler::enqueue(thread);
    pid
}

static INITD_CMDLINE: conquer_once::spin::OnceCell<Mutex<BTreeMap<u32, String>>> = conquer_once::spin::OnceCell::uninit();

fn stage_initd_cmdline(tid: u32, cmdline: &str) {
    INITD_CMDLINE.get_or_init(|| Mutex::new(BTreeMap::new())).lock().insert(tid, cmdline.to_string());
}

unsafe extern "sysv64" fn initd_entry() {
    let tid = scheduler::current_thread().lock().tid;
    let cmdline = INITD_CMDLINE.get().unwrap().lock().remove(&tid).unwrap_or_default();
    let task = scheduler::current_thread().lock().process.upgrade().expect("initd has no task");

    if let Err(_) = exec(&task, &cmdline) {
        kernel_log!("initd: failed to exec {:?}", cmdline);
        exit_current(&task, -1);
    }
}

/// Loads and jumps into the ELF named by the first whitespace-separated
/// token of `cmdline`; the rest become argv. Returns only on failure —
/// the success path abandons the calling thread's kernel stack and parks
/// it forever after handing control to the scheduler.
pub fn exec(task: &Arc<Mutex<Task>>, cmdline: &str) -> Result<(), LoadingError> {
    if !ProcessTable::initd_is_alive() {
        return Err(LoadingError::SystemShuttingDown);
    }

    let mut parts = cmdline.split_whitespace();
    let path = parts.next().ok_or(LoadingError::TruncatedFile)?;
    let args: Vec<&str> = core::iter::once(path).chain(parts).collect();

    let vfs = crate::VFS.get().expect("filesystem not mounted");
    let lock = crate::FS_LOCK.get().expect("filesystem lock not initialised").lock();
    let inode = vfs.traverse_fs(vfs.root.clone(), path).map_err(|_| LoadingError::TruncatedFile)?;
    let len = inode.size;
    let mut binary = alloc::vec![0u8; len];
    vfs.read(inode.clone(), 0, &mut binary).map_err(|_| LoadingError::TruncatedFile)?;
    drop(lock);

    let header = elf::parse_header(&binary)?;
    let phdrs = elf::parse_program_headers(&binary, &header)?;

    let mut new_spt = SupplementalPageTable::new();
    for ph in &phdrs {
        let seg_start = crate::vm::round_down_to_page(ph.p_vaddr);
        let seg_end = ph.p_vaddr + ph.p_memsz;
        let mut va = seg_start;
        let mut file_off = ph.p_offset - (ph.p_vaddr - seg_start);

        while va < seg_end {
            let page_end = va + PAGE_SIZE;
            let file_bytes_here = (ph.p_offset + ph.p_filesz).saturating_sub(file_off).min(PAGE_SIZE.min(page_end - va));
            let read_bytes = file_bytes_here.min(PAGE_SIZE) as u32;
            let zero_bytes = PAGE_SIZE as u32 - read_bytes;

            let init = Initializer::LoadFile {
                file: inode.clone(),
                offset: file_off,
                read_bytes,
                zero_bytes,
                owns_file: false,
            };
            let page = Page::new_uninit(va, ph.writable(), Marker { executable_segment: true, ..Default::default() }, init);
            if !new_spt.insert(page) {
                return Err(LoadingError::SegmentOutOfRange);
            }

            va += PAGE_SIZE;
            file_off += PAGE_SIZE;
        }
    }

    let brk_initial = phdrs.iter().map(|ph| crate::vm::round_down_to_page(ph.p_vaddr + ph.p_memsz) + PAGE_SIZE).max().unwrap_or(0);

    let mut t = task.lock();
    if let Some(old) = t.executable.take() {
        old.allow_write();
    }

    let mut new_page_table = UserPageTable::new_blank();
    let stack_bottom = USER_STACK - INITIAL_STACK_RESERVE;
    let mut va = stack_bottom;
    while va < USER_STACK {
        new_page_table.map_fresh(va, true).map_err(|_| LoadingError::TruncatedFile)?;
        va += PAGE_SIZE;
    }
    let sp = build_user_stack(&mut new_page_table, &args);

    // Swap in the freshly built address space, then tear the old one down —
    // otherwise its resident frames and PML4 would leak on every exec.
    let old_spt = core::mem::replace(&mut t.spt, new_spt);
    let mut old_page_table = core::mem::replace(&mut t.page_table, new_page_table);
    t.brk_initial = brk_initial;
    t.brk = brk_initial;
    inode.deny_write();
    t.executable = Some(inode);

    t.thread.lock().set_func(enter_userspace);
    {
        let mut th = t.thread.lock();
        th.context.rbp = header.e_entry;
        th.context.rbx = sp;
    }

    unsafe { t.page_table.activate() };

    {
        let mut swap = crate::SWAP.get().unwrap().lock();
        let freed = old_spt.kill(&mut *swap, |va| old_page_table.is_dirty(va), |frame| {
            let kva = crate::vm::kernel_view_of(frame);
            let mut bytes = [0u8; PAGE_SIZE as usize];
            unsafe { bytes.copy_from_slice(core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE as usize)) };
            bytes
        });
        drop(swap);

        let mut frame_table = crate::FRAME_TABLE.get().unwrap().lock();
        for frame in freed {
            frame_table.frame_return(frame);
        }
    }
    old_page_table.destroy();

    let thread = t.thread.clone();
    drop(t);

    // Abandon the calling thread: the scheduler must not try to save its
    // register state, since control is about to leave through `enter_userspace`
    // rather than a normal `switch_to` return.
    crate::CPUS.get().unwrap().get_cpu().current_thread = None;
    scheduler::enqueue(thread);
    scheduler::yield_execution();
    unreachable!("exec'd thread resumed after its kernel stack was abandoned");
}

/// Lays out argc/argv/envp/auxv on the freshly mapped stack per §4.5 and
/// returns the initial `rsp`.
fn build_user_stack(page_table: &mut UserPageTable, args: &[&str]) -> u64 {
    let kva = page_table.kernel_view_for(USER_STACK - PAGE_SIZE).expect("stack page not mapped") + PAGE_SIZE - 8;

    let mut sp = USER_STACK;
    let mut offsets = Vec::with_capacity(args.len());

    for arg in args.iter().rev() {
        let bytes = arg.as_bytes();
        sp -= (bytes.len() + 1) as u64;
        let dst = page_table.kernel_view_for(crate::vm::round_down_to_page(sp)).unwrap() + crate::vm::page_offset(sp);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst as *mut u8, bytes.len());
            *((dst as usize + bytes.len()) as *mut u8) = 0;
        }
        offsets.push(sp);
    }

    sp &= !0x7;

    // argv[argc] = NULL, then argv[argc-1..0], envp terminator, argc.
    let mut write_u64 = |addr: u64, val: u64| {
        let dst = page_table.kernel_view_for(crate::vm::round_down_to_page(addr)).unwrap() + crate::vm::page_offset(addr);
        unsafe { *(dst as *mut u64) = val };
    };

    sp -= 8;
    write_u64(sp, 0); // envp terminator
    sp -= 8;
    write_u64(sp, 0); // argv terminator

    for &off in &offsets {
        sp -= 8;
        write_u64(sp, off);
    }

    sp -= 8;
    write_u64(sp, args.len() as u64); // argc

    sp -= 8;
    write_u64(sp, 0); // fake return address

    let _ = kva;
    sp
}

/// First transition into user mode after `exec`. Not reached via the
/// syscall-return path, so it builds its own `sysretq` frame directly from
/// the context the scheduler just restored: `rbx` holds the target user
/// `rsp`, `rbp` the target entry `rip`.
#[unsafe(naked)]
unsafe extern "sysv64" fn enter_userspace() {
    naked_asm!(
        "
        mov rsp, rbx
        mov rcx, rbp
        mov r11, 0x0202
        sysretq
        ",
    )
}

/// `fork(name)`. The child task and thread are created synchronously so a
/// `wait`/address-space failure can be reported via its `status`, but the
/// address-space duplication itself runs on the child's own kernel thread
/// (`__do_fork`), matching the source's parent/child handoff; the parent
/// blocks on the child's fork semaphore rather than a separate result
/// channel.
pub fn fork(parent: &Arc<Mutex<Task>>, name: &str) -> i32 {
    if !ProcessTable::initd_is_alive() {
        return -1;
    }

    let child_pid = super::alloc_pid();
    let child_thread = Arc::new(Mutex::new(Thread::from_func(do_fork_entry, Weak::new(), Some(name.to_owned()))));

    let parent_pid = parent.lock().pid;
    let mut child_task = new_task_shell(child_pid, name.to_owned(), Some(parent_pid), child_thread.clone(), UserPageTable::new_blank());
    child_task.status = TaskStatus::Running;

    let fork_sema = child_task.fork_sema.clone();
    let child = ProcessTable::insert(child_task);
    child_thread.lock().process = Arc::downgrade(&child);
    parent.lock().children.push(child_pid);

    // Clone the syscall trampoline's saved registers (the user-mode
    // "trapframe") from the parent's kernel stack onto the child's, then
    // retarget the child to resume through `do_fork_entry`.
    {
        let current = scheduler::current_thread();
        let current = current.lock();
        let mut c = child_thread.lock();
        let src = *current.kstack.last_chunk::<6>().expect("kernel stack too small for a trapframe");
        c.kstack.last_chunk_mut::<6>().unwrap().copy_from_slice(&src);
        *c.kstack.iter_mut().nth_back(6).unwrap() = do_fork_entry as u64;
        c.context.rsp = c.kstack.iter().nth_back(6).unwrap() as *const u64 as u64;
        c.status = ThreadStatus::Ready;
    }

    scheduler::enqueue(child_thread);
    fork_sema.down();

    if child.lock().status == TaskStatus::Fail {
        ProcessTable::remove(child_pid);
        parent.lock().children.retain(|c| *c != child_pid);
        return -1;
    }

    child_pid as i32
}

/// Entry point for a forked child's kernel thread: duplicates the address
/// space and fd table, signals the parent, then resumes exactly where the
/// parent's `fork` syscall was, with a zeroed return value.
#[unsafe(naked)]
unsafe extern "sysv64" fn do_fork_entry() {
    naked_asm!(
        "
        call {}

        pop rbp
        pop r15
        pop r14
        pop r13
        pop r12
        pop rbx

        xor rax, rax

        jmp {}
        ",
        sym do_fork_body,
        sym super::syscalls::syscall_ret,
    )
}

extern "sysv64" fn do_fork_body() {
    let me = scheduler::current_thread();
    let task = me.lock().process.upgrade().expect("__do_fork thread has no task");
    let parent_pid = task.lock().parent.expect("forked task has no parent");

    let ok = match ProcessTable::get(parent_pid) {
        Some(parent) => copy_address_space(&parent, &task) && copy_files(&parent, &task),
        None => false,
    };

    let fork_sema = {
        let mut t = task.lock();
        t.status = if ok { TaskStatus::Running } else { TaskStatus::Fail };
        t.fork_sema.clone()
    };
    fork_sema.up();

    if !ok {
        exit_current(&task, -1);
    }
}

fn copy_address_space(parent: &Arc<Mutex<Task>>, child: &Arc<Mutex<Task>>) -> bool {
    let vas: Vec<u64> = parent.lock().spt.iter().map(|p| p.va).collect();

    for va in vas {
        let resident_bytes = {
            // Anon pages and mmap regions both need an independent copy of
            // their bytes in the child (see `Page::fork_copy`); everything
            // else (executable segments, non-mmap file pages) can stay
            // lazily shared with the parent's file handle.
            let needs_frame = {
                let p = parent.lock();
                p.spt.find(va).map(|page| matches!(page.kind, PageKind::Anon { .. }) || page.marker.mmap).unwrap_or(false)
            };
            if !needs_frame {
                None
            } else {
                let already_resident = parent.lock().spt.find(va).map(|p| p.frame.is_some()).unwrap_or(false);
                if !already_resident && fault::claim(parent, va).is_err() {
                    return false;
                }
                let mut p = parent.lock();
                let Some(page) = p.spt.find(va) else { return false };
                let Some(frame) = page.frame else { return false };
                let kva = crate::vm::kernel_view_of(frame);
                let mut bytes = [0u8; PAGE_SIZE as usize];
                unsafe { bytes.copy_from_slice(core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE as usize)) };
                Some(bytes)
            }
        };

        let forked = {
            let p = parent.lock();
            let Some(page) = p.spt.find(va) else { continue };
            match page.fork_copy(resident_bytes.as_ref()) {
                Ok(f) => f,
                Err(()) => return false,
            }
        };

        let mut c = child.lock();
        match forked {
            ForkedPage::Lazy(page) => {
                c.spt.insert(page);
            }
            ForkedPage::NeedsFrame(page, bytes) => {
                let Ok(frame) = c.page_table.map_fresh(va, page.writable) else { return false };
                let kva = crate::vm::kernel_view_of(frame);
                unsafe {
                    core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE as usize).copy_from_slice(&bytes);
                }
                c.spt.insert(Page::finish_fork(page, frame));
            }
        }
    }

    true
}

fn copy_files(parent: &Arc<Mutex<Task>>, child: &Arc<Mutex<Task>>) -> bool {
    let p = parent.lock();
    let mut c = child.lock();
    c.files = p.files.clone();
    c.next_fd = p.next_fd;
    c.brk = p.brk;
    c.brk_initial = p.brk_initial;
    c.executable = p.executable.clone();
    if let Some(exe) = &c.executable {
        exe.deny_write();
    }
    true
}

/// `wait(child_pid)`. Returns −1 immediately if `child_pid` is not (or is
/// no longer) a child of the caller.
pub fn wait(task: &Arc<Mutex<Task>>, child_pid: u32) -> i32 {
    let is_child = task.lock().children.contains(&child_pid);
    if !is_child {
        return -1;
    }

    let Some(child) = ProcessTable::get(child_pid) else { return -1 };
    let wait_sema = child.lock().wait_sema.clone();
    wait_sema.down();

    let code = child.lock().exit_code.unwrap_or(-1);
    task.lock().children.retain(|c| *c != child_pid);
    ProcessTable::remove(child_pid);
    code
}

/// `exit(code)`. Does not return — the caller's kernel thread parks
/// forever on the scheduler once teardown completes; its stack is
/// reclaimed the next time the scheduler runs.
pub fn exit_current(task: &Arc<Mutex<Task>>, code: i32) -> ! {
    let (name, children) = {
        let mut t = task.lock();
        t.status = TaskStatus::Dying;
        t.exit_code = Some(code);
        (t.name.clone(), t.children.clone())
    };

    kernel_log!("{}: exit({})", name, code);

    {
        let mut t = task.lock();
        let mut swap = crate::SWAP.get().unwrap().lock();
        let freed = t.spt.kill(&mut *swap, |va| t.page_table.is_dirty(va), |frame| {
            let kva = crate::vm::kernel_view_of(frame);
            let mut bytes = [0u8; PAGE_SIZE as usize];
            unsafe { bytes.copy_from_slice(core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE as usize)) };
            bytes
        });
        drop(swap);

        let mut frame_table = crate::FRAME_TABLE.get().unwrap().lock();
        for frame in freed {
            frame_table.frame_return(frame);
        }

        t.files.clear();
        if let Some(exe) = t.executable.take() {
            exe.allow_write();
        }

        // The whole address space is going away with this task, so there is
        // no need to clear individual PTEs the way eviction does — tearing
        // down the PML4 (and any stack/brk frames `map_fresh` tracked
        // outside the SPT) makes them all unreachable at once.
        t.page_table.destroy();
    }

    // Skip re-parenting if initd is already gone, or if the exiting task is
    // itself initd — either way there is no live initd to hand orphans to.
    if let Some(initd_pid) = ProcessTable::current_initd_pid() {
        if ProcessTable::initd_is_alive() && initd_pid != task.lock().pid {
            for child_pid in children {
                if let Some(child) = ProcessTable::get(child_pid) {
                    child.lock().parent = Some(initd_pid);
                }
            }
        }
    }

    {
        let mut t = task.lock();
        t.status = TaskStatus::Exited;
        t.wait_sema.up();
    }

    let has_parent = task.lock().parent.map(|p| ProcessTable::get(p).is_some()).unwrap_or(false);
    if !has_parent {
        ProcessTable::remove(task.lock().pid);
    }

    loop {
        scheduler::block();
    }
}

