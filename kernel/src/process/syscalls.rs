//! The syscall entry/exit trampoline and the dispatcher it calls into.
//! Ported near-verbatim from the donor crate's `user/syscalls/mod.rs`: a
//! `syscall`-instruction entry that has no automatic stack switch, so it
//! borrows the six callee-saved registers it needs as scratch space on the
//! *user* stack just long enough to look up the target kernel stack, then
//! replays them once it has switched over. The six words it pushes right
//! before `handle_syscall_inner` double as `fork`'s trapframe (see
//! [`super::lifecycle::fork`]).

use core::{arch::naked_asm, ffi::CStr, slice};

use alloc::{string::String, sync::Arc};
use spin::{Mutex, RwLock};
use x86_64::{registers::model_specific::FsBase, VirtAddr};

use crate::{
    process::{
        errno::{ARCH_SET_FS, EBADF, EFAULT, EINVAL, ENOSYS, ENOTTY, O_ACCMODE, O_RDONLY, O_WRONLY},
        lifecycle, FileDescriptor, Task,
    },
    thread::scheduler,
    vm::{PageTable, PAGE_SIZE},
};

extern "sysv64" fn get_kernel_stack() -> u64 {
    scheduler::current_thread().lock().kstack_top()
}

fn current_task() -> Arc<Mutex<Task>> {
    scheduler::current_thread().lock().process.upgrade().expect("syscall from a kernel thread with no process")
}

/// Userspace is always the lower half of the address space in this
/// higher-half layout; reject anything in the top half outright rather
/// than let a bad pointer walk into kernel memory.
fn check_addr(addr: u64) -> bool {
    addr & (1 << 63) == 0
}

fn check_buffer(ptr: *const u8, len: usize) -> bool {
    check_addr(ptr as u64) && check_addr(unsafe { ptr.byte_add(len) } as u64)
}

fn sys_read(fd: u32, buf: *mut u8, count: usize) -> i64 {
    if !check_buffer(buf, count) {
        return -EFAULT;
    }
    let buf = unsafe { slice::from_raw_parts_mut(buf, count) };

    let task = current_task();
    let t = task.lock();
    let Some(fd) = t.files.get(&fd) else { return -EBADF };
    let mut fd = fd.write();
    if fd.flags & O_ACCMODE == O_WRONLY {
        return -EBADF;
    }

    let vfs = crate::VFS.get().expect("filesystem not mounted");
    let n = vfs.read(fd.inode.clone(), fd.offset, buf).unwrap_or(0);
    fd.offset += n as u64;
    n as i64
}

fn sys_write(fd: u32, buf: *const u8, count: usize) -> i64 {
    if !check_buffer(buf, count) {
        return -EFAULT;
    }
    let buf = unsafe { slice::from_raw_parts(buf, count) };

    let task = current_task();
    let t = task.lock();
    let Some(fd) = t.files.get(&fd) else { return -EBADF };
    let mut fd = fd.write();
    if fd.flags & O_ACCMODE == O_RDONLY {
        return -EBADF;
    }

    let vfs = crate::VFS.get().expect("filesystem not mounted");
    let n = vfs.write(fd.inode.clone(), fd.offset, buf).unwrap_or(0);
    fd.offset += n as u64;
    n as i64
}

fn sys_open(pathname: *const i8, flags: u32) -> i64 {
    if !check_addr(pathname as u64) {
        return -EFAULT;
    }
    let Ok(pathname) = unsafe { CStr::from_ptr(pathname) }.to_str() else { return -EFAULT };
    if !check_buffer(pathname.as_ptr(), pathname.len()) {
        return -EFAULT;
    }

    let vfs = crate::VFS.get().expect("filesystem not mounted");
    let Ok(inode) = vfs.traverse_fs(vfs.root.clone(), pathname) else { return -EBADF };
    if vfs.open(inode.clone()).is_err() {
        return -EBADF;
    }

    let task = current_task();
    let mut t = task.lock();
    t.alloc_fd(Arc::new(RwLock::new(FileDescriptor { inode, offset: 0, flags }))) as i64
}

fn sys_close(fd: u32) -> i64 {
    let task = current_task();
    let mut t = task.lock();
    match t.files.remove(&fd) {
        Some(desc) => {
            let vfs = crate::VFS.get().expect("filesystem not mounted");
            let _ = vfs.close(desc.read().inode.clone());
            0
        }
        None => -EBADF,
    }
}

fn sys_seek(fd: u32, position: u64) -> i64 {
    let task = current_task();
    let t = task.lock();
    let Some(fd) = t.files.get(&fd) else { return -EBADF };
    fd.write().offset = position;
    0
}

fn sys_tell(fd: u32) -> i64 {
    let task = current_task();
    let t = task.lock();
    let Some(fd) = t.files.get(&fd) else { return -EBADF };
    fd.read().offset as i64
}

fn sys_filesize(fd: u32) -> i64 {
    let task = current_task();
    let t = task.lock();
    let Some(fd) = t.files.get(&fd) else { return -EBADF };
    fd.read().inode.size as i64
}

/// The backing filesystems in this crate are read-only (§6 Supplement
/// notes these are ambient plumbing, not load-bearing): there is no
/// directory-mutation primitive in `vfs::Filesystem` to create or unlink
/// an entry, so both report failure rather than silently no-op.
fn sys_create(_pathname: *const i8, _initial_size: u64) -> i64 {
    -ENOSYS
}

fn sys_remove(_pathname: *const i8) -> i64 {
    -ENOSYS
}

fn sys_dup2(oldfd: u32, newfd: u32) -> i64 {
    let task = current_task();
    let mut t = task.lock();
    let Some(old) = t.files.get(&oldfd).cloned() else { return -EBADF };
    if oldfd == newfd {
        return newfd as i64;
    }
    t.files.insert(newfd, old);
    newfd as i64
}

fn sys_halt() -> ! {
    crate::kernel_log!("halt()");
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

fn sys_arch_prctl(op: u32, addr: u64) -> i64 {
    match op {
        ARCH_SET_FS => {
            if !check_addr(addr) {
                return -EFAULT;
            }
            FsBase::write(VirtAddr::new(addr));
            0
        }
        _ => -EINVAL,
    }
}

fn sys_brk(addr: u64) -> u64 {
    let task = current_task();
    let mut t = task.lock();

    if !check_addr(addr) || addr < t.brk_initial {
        return t.brk;
    }

    let old = t.brk;
    if addr > old {
        let mut va = crate::vm::round_down_to_page(old) + PAGE_SIZE;
        while va < addr {
            if t.page_table.map_fresh(va, true).is_err() {
                return t.brk;
            }
            va += PAGE_SIZE;
        }
    } else if addr < old {
        let mut va = crate::vm::round_down_to_page(addr) + PAGE_SIZE;
        while va < old {
            t.page_table.unmap(va);
            va += PAGE_SIZE;
        }
    }

    t.brk = addr;
    t.brk
}

/// `prot`/`flags` are folded down to a single writable bit taken from the
/// fd's own open mode — there is no independent `PROT_WRITE` here, just
/// whether the mapping may diverge from the backing file.
fn sys_mmap(addr: u64, length: u64, fd: u32, offset: u64) -> i64 {
    if !check_addr(addr) || !check_addr(addr + length) {
        return -EFAULT;
    }
    let task = current_task();
    let mut t = task.lock();
    let Some(descriptor) = t.files.get(&fd).cloned() else { return -EBADF };
    let (inode, writable) = {
        let fd = descriptor.read();
        (fd.inode.clone(), fd.flags & O_ACCMODE != O_RDONLY)
    };
    match crate::vm::mmap::mmap(&mut t.spt, addr, length, writable, inode.clone(), offset) {
        // The first page's `owns_file` token is released by `munmap`'s
        // `Page::destroy` (see `vm::spt`); this is the matching acquire.
        Ok(()) => {
            inode.deny_write();
            addr as i64
        }
        Err(_) => -EINVAL,
    }
}

fn sys_munmap(addr: u64, length: u64) -> i64 {
    let task = current_task();
    let mut t = task.lock();
    let mut swap = crate::SWAP.get().unwrap().lock();

    let page_table = &t.page_table;
    let freed = crate::vm::mmap::munmap(
        &mut t.spt,
        addr,
        length,
        &mut *swap,
        |va| page_table.is_dirty(va),
        |frame| {
            let kva = crate::vm::kernel_view_of(frame);
            let mut bytes = [0u8; PAGE_SIZE as usize];
            unsafe { bytes.copy_from_slice(core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE as usize)) };
            bytes
        },
    );
    drop(swap);

    let mut va = crate::vm::round_down_to_page(addr);
    let end = addr + length;
    while va < end {
        t.page_table.clear_page(va);
        va += PAGE_SIZE;
    }

    let mut frame_table = crate::FRAME_TABLE.get().unwrap().lock();
    for frame in freed {
        frame_table.frame_return(frame);
    }

    0
}

fn sys_fork() -> i64 {
    let task = current_task();
    let name = task.lock().name.clone();
    lifecycle::fork(&task, &name) as i64
}

fn sys_wait(pid: u32) -> i64 {
    let task = current_task();
    lifecycle::wait(&task, pid) as i64
}

fn sys_exec(filename: *const i8, argv: *const *const i8) -> i64 {
    if !check_addr(filename as u64) {
        return -EFAULT;
    }
    let Ok(filename) = unsafe { CStr::from_ptr(filename) }.to_str() else { return -EFAULT };
    if !check_buffer(filename.as_ptr(), filename.len()) {
        return -EFAULT;
    }

    let mut cmdline = String::from(filename);
    if !argv.is_null() {
        // Cap at 256 entries so a malicious argv can't make the kernel walk
        // off into unmapped memory building the command line.
        for i in 0..256 {
            let entry = unsafe { argv.add(i) };
            if !check_addr(entry as u64) {
                return -EFAULT;
            }
            let arg_ptr = unsafe { *entry };
            if arg_ptr.is_null() {
                break;
            }
            if !check_addr(arg_ptr as u64) {
                return -EFAULT;
            }
            let Ok(arg) = unsafe { CStr::from_ptr(arg_ptr) }.to_str() else { return -EFAULT };
            cmdline.push(' ');
            cmdline.push_str(arg);
        }
    }

    let task = current_task();
    match lifecycle::exec(&task, &cmdline) {
        Ok(()) => unreachable!("exec only returns on failure"),
        Err(_) => -1,
    }
}

pub extern "sysv64" fn handle_syscall_inner(syscall_number: u64, arg0: u64, arg1: u64, arg2: u64, arg3: u64) -> u64 {
    let retval: i64 = match syscall_number {
        0 => sys_read(arg0 as u32, arg1 as *mut u8, arg2 as usize),
        1 => sys_write(arg0 as u32, arg1 as *const u8, arg2 as usize),
        2 => sys_open(arg0 as *const i8, arg1 as u32),
        3 => sys_close(arg0 as u32),
        4 => sys_seek(arg0 as u32, arg1),
        5 => sys_tell(arg0 as u32),
        6 => sys_filesize(arg0 as u32),
        7 => sys_create(arg0 as *const i8, arg1),
        9 => sys_remove(arg0 as *const i8),
        10 => sys_dup2(arg0 as u32, arg1 as u32),
        11 => sys_halt(),
        12 => return sys_brk(arg0),
        13 => sys_mmap(arg0, arg1, arg2 as u32, arg3),
        14 => sys_munmap(arg0, arg1),
        16 => -ENOTTY,
        57 => sys_fork(),
        59 => sys_exec(arg0 as *const i8, arg1 as *const *const i8),
        61 => sys_wait(arg0 as u32),
        60 | 231 => lifecycle::exit_current(&current_task(), arg0 as i32),
        158 => sys_arch_prctl(arg0 as u32, arg1),
        _ => {
            crate::kernel_log!("unknown syscall {} ({}, {}, {}, {})", syscall_number, arg0, arg1, arg2, arg3);
            -ENOSYS
        }
    };
    retval as u64
}

#[unsafe(naked)]
pub unsafe extern "sysv64" fn handle_syscall() {
    naked_asm!(
        "
        push rcx // saved rip
        push r11 // saved rflags

        push rbp // placeholder: will hold the saved user rsp
        push rbx // placeholder: will hold the target kernel rsp

        push rax // syscall number
        push rdi // arg0
        push rsi // arg1
        push rdx // arg2
        push r10 // arg3

        call {get_kernel_stack} // still on the user stack; safe, nothing kernel-side touched yet
        mov rbx, rax

        pop r10
        pop rdx
        pop rsi
        pop rdi
        pop rax

        mov rbp, rsp // rbp now points at the saved rcx/r11/rbp/rbx on the user stack
        mov rsp, rbx // switch onto the kernel stack

        push rax
        push rdi
        push rsi
        push rdx
        push r10

        pop r8
        pop rcx
        pop rdx
        pop rsi
        pop rdi

        // The kernel stack starts empty for every syscall entry, so these
        // six pushes land at its very top. `fork` depends on that: it
        // clones exactly this region onto the child's kernel stack.
        push rbx
        push r12
        push r13
        push r14
        push r15
        push rbp

        call {handle_syscall_inner}

        jmp {syscall_ret}
        ",
        get_kernel_stack = sym get_kernel_stack,
        handle_syscall_inner = sym handle_syscall_inner,
        syscall_ret = sym syscall_ret,
    );
}

/// Restores the user stack via the `rbp` chain `handle_syscall` left behind
/// and `sysretq`s back. The `rbx`/`rbp` popped here are the placeholders
/// pushed on entry, not genuinely preserved registers — callee-saved state
/// for a *resumed* thread comes back through `thread::scheduler::switch_to`
/// instead, never through here.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn syscall_ret() {
    naked_asm!(
        "
        mov rsp, rbp
        pop rbx
        pop rbp
        pop r11
        pop rcx
        sysretq
        "
    )
}
