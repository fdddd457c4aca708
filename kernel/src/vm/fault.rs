//! Component N: the page-fault handler. `classify` is the pure decision
//! logic (unit-tested below); `handle_page_fault` wires it to the live
//! kernel state (current task's SPT, frame table, swap disk) and is called
//! from the page-fault exception handler in [`crate::interrupts`].

use alloc::sync::Arc;
use spin::Mutex;

use crate::{
    debug_println, kernel_log,
    process::Task,
    thread::scheduler,
};

use super::{
    frame::FrameOwner,
    round_down_to_page,
    spt::{Marker, Page},
    MAX_STACK_GROWTH, PAGE_SIZE, USER_STACK,
};

/// Lower bound of the non-canonical "hole"; anything at or above this is
/// kernel space on this target (canonical split for 48-bit virtual
/// addresses).
const KERNEL_BASE: u64 = 0x0000_8000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Page exists in the SPT; claim a frame and run its initializer.
    Claim,
    /// No page yet, but the access is a legitimate stack-growth fault;
    /// value is the page-aligned VA to install a fresh anon page at.
    GrowStack(u64),
    /// Unrecoverable: terminate the process with exit(-1).
    Kill,
}

/// Pure classification, independent of any live kernel state so it can be
/// exercised directly in tests.
pub fn classify(
    fault_va: u64,
    write: bool,
    present: bool,
    found_in_spt: bool,
    page_writable: Option<bool>,
    rsp: u64,
) -> Decision {
    if fault_va == 0 {
        return Decision::Kill;
    }
    if fault_va >= KERNEL_BASE {
        return Decision::Kill;
    }
    if present {
        // A mapped, present page faulted: a protection violation this
        // kernel has no COW path to recover from.
        return Decision::Kill;
    }

    if found_in_spt {
        if write && page_writable == Some(false) {
            return Decision::Kill;
        }
        return Decision::Claim;
    }

    let stack_band_low = USER_STACK.saturating_sub(MAX_STACK_GROWTH);
    let in_band = fault_va <= USER_STACK && fault_va >= stack_band_low;
    let near_rsp = rsp.saturating_sub(fault_va) <= 8;

    if in_band && near_rsp {
        Decision::GrowStack(round_down_to_page(fault_va))
    } else {
        Decision::Kill
    }
}

/// Entry point called from the `#[interrupt]` page-fault handler with the
/// faulting address, whether the access originated in user mode, whether
/// it was a write, and whether the page was present (all decoded from the
/// error code and CR2 by the caller, which is hardware-specific and stays
/// in `interrupts.rs`).
pub fn handle_page_fault(fault_va: u64, user: bool, write: bool, present: bool, rsp: u64) {
    let current = scheduler::current_thread();
    let Some(task) = current.lock().process.upgrade() else {
        kernel_log!("page fault with no owning process, faulting address {:#x}", fault_va);
        loop {
            x86_64::instructions::hlt();
        }
    };

    let decision = {
        let t = task.lock();
        let found = t.spt.find(fault_va);
        classify(fault_va, write, present, found.is_some(), found.map(|p| p.writable), rsp)
    };

    match decision {
        Decision::Claim => {
            if claim(&task, fault_va).is_err() {
                kill(&task, user);
            }
        }
        Decision::GrowStack(va) => {
            {
                let mut t = task.lock();
                t.spt.insert(Page::new_anon(va, true, Marker { stack: true, ..Default::default() }));
            }
            if claim(&task, va).is_err() {
                kill(&task, user);
            }
        }
        Decision::Kill => kill(&task, user),
    }
}

/// Allocates a frame for the page at `va`, installs the user PTE, and runs
/// its initializer / swap-in.
pub(crate) fn claim(task: &Arc<Mutex<Task>>, va: u64) -> Result<(), ()> {
    let mut t = task.lock();
    let pid = t.pid;
    let writable = t.spt.find(va).ok_or(())?.writable;

    let owner = FrameOwner { pid, va };
    let frame = crate::FRAME_TABLE
        .get()
        .unwrap()
        .lock()
        .frame_get(owner, &mut *crate::PMM.get().unwrap().lock(), |victim| {
            crate::process::evict_owner(victim)
        })
        .map_err(|_| ())?;

    t.page_table.set_page(va, frame, writable).map_err(|_| ())?;

    let mut bytes = [0u8; PAGE_SIZE as usize];
    let kva = super::kernel_view_of(frame);
    // SAFETY: `kva` is the kernel's direct-mapped view of a frame this
    // task now exclusively owns.
    unsafe {
        bytes.copy_from_slice(core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE as usize));
    }

    let page = t.spt.find_mut(va).ok_or(())?;
    let mut swap = crate::SWAP.get().unwrap().lock();
    page.swap_in(frame, &mut bytes, &mut *swap).map_err(|_| ())?;
    drop(swap);

    unsafe {
        core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE as usize).copy_from_slice(&bytes);
    }

    Ok(())
}

fn kill(task: &Arc<Mutex<Task>>, user: bool) {
    if !user {
        panic!("page fault in kernel mode");
    }
    debug_println!("killing process for unrecoverable page fault");
    crate::process::lifecycle::exit_current(task, -1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_address_is_killed() {
        assert_eq!(classify(0, false, false, false, None, 0x7fff_ffff_0000), Decision::Kill);
    }

    #[test]
    fn present_page_is_always_killed() {
        assert_eq!(classify(0x1000, false, true, true, Some(true), 0), Decision::Kill);
    }

    #[test]
    fn spt_hit_claims_unless_readonly_write() {
        assert_eq!(classify(0x400000, false, false, true, Some(true), 0), Decision::Claim);
        assert_eq!(classify(0x400000, true, false, true, Some(false), 0), Decision::Kill);
        assert_eq!(classify(0x400000, true, false, true, Some(true), 0), Decision::Claim);
    }

    #[test]
    fn stack_growth_boundary_is_exactly_eight_bytes() {
        let rsp = USER_STACK - 0x2000;
        assert_eq!(
            classify(rsp - 8, true, false, false, None, rsp),
            Decision::GrowStack(round_down_to_page(rsp - 8))
        );
        assert_eq!(classify(rsp - 9, true, false, false, None, rsp), Decision::Kill);
    }

    #[test]
    fn stack_growth_outside_one_mib_band_is_killed() {
        let too_far = USER_STACK - MAX_STACK_GROWTH - PAGE_SIZE;
        assert_eq!(classify(too_far, true, false, false, None, too_far + 4), Decision::Kill);
    }
}
