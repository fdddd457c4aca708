//! A per-task hardware page table: an `OffsetPageTable` rooted at its own
//! PML4 frame, addressed through the kernel's direct physical-memory
//! mapping so any task's tables can be walked without first activating
//! them (needed by eviction and by `fork`, which builds the child's
//! address space while the parent is still running).

use alloc::vec::Vec;

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::mapper::TranslateResult;
use x86_64::structures::paging::{
    FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB, Translate,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::vm::{FrameNumber, PageTableError, PAGE_SIZE};

fn phys_offset() -> VirtAddr {
    VirtAddr::new(crate::PHYS_MEM_OFFSET.get().copied().expect("physical memory offset not initialised"))
}

fn base_flags(writable: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::NO_EXECUTE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    flags
}

pub struct UserPageTable {
    pml4_frame: PhysFrame,
    /// Frames this table itself claimed for user pages, tracked so they
    /// can be handed back to the allocator on process teardown.
    owned_frames: Vec<PhysFrame>,
}

impl UserPageTable {
    /// Reuses the bootstrap address space; only `create_initd`'s task
    /// should hold this, and only until its first `exec`.
    pub fn current() -> UserPageTable {
        let (frame, _) = Cr3::read();
        UserPageTable { pml4_frame: frame, owned_frames: Vec::new() }
    }

    /// A fresh address space sharing the kernel's upper half (entries
    /// 256..512) with whatever table is currently active.
    pub fn new_blank() -> UserPageTable {
        let mut pmm = crate::PMM.get().unwrap().lock();
        let frame = pmm.allocate_frame().expect("out of memory creating a page table");

        let dst: &mut PageTable = unsafe { &mut *(phys_offset() + frame.start_address().as_u64()).as_mut_ptr() };
        for entry in dst.iter_mut() {
            entry.set_unused();
        }

        let (kernel_frame, _) = Cr3::read();
        let kernel_table: &PageTable = unsafe { &*(phys_offset() + kernel_frame.start_address().as_u64()).as_ptr() };
        for i in 256..512 {
            dst[i] = kernel_table[i].clone();
        }

        UserPageTable { pml4_frame: frame, owned_frames: Vec::new() }
    }

    pub fn cr3_frame(&self) -> PhysFrame {
        self.pml4_frame
    }

    /// # Safety
    /// The caller must ensure `self` stays alive and mapped for as long as
    /// it remains the active address space.
    pub unsafe fn activate(&self) {
        unsafe { Cr3::write(self.pml4_frame, Cr3Flags::empty()) };
    }

    fn mapper(&self) -> OffsetPageTable<'static> {
        let table: &mut PageTable = unsafe { &mut *(phys_offset() + self.pml4_frame.start_address().as_u64()).as_mut_ptr() };
        unsafe { OffsetPageTable::new(table, phys_offset()) }
    }

    /// The kernel's direct-mapped view of whatever frame backs `va`, or
    /// `None` if unmapped. Used by the fault handler and by eviction to
    /// read/write frame contents without a dedicated temporary mapping.
    pub fn kernel_view_for(&self, va: u64) -> Option<u64> {
        match self.mapper().translate(VirtAddr::new(va)) {
            TranslateResult::Mapped { frame, .. } => Some((phys_offset() + frame.start_address().as_u64()).as_u64()),
            _ => None,
        }
    }

    /// Allocates a frame and maps it at `va`, used for the stack and for
    /// `brk` growth where there's no SPT-driven lazy path.
    pub fn map_fresh(&mut self, va: u64, writable: bool) -> Result<FrameNumber, PageTableError> {
        let mut pmm = crate::PMM.get().unwrap().lock();
        let frame = pmm.allocate_frame().ok_or(PageTableError::NoFrameAvailable)?;
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
        unsafe {
            self.mapper()
                .map_to(page, frame, base_flags(writable), &mut *pmm)
                .map_err(|_| PageTableError::NoFrameAvailable)?
                .flush();
        }
        self.owned_frames.push(frame);
        Ok(FrameNumber(frame.start_address().as_u64() / PAGE_SIZE))
    }

    pub fn unmap(&mut self, va: u64) {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
        if let Ok((frame, flush)) = self.mapper().unmap(page) {
            flush.flush();
            self.owned_frames.retain(|f| *f != frame);
            unsafe { crate::PMM.get().unwrap().lock().deallocate_frame(frame) };
        }
    }

    /// Frees every frame this table's pages still hold, then the PML4
    /// frame itself. Called once per task, after its SPT has already been
    /// torn down (`exec` tearing down the replaced address space, `exit`
    /// tearing down the final one).
    pub fn destroy(&mut self) {
        let mut pmm = crate::PMM.get().unwrap().lock();
        for frame in core::mem::take(&mut self.owned_frames) {
            unsafe { pmm.deallocate_frame(frame) };
        }
        unsafe { pmm.deallocate_frame(self.pml4_frame) };
    }
}

impl crate::vm::PageTable for UserPageTable {
    fn get_page(&self, va: u64) -> Option<FrameNumber> {
        match self.mapper().translate(VirtAddr::new(va)) {
            TranslateResult::Mapped { frame, .. } => Some(FrameNumber(frame.start_address().as_u64() / PAGE_SIZE)),
            _ => None,
        }
    }

    fn set_page(&mut self, va: u64, frame: FrameNumber, writable: bool) -> Result<(), PageTableError> {
        let mut pmm = crate::PMM.get().unwrap().lock();
        let phys_frame = PhysFrame::containing_address(PhysAddr::new(frame.physical_address()));
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
        unsafe {
            self.mapper()
                .map_to(page, phys_frame, base_flags(writable), &mut *pmm)
                .map_err(|_| PageTableError::NoFrameAvailable)?
                .flush();
        }
        Ok(())
    }

    fn clear_page(&mut self, va: u64) {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
        if let Ok((_, flush)) = self.mapper().unmap(page) {
            flush.flush();
        }
    }

    fn is_dirty(&self, va: u64) -> bool {
        match self.mapper().translate(VirtAddr::new(va)) {
            TranslateResult::Mapped { flags, .. } => flags.contains(PageTableFlags::DIRTY),
            _ => false,
        }
    }

    fn set_dirty(&mut self, va: u64, dirty: bool) {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
        let Ok(current) = self.mapper().translate_page(page) else { return };
        let writable = self.is_writable(va);
        let mut flags = base_flags(writable);
        if dirty {
            flags |= PageTableFlags::DIRTY;
        }
        unsafe {
            let _ = self.mapper().update_flags(page, flags);
        }
        let _ = current;
    }

    fn is_writable(&self, va: u64) -> bool {
        match self.mapper().translate(VirtAddr::new(va)) {
            TranslateResult::Mapped { flags, .. } => flags.contains(PageTableFlags::WRITABLE),
            _ => false,
        }
    }
}
