use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::{
    FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageSize, PageTable,
    PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::vm::{frame::PhysicalFrameAllocator, FrameNumber, PAGE_SIZE};

pub const HEAP_START: u64 = 0x_4444_4444_0000;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

pub const INITIAL_HEAP_SIZE: u64 = 1024 * 1024;

/// # Safety
/// Can only be called once, and `phys_mem_offset` must be the virtual
/// address the bootloader mapped all of physical memory at (`config.mappings.physical_memory`).
pub unsafe fn init(phys_mem_offset: VirtAddr, memory_regions: &'static MemoryRegions) -> (OffsetPageTable<'static>, PhysicalMemoryManager) {
    let mut mapper = unsafe { init_mapper(phys_mem_offset) };
    let pmm = PhysicalMemoryManager::init_with_heap(memory_regions, &mut mapper);
    (mapper, pmm)
}

/// # Safety
/// Physical memory must already be identity-mapped at `phys_mem_offset` by
/// the bootloader, and this must only be called once per address space.
unsafe fn init_mapper(phys_mem_offset: VirtAddr) -> OffsetPageTable<'static> {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    let table: &mut PageTable = unsafe { &mut *(phys_mem_offset + frame.start_address().as_u64()).as_mut_ptr() };
    unsafe { OffsetPageTable::new(table, phys_mem_offset) }
}

pub struct PhysicalMemoryManager {
    free_frames: Vec<PhysFrame>,
}

impl PhysicalMemoryManager {
    fn init_with_heap(memory_regions: &'static MemoryRegions, mapper: &mut impl Mapper<Size4KiB>) -> PhysicalMemoryManager {
        let mut frame_allocator = unsafe { LinearFrameAllocator::new(memory_regions) };

        let heap_start = VirtAddr::new(HEAP_START);
        let heap_end = heap_start + INITIAL_HEAP_SIZE - 1u64;
        let page_range = Page::range_inclusive(
            Page::containing_address(heap_start),
            Page::containing_address(heap_end),
        );

        for page in page_range {
            let frame = frame_allocator
                .allocate_frame()
                .expect("Failed to initialise heap");
            let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
            unsafe {
                mapper.map_to(page, frame, flags, &mut frame_allocator).expect("Failed to initialise heap").flush();
            }
        }

        unsafe { ALLOCATOR.lock().init(heap_start.as_mut_ptr(), INITIAL_HEAP_SIZE as usize) };

        let free_frames: Vec<_> = frame_allocator.available_frames().skip(frame_allocator.next).collect();

        PhysicalMemoryManager { free_frames }
    }
}

unsafe impl FrameAllocator<Size4KiB> for PhysicalMemoryManager {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.free_frames.pop()
    }
}

impl FrameDeallocator<Size4KiB> for PhysicalMemoryManager {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_frames.push(frame);
    }
}

/// Lets the frame table ([`crate::vm::frame::FrameTable`]) claim and return
/// frames without depending on the `x86_64` crate's page-table-oriented
/// allocator traits.
impl PhysicalFrameAllocator for PhysicalMemoryManager {
    fn allocate(&mut self) -> Option<FrameNumber> {
        FrameAllocator::<Size4KiB>::allocate_frame(self).map(|f| FrameNumber(f.start_address().as_u64() / PAGE_SIZE))
    }

    fn deallocate(&mut self, frame: FrameNumber) {
        let phys_frame = PhysFrame::containing_address(PhysAddr::new(frame.physical_address()));
        unsafe { FrameDeallocator::<Size4KiB>::deallocate_frame(self, phys_frame) };
    }
}

struct LinearFrameAllocator {
    next: usize,
    memory_regions: &'static MemoryRegions,
}

impl LinearFrameAllocator {
    fn available_frames(&self) -> impl Iterator<Item = PhysFrame> {
        let available_memory_regions = self
            .memory_regions
            .iter()
            .filter(|region| region.kind == MemoryRegionKind::Usable);

        let available_frames = available_memory_regions
            .clone()
            .map(|region| region.start..region.end)
            .flatten()
            .filter(|addr| (addr & 0xfff) == 0)
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)));

        available_frames
    }
    unsafe fn new(memory_regions: &'static MemoryRegions) -> Self {
        LinearFrameAllocator {
            next: 0,
            memory_regions,
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for LinearFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.available_frames().nth(self.next);
        self.next += 1;
        frame
    }
}
