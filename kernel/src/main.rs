#![feature(abi_x86_interrupt)]
#![no_std]
#![no_main]
extern crate alloc;

mod acpi_handler;
mod apic;
mod ata;
mod console;
mod cpu;
mod filesystem;
mod fixed_point;
mod interrupts;
mod memory;
mod panic;
mod process;
mod thread;
mod vm;

use alloc::{boxed::Box, string::String};
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::VirtAddr;

use bootloader_api::config::Mapping;
use bootloader_api::{BootInfo, BootloaderConfig};

use console::Console;
use cpu::{Cpus, PerCpu};
use filesystem::{devfs::Devfs, ramdisk::Ramdisk, vfs::VirtualFileSystem};
use memory::PhysicalMemoryManager;

/// One CPU's private data (GDT, TSS, the thread currently running on it).
/// Only one core is brought up; see [`cpu::Cpus`]'s own doc comment.
pub static CPUS: OnceCell<Cpus> = OnceCell::uninit();

/// The physical frame allocator, behind the same lock `x86_64`'s mapper
/// trait and [`vm::frame::PhysicalFrameAllocator`] both expect.
pub static PMM: OnceCell<Mutex<PhysicalMemoryManager>> = OnceCell::uninit();

/// The single mounted filesystem tree (initrd + devfs). Reads/writes go
/// through this directly rather than a lock — the backing filesystems
/// serialize themselves internally (see `FS_LOCK` for the one operation,
/// `exec`'s file load, that needs a coarser guarantee).
pub static VFS: OnceCell<VirtualFileSystem> = OnceCell::uninit();

/// Global physical frame ownership + FIFO eviction order (component I).
pub static FRAME_TABLE: OnceCell<Mutex<vm::frame::FrameTable>> = OnceCell::uninit();

/// The anonymous swap disk.
pub static SWAP: OnceCell<Mutex<vm::swap::SwapTable<ata::AtaPio>>> = OnceCell::uninit();

/// Virtual address the bootloader mapped the whole of physical memory at;
/// set once during [`memory::init`] and consulted by every direct
/// physical-frame access thereafter (page tables, frame copies, MMIO).
pub static PHYS_MEM_OFFSET: OnceCell<u64> = OnceCell::uninit();

/// Coarse lock serializing filesystem access across tasks (pintos'
/// single filesystem lock), taken only around `exec`'s binary load.
pub static FS_LOCK: OnceCell<Mutex<()>> = OnceCell::uninit();

/// Scratch virtual addresses the LAPIC/IOAPIC MMIO registers are mapped at.
/// Plain constants rather than `OnceCell`s: nothing else ever contends for
/// this range, so there is nothing to race during the one-time mapping.
pub const LAPIC_START_VIRT: u64 = 0xffff_d000_0000_0000;
pub const IOAPIC_START_VIRT: u64 = 0xffff_d000_0000_1000;

/// Number of 4 KiB pages the swap disk can hold at once.
const SWAP_SLOTS: usize = 4096;

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

bootloader_api::entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    let framebuffer = boot_info.framebuffer.as_mut().expect("bootloader did not provide a framebuffer");
    unsafe { panic::PANIC_FRAMEBUFFER = Some(&raw mut *framebuffer) };

    let console = Console::new(framebuffer);

    let phys_mem_offset = VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader did not map physical memory"),
    );

    let (mut mapper, pmm) = unsafe { memory::init(phys_mem_offset, &boot_info.memory_regions) };
    PHYS_MEM_OFFSET.init_once(|| phys_mem_offset.as_u64());
    PMM.init_once(|| Mutex::new(pmm));
    FRAME_TABLE.init_once(|| Mutex::new(vm::frame::FrameTable::new()));

    let cpus = Cpus::new(unsafe { PerCpu::init_cpu() });
    CPUS.init_once(|| cpus);
    let cpu: &'static mut PerCpu = unsafe { &mut *(CPUS.get().unwrap().get_cpu() as *mut PerCpu) };
    unsafe { cpu.init_gdt() };

    interrupts::init_idt();

    let rsdp_addr = boot_info.rsdp_addr.into_option().expect("bootloader did not provide an RSDP address");
    let handler = acpi_handler::Handler { phys_offset: phys_mem_offset };
    let acpi_tables = unsafe { ::acpi::AcpiTables::from_rsdp(handler, rsdp_addr as usize) }.expect("failed to parse ACPI tables");
    let platform_info = acpi_tables.platform_info().expect("failed to read ACPI platform info");

    apic::enable(&mut mapper, &platform_info.interrupt_model);

    // `-o mlfqs` selects the MLFQ scheduler in the original Pintos command
    // line; `bootloader_api` has no equivalent argv channel to this kernel,
    // so the strict-priority scheduler is always the one that boots.
    thread::scheduler::init(false);

    process::ProcessTable::init();

    let mut vfs = VirtualFileSystem::new();
    let ramdisk_addr = boot_info.ramdisk_addr.into_option().expect("bootloader did not provide a ramdisk");
    let ramdisk_len = boot_info.ramdisk_len as usize;
    let archive: &'static [u8] = unsafe { core::slice::from_raw_parts((phys_mem_offset.as_u64() + ramdisk_addr) as *const u8, ramdisk_len) };
    vfs.mount(1, Box::new(unsafe { Ramdisk::from_tar(1, archive) }), "initrd", 0).expect("failed to mount initrd");
    vfs.mount(2, Box::new(Devfs::init(console, 2)), "dev", 0).expect("failed to mount devfs");
    VFS.init_once(|| vfs);

    SWAP.init_once(|| Mutex::new(vm::swap::SwapTable::new(unsafe { ata::AtaPio::new() }, SWAP_SLOTS)));
    FS_LOCK.init_once(|| Mutex::new(()));

    process::lifecycle::create_initd(&cmdline());

    x86_64::instructions::interrupts::enable();
    thread::scheduler::yield_execution();

    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// The program run as pid 1. Hard-coded rather than parsed from a
/// bootloader command line (see the note in [`kernel_main`]).
fn cmdline() -> String {
    String::from("/sh")
}
