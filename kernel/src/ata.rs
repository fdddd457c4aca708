//! ATA PIO disk driver, primary bus / master drive only. Backs the swap
//! disk ([`crate::vm::swap::SwapTable`]); grounded on the Dentosal pack's
//! `driver_ata_pio` module (no disk driver exists in the donor crate),
//! adapted from `cpuio::UnsafePort` busy-sleeps to a status-register
//! poll loop, this crate's usual style for hardware waits (see
//! `apic::pic::initialise`'s port-0x80 delay).

use x86_64::instructions::port::Port;

use crate::vm::BlockDevice;

const PORT_DATA: u16 = 0x1F0;
const PORT_SECCOUNT: u16 = 0x1F2;
const PORT_LBA0: u16 = 0x1F3;
const PORT_LBA1: u16 = 0x1F4;
const PORT_LBA2: u16 = 0x1F5;
const PORT_DRIVESELECT: u16 = 0x1F6;
const PORT_COMMAND: u16 = 0x1F7;
const PORT_DEV_CTRL: u16 = 0x3F6;

const CMD_READ: u8 = 0x20;
const CMD_WRITE: u8 = 0x30;

const STATUS_BSY: u8 = 1 << 7;
const STATUS_DRQ: u8 = 1 << 3;

/// Primary bus, master drive, LBA28 addressing. `Send + Sync` because every
/// access goes through port I/O rather than shared memory; callers
/// serialize concurrent access themselves (the swap table is behind a
/// single global lock).
pub struct AtaPio;

impl AtaPio {
    /// # Safety
    /// Must be constructed after the PIC/APIC transition so nothing else
    /// owns ports 0x1F0-0x1F7/0x3F6, and only once — two live instances
    /// would race on the same controller.
    pub unsafe fn new() -> Self {
        unsafe { Self::reset() };
        AtaPio
    }

    unsafe fn reset() {
        let mut ctrl = Port::<u8>::new(PORT_DEV_CTRL);
        unsafe {
            ctrl.write(0u8);
            // 400ns delay, four status reads per the OSDev software-reset recipe.
            for _ in 0..4 {
                let _: u8 = ctrl.read();
            }
            while ctrl.read() & (STATUS_BSY | 0x40) != 0x40 {}
        }
    }

    unsafe fn wait_ready() {
        let mut command = Port::<u8>::new(PORT_COMMAND);
        unsafe { while command.read() & STATUS_BSY != 0 {} }
    }

    unsafe fn wait_drq() {
        let mut command = Port::<u8>::new(PORT_COMMAND);
        unsafe {
            loop {
                let status = command.read();
                if status & STATUS_BSY != 0 {
                    continue;
                }
                if status & STATUS_DRQ != 0 {
                    return;
                }
            }
        }
    }

    unsafe fn select_lba(lba: u64, sectors: u8) {
        unsafe {
            let mut drive_select = Port::<u8>::new(PORT_DRIVESELECT);
            let mut seccount = Port::<u8>::new(PORT_SECCOUNT);
            let mut lba0 = Port::<u8>::new(PORT_LBA0);
            let mut lba1 = Port::<u8>::new(PORT_LBA1);
            let mut lba2 = Port::<u8>::new(PORT_LBA2);

            drive_select.write(0xe0 | ((lba >> 24) & 0x0f) as u8);
            seccount.write(sectors);
            lba0.write((lba & 0xff) as u8);
            lba1.write(((lba >> 8) & 0xff) as u8);
            lba2.write(((lba >> 16) & 0xff) as u8);
        }
    }
}

impl BlockDevice for AtaPio {
    fn read_sector(&self, sector: u64, buf: &mut [u8; 512]) {
        assert!(sector < (1 << 28), "LBA48 not supported by this driver");
        unsafe {
            Self::wait_ready();
            Self::select_lba(sector, 1);
            Port::<u8>::new(PORT_COMMAND).write(CMD_READ);
            Self::wait_drq();

            let mut data = Port::<u16>::new(PORT_DATA);
            for chunk in buf.chunks_exact_mut(2) {
                let word = data.read();
                chunk[0] = (word & 0xff) as u8;
                chunk[1] = (word >> 8) as u8;
            }
        }
    }

    fn write_sector(&self, sector: u64, buf: &[u8; 512]) {
        assert!(sector < (1 << 28), "LBA48 not supported by this driver");
        unsafe {
            Self::wait_ready();
            Self::select_lba(sector, 1);
            Port::<u8>::new(PORT_COMMAND).write(CMD_WRITE);
            Self::wait_drq();

            let mut data = Port::<u16>::new(PORT_DATA);
            for chunk in buf.chunks_exact(2) {
                data.write(chunk[0] as u16 | ((chunk[1] as u16) << 8));
            }
            Self::wait_ready();
        }
    }
}
