//! `vm::File` over the VFS inode, so the supplemental page table can treat
//! an ELF segment, an mmap region, or a shared fork-inherited executable
//! the same way regardless of which underlying filesystem backs it.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::vm;

use super::vfs::{Filesystem, Inode};

impl vm::File for Arc<Inode> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
        crate::VFS.get().expect("filesystem not mounted").read(self.clone(), offset, buf).unwrap_or(0)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> usize {
        if self.write_denied.load(Ordering::SeqCst) > 0 {
            return 0;
        }
        crate::VFS.get().expect("filesystem not mounted").write(self.clone(), offset, buf).unwrap_or(0)
    }

    fn length(&self) -> u64 {
        self.size as u64
    }

    fn deny_write(&self) {
        self.write_denied.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_write(&self) {
        self.write_denied.fetch_sub(1, Ordering::SeqCst);
    }
}
