//! Component M: memory-mapped files. Builds on the same `File`-backed page
//! kind the ELF loader uses, tagged with the `mmap` marker bit so `munmap`
//! can find exactly the pages it owns and write back whichever are dirty.

use alloc::vec::Vec;

use super::{
    round_down_to_page,
    spt::{Initializer, Marker, Page, SupplementalPageTable},
    swap::Swap,
    File, FrameNumber, PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    BadAddress,
    BadLength,
    BadOffset,
    Overlaps,
}

/// Registers lazy pages covering `[addr, addr + length)`. `file` must
/// already be a fresh `reopen`ed handle (the caller's responsibility, per
/// §6) so `munmap` is free to tear it down without disturbing the
/// process's own fd. The first page records `owns_file = true`.
pub fn mmap<F: File>(
    spt: &mut SupplementalPageTable<F>,
    addr: u64,
    length: u64,
    writable: bool,
    file: F,
    offset: u64,
) -> Result<(), MmapError> {
    if addr == 0 || addr % PAGE_SIZE != 0 {
        return Err(MmapError::BadAddress);
    }
    if length == 0 {
        return Err(MmapError::BadLength);
    }
    if offset % PAGE_SIZE != 0 {
        return Err(MmapError::BadOffset);
    }

    let file_len = file.length();
    let mut inserted = Vec::new();
    let mut va = addr;
    let mut file_offset = offset;
    let mut remaining = length;
    let mut first = true;

    while remaining > 0 {
        let chunk = remaining.min(PAGE_SIZE);
        let read_bytes = chunk.min(file_len.saturating_sub(file_offset)) as u32;
        let zero_bytes = PAGE_SIZE as u32 - read_bytes;

        let init = Initializer::LoadFile {
            file: file.clone(),
            offset: file_offset,
            read_bytes,
            zero_bytes,
            owns_file: first,
        };
        let page = Page::new_uninit(va, writable, Marker { mmap: true, ..Default::default() }, init);

        if !spt.insert(page) {
            for v in inserted {
                spt.remove(v);
            }
            return Err(MmapError::Overlaps);
        }
        inserted.push(va);

        va += PAGE_SIZE;
        file_offset += PAGE_SIZE;
        remaining -= chunk;
        first = false;
    }

    Ok(())
}

/// Tears down every mapped page in `[addr, addr + length)`, writing back
/// any that are dirty. Returns the frames that were resident so the
/// caller can return them to the global frame table.
pub fn munmap<F: File>(
    spt: &mut SupplementalPageTable<F>,
    addr: u64,
    length: u64,
    swap: &mut dyn Swap,
    mut is_dirty: impl FnMut(u64) -> bool,
    mut read_frame: impl FnMut(FrameNumber) -> [u8; PAGE_SIZE as usize],
) -> Vec<FrameNumber> {
    let mut freed = Vec::new();
    let mut va = round_down_to_page(addr);
    let end = addr + length;

    while va < end {
        if let Some(mut page) = spt.remove(va) {
            let frame = page.frame;
            let dirty = frame.is_some() && is_dirty(va);
            let bytes = frame.map(&mut read_frame);
            page.destroy(bytes.as_ref(), dirty, swap);
            if let Some(f) = frame {
                freed.push(f);
            }
        }
        va += PAGE_SIZE;
    }

    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{spt::PageKind, SwapError};
    use alloc::{rc::Rc, vec::Vec as AVec};
    use core::cell::RefCell;

    #[derive(Clone)]
    struct FakeFile(Rc<RefCell<AVec<u8>>>);

    impl File for FakeFile {
        fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
            let data = self.0.borrow();
            let start = offset as usize;
            if start >= data.len() {
                return 0;
            }
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            n
        }
        fn write(&self, offset: u64, buf: &[u8]) -> usize {
            let mut data = self.0.borrow_mut();
            let start = offset as usize;
            if data.len() < start + buf.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
            buf.len()
        }
        fn length(&self) -> u64 {
            self.0.borrow().len() as u64
        }
        fn deny_write(&self) {}
        fn allow_write(&self) {}
    }

    struct NullSwap;
    impl Swap for NullSwap {
        fn write_out(&mut self, _page: &[u8; PAGE_SIZE as usize]) -> Result<usize, SwapError> {
            Ok(0)
        }
        fn rewrite(&mut self, _slot: usize, _page: &[u8; PAGE_SIZE as usize]) {}
        fn read_in(&mut self, _slot: usize, page: &mut [u8; PAGE_SIZE as usize]) {
            page.fill(0);
        }
        fn free_slot_only(&mut self, _slot: usize) {}
    }

    #[test]
    fn rejects_null_address() {
        let mut spt: SupplementalPageTable<FakeFile> = SupplementalPageTable::new();
        let file = FakeFile(Rc::new(RefCell::new(alloc::vec![0u8; 4096])));
        assert_eq!(mmap(&mut spt, 0, 4096, true, file, 0), Err(MmapError::BadAddress));
    }

    #[test]
    fn three_page_mapping_writes_back_dirty_pages_on_unmap() {
        let mut spt: SupplementalPageTable<FakeFile> = SupplementalPageTable::new();
        let backing = Rc::new(RefCell::new(alloc::vec![0u8; 3 * PAGE_SIZE as usize]));
        let file = FakeFile(backing.clone());

        mmap(&mut spt, 0x10000, 3 * PAGE_SIZE, true, file, 0).unwrap();
        assert_eq!(spt.len(), 3);

        let mut frames = [[0u8; PAGE_SIZE as usize]; 3];
        for (i, f) in frames.iter_mut().enumerate() {
            f.fill((i + 1) as u8);
        }

        for (i, f) in frames.iter().enumerate() {
            let va = 0x10000 + i as u64 * PAGE_SIZE;
            let page = spt.find_mut(va).unwrap();
            let mut scratch = *f;
            let mut swap = NullSwap;
            page.swap_in(FrameNumber(i as u64), &mut scratch, &mut swap).unwrap();
            assert!(matches!(page.kind, PageKind::File { .. }));
        }

        let mut swap = NullSwap;
        let freed = munmap(&mut spt, 0x10000, 3 * PAGE_SIZE, &mut swap, |_va| true, |f| frames[f.0 as usize]);

        assert_eq!(freed.len(), 3);
        assert!(spt.is_empty());
        assert_eq!(&backing.borrow()[..], frames.concat().as_slice());
    }
}
