//! Components J/K: the supplemental page table and the page-lifecycle
//! dispatch over its three variants.
//!
//! Per Design Notes §9, the source's vtable-of-function-pointers per page
//! type becomes a tagged enum here; the *uninit → anon/file* transmutation
//! on first fault is modelled by `Page::swap_in` replacing `self.kind`
//! rather than reinterpreting memory in place.

use alloc::vec::Vec;
use hashbrown::HashMap;

use super::{round_down_to_page, swap::Swap, File, FaultError, FrameNumber, PAGE_SIZE};

/// What an uninitialised page becomes the first time it's claimed.
#[derive(Clone)]
pub enum Initializer<F: File> {
    /// Fresh anonymous page (stack growth, or an anon page with no file
    /// backing at all).
    ZeroFill,
    /// The executable-segment case: read `read_bytes` from `file` at
    /// `offset`, zero-fill the remaining `zero_bytes`.
    LoadFile {
        file: F,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
        owns_file: bool,
    },
}

#[derive(Clone)]
pub enum PageKind<F: File> {
    Uninit(Initializer<F>),
    Anon {
        slot: Option<usize>,
    },
    File {
        file: F,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
        owns_file: bool,
    },
}

#[derive(Clone, Copy, Default)]
pub struct Marker {
    pub stack: bool,
    pub executable_segment: bool,
    pub mmap: bool,
}

pub struct Page<F: File> {
    pub va: u64,
    pub writable: bool,
    pub frame: Option<FrameNumber>,
    pub marker: Marker,
    pub kind: PageKind<F>,
}

impl<F: File> Page<F> {
    pub fn new_uninit(va: u64, writable: bool, marker: Marker, init: Initializer<F>) -> Page<F> {
        Page {
            va: round_down_to_page(va),
            writable,
            frame: None,
            marker,
            kind: PageKind::Uninit(init),
        }
    }

    pub fn new_anon(va: u64, writable: bool, marker: Marker) -> Page<F> {
        Page {
            va: round_down_to_page(va),
            writable,
            frame: None,
            marker,
            kind: PageKind::Anon { slot: None },
        }
    }

    /// Materialises the page into `frame`, whose contents are `bytes`
    /// (read/write view of the frame through the kernel's direct mapping).
    /// On success, `self.frame` is set and uninit pages transmute into
    /// their target variant.
    pub fn swap_in(
        &mut self,
        frame: FrameNumber,
        bytes: &mut [u8; PAGE_SIZE as usize],
        swap: &mut dyn Swap,
    ) -> Result<(), FaultError> {
        match &mut self.kind {
            PageKind::Uninit(init) => {
                let next = match init {
                    Initializer::ZeroFill => {
                        bytes.fill(0);
                        PageKind::Anon { slot: None }
                    }
                    Initializer::LoadFile { file, offset, read_bytes, zero_bytes, owns_file } => {
                        let read_bytes = *read_bytes as usize;
                        let n = file.read(*offset, &mut bytes[..read_bytes]);
                        bytes[n..].fill(0);
                        PageKind::File {
                            file: file.clone(),
                            offset: *offset,
                            read_bytes: read_bytes as u32,
                            zero_bytes: *zero_bytes,
                            owns_file: *owns_file,
                        }
                    }
                };
                self.kind = next;
            }
            PageKind::Anon { slot } => match slot.take() {
                Some(s) => swap.read_in(s, bytes),
                None => bytes.fill(0),
            },
            PageKind::File { file, offset, read_bytes, .. } => {
                let read_bytes = *read_bytes as usize;
                let n = file.read(*offset, &mut bytes[..read_bytes]);
                bytes[n..].fill(0);
            }
        }
        self.frame = Some(frame);
        Ok(())
    }

    /// Evicts the page, preserving enough state (swap slot, file offset)
    /// to be faulted back in later. `dirty` comes from the hardware PTE's
    /// dirty bit, read by the caller before this is invoked.
    pub fn swap_out(&mut self, bytes: &[u8; PAGE_SIZE as usize], dirty: bool, swap: &mut dyn Swap) -> Result<(), FaultError> {
        match &mut self.kind {
            PageKind::Uninit(_) => unreachable!("an uninit page is never resident"),
            PageKind::Anon { slot } => {
                let new_slot = match *slot {
                    Some(s) => {
                        swap.rewrite(s, bytes);
                        s
                    }
                    None => swap.write_out(bytes).map_err(|_| FaultError::Unmapped)?,
                };
                *slot = Some(new_slot);
            }
            PageKind::File { file, offset, read_bytes, .. } => {
                if dirty {
                    file.write(*offset, &bytes[..*read_bytes as usize]);
                }
            }
        }
        self.frame = None;
        Ok(())
    }

    /// Tears the page down for good (process exit / SPT copy rollback).
    /// Writes back a dirty file-backed page if it is still resident.
    pub fn destroy(&mut self, bytes: Option<&[u8; PAGE_SIZE as usize]>, dirty: bool, swap: &mut dyn Swap) {
        match &mut self.kind {
            PageKind::Uninit(_) => {}
            PageKind::Anon { slot } => {
                if let Some(s) = slot.take() {
                    swap.free_slot_only(s);
                }
            }
            PageKind::File { file, offset, read_bytes, owns_file, .. } => {
                if dirty {
                    if let Some(bytes) = bytes {
                        file.write(*offset, &bytes[..*read_bytes as usize]);
                    }
                }
                if *owns_file {
                    file.allow_write();
                }
            }
        }
        self.frame = None;
    }
}

/// What a child's SPT needs in order to duplicate one of the parent's
/// pages, per §4.7's `copy`. Frame allocation and physical-memory reads
/// are hardware-specific, so this stops short of actually doing them —
/// the caller (process lifecycle, during fork) drives the rest.
pub enum ForkedPage<F: File> {
    /// Install as-is; materialises lazily on the child's own first fault.
    Lazy(Page<F>),
    /// An anonymous page that was resident in the parent. The caller must
    /// claim a frame for `va` in the child's address space, copy `bytes`
    /// into it, and finish the page with `Page::finish_fork`.
    NeedsFrame(Page<F>, [u8; PAGE_SIZE as usize]),
}

impl<F: File> Page<F> {
    fn shell(&self) -> Page<F> {
        Page { va: self.va, writable: self.writable, frame: None, marker: self.marker, kind: PageKind::Anon { slot: None } }
    }

    /// Computes what the child needs for this page. `resident_bytes` must
    /// be `Some` for any `Anon` page the parent currently has mapped to a
    /// frame (the source `copy` rejects nothing else, but a swapped-out
    /// anon page must be faulted back into the parent first so its bytes
    /// can be read — the caller's responsibility).
    pub fn fork_copy(&self, resident_bytes: Option<&[u8; PAGE_SIZE as usize]>) -> Result<ForkedPage<F>, ()> {
        // A mapped file region must diverge independently in parent and
        // child once either writes to it — sharing the file handle the way
        // an executable segment does would let one side's write silently
        // show up in the other's mapping. The caller is responsible for
        // having faulted the page in first so there are bytes to copy.
        if self.marker.mmap {
            let bytes = *resident_bytes.ok_or(())?;
            return Ok(ForkedPage::NeedsFrame(self.shell(), bytes));
        }

        match &self.kind {
            PageKind::Uninit(Initializer::LoadFile { .. }) if self.marker.executable_segment => {
                Ok(ForkedPage::Lazy(Page { kind: self.kind.clone(), ..self.shell() }))
            }
            PageKind::Uninit(_) => Err(()),
            PageKind::Anon { .. } => {
                let bytes = *resident_bytes.ok_or(())?;
                Ok(ForkedPage::NeedsFrame(self.shell(), bytes))
            }
            PageKind::File { file, offset, read_bytes, zero_bytes, .. } => Ok(ForkedPage::Lazy(Page {
                kind: PageKind::File { file: file.clone(), offset: *offset, read_bytes: *read_bytes, zero_bytes: *zero_bytes, owns_file: false },
                ..self.shell()
            })),
        }
    }

    /// Completes a `NeedsFrame` duplication once the caller has copied the
    /// bytes into `frame`.
    pub fn finish_fork(mut page: Page<F>, frame: FrameNumber) -> Page<F> {
        page.frame = Some(frame);
        page
    }
}

/// Per-process hash map from page-aligned user virtual address to page descriptor.
pub struct SupplementalPageTable<F: File> {
    pages: HashMap<u64, Page<F>>,
}

impl<F: File> SupplementalPageTable<F> {
    pub fn new() -> Self {
        SupplementalPageTable { pages: HashMap::new() }
    }

    pub fn find(&self, va: u64) -> Option<&Page<F>> {
        self.pages.get(&round_down_to_page(va))
    }

    pub fn find_mut(&mut self, va: u64) -> Option<&mut Page<F>> {
        self.pages.get_mut(&round_down_to_page(va))
    }

    /// Fails (returns `false`) if the key is already present.
    pub fn insert(&mut self, page: Page<F>) -> bool {
        let key = page.va;
        if self.pages.contains_key(&key) {
            return false;
        }
        self.pages.insert(key, page);
        true
    }

    pub fn remove(&mut self, va: u64) -> Option<Page<F>> {
        self.pages.remove(&round_down_to_page(va))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page<F>> {
        self.pages.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Page<F>> {
        self.pages.values_mut()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Destroys every entry, writing back dirty file-backed pages. Returns
    /// the frames that were resident so the caller (which owns the global
    /// frame table) can return them to the pool.
    pub fn kill(
        &mut self,
        swap: &mut dyn Swap,
        mut is_dirty: impl FnMut(u64) -> bool,
        mut read_frame: impl FnMut(FrameNumber) -> [u8; PAGE_SIZE as usize],
    ) -> Vec<FrameNumber> {
        let mut freed = Vec::new();
        for (_, mut page) in self.pages.drain() {
            let frame = page.frame;
            let dirty = frame.map(|_| is_dirty(page.va)).unwrap_or(false);
            let bytes = frame.map(&mut read_frame);
            page.destroy(bytes.as_ref(), dirty, swap);
            if let Some(f) = frame {
                freed.push(f);
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{rc::Rc, vec::Vec};
    use core::cell::RefCell;

    #[derive(Clone)]
    struct FakeFile(Rc<RefCell<Vec<u8>>>);

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
        fn write_out(&mut self, _page: &[u8; PAGE_SIZE as usize]) -> Result<usize, super::super::SwapError> {
            Ok(0)
        }
        fn rewrite(&mut self, _slot: usize, _page: &[u8; PAGE_SIZE as usize]) {}
        fn read_in(&mut self, _slot: usize, page: &mut [u8; PAGE_SIZE as usize]) {
            page.fill(0);
        }
        fn free_slot_only(&mut self, _slot: usize) {}
    }

    #[test]
    fn insert_rejects_duplicate_key() {
        let mut spt: SupplementalPageTable<FakeFile> = SupplementalPageTable::new();
        assert!(spt.insert(Page::new_anon(0x1000, true, Marker::default())));
        assert!(!spt.insert(Page::new_anon(0x1000, true, Marker::default())));
    }

    #[test]
    fn uninit_load_file_transmutes_to_file_backed() {
        let backing = Rc::new(RefCell::new(alloc::vec![7u8; 4096]));
        let file = FakeFile(backing);
        let mut page = Page::new_uninit(
            0x400000,
            false,
            Marker { executable_segment: true, ..Default::default() },
            Initializer::LoadFile { file, offset: 0, read_bytes: 10, zero_bytes: 4086, owns_file: false },
        );

        let mut bytes = [0xffu8; PAGE_SIZE as usize];
        let mut swap = NullSwap;
        page.swap_in(FrameNumber(0), &mut bytes, &mut swap).unwrap();

        assert!(bytes[..10].iter().all(|b| *b == 7));
        assert!(bytes[10..].iter().all(|b| *b == 0));
        assert!(matches!(page.kind, PageKind::File { .. }));
    }

    #[test]
    fn anon_round_trips_through_swap_out_swap_in() {
        let mut page = Page::new_anon(0x500000, true, Marker::default());
        let mut bytes = [42u8; PAGE_SIZE as usize];
        struct RecordingSwap {
            stored: Option<[u8; PAGE_SIZE as usize]>,
        }
        impl Swap for RecordingSwap {
            fn write_out(&mut self, page: &[u8; PAGE_SIZE as usize]) -> Result<usize, super::super::SwapError> {
                self.stored = Some(*page);
                Ok(0)
            }
            fn rewrite(&mut self, _slot: usize, page: &[u8; PAGE_SIZE as usize]) {
                self.stored = Some(*page);
            }
            fn read_in(&mut self, _slot: usize, page: &mut [u8; PAGE_SIZE as usize]) {
                *page = self.stored.unwrap();
            }
            fn free_slot_only(&mut self, _slot: usize) {}
        }
        let mut swap = RecordingSwap { stored: None };

        page.swap_out(&bytes, false, &mut swap).unwrap();
        assert!(page.frame.is_none());

        let mut back = [0u8; PAGE_SIZE as usize];
        page.swap_in(FrameNumber(1), &mut back, &mut swap).unwrap();
        assert_eq!(bytes, back);
    }

    #[test]
    fn mmap_page_forks_as_independent_copy_not_shared_file() {
        let backing = Rc::new(RefCell::new(alloc::vec![9u8; 4096]));
        let file = FakeFile(backing);
        let page = Page {
            va: 0x600000,
            writable: true,
            frame: Some(FrameNumber(3)),
            marker: Marker { mmap: true, ..Default::default() },
            kind: PageKind::File { file, offset: 0, read_bytes: 4096, zero_bytes: 0, owns_file: true },
        };

        let resident = [9u8; PAGE_SIZE as usize];
        let forked = page.fork_copy(Some(&resident)).unwrap();

        match forked {
            ForkedPage::NeedsFrame(shell, bytes) => {
                assert!(matches!(shell.kind, PageKind::Anon { slot: None }));
                assert_eq!(bytes, resident);
            }
            ForkedPage::Lazy(_) => panic!("mmap page must not share its file handle across fork"),
        }
    }

    #[test]
    fn mmap_page_without_resident_bytes_cannot_fork() {
        let backing = Rc::new(RefCell::new(alloc::vec![0u8; 4096]));
        let file = FakeFile(backing);
        let page = Page {
            va: 0x700000,
            writable: true,
            frame: None,
            marker: Marker { mmap: true, ..Default::default() },
            kind: PageKind::File { file, offset: 0, read_bytes: 4096, zero_bytes: 0, owns_file: false },
        };

        assert!(page.fork_copy(None).is_err());
    }
}
