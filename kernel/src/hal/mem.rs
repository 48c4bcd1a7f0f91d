//! In-memory reference HAL.
//!
//! [`MemHal`] implements every collaborator trait over plain maps so the
//! whole core runs on a host: frames are heap buffers, address spaces are
//! page maps, swap files are byte vectors, and context swaps are recorded
//! rather than performed. Hosted deployments that need real suspension
//! (the scenario tests do) substitute their own [`ContextOps`] /
//! [`CpuOps`] / [`TrapReturn`] while keeping the memory side of this
//! implementation.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use super::{
    AddressSpaceOps, BackingStore, ContextId, ContextOps, CpuOps, FileHandle, FileOps,
    FrameAlloc, FsOps, InodeHandle, PageTableOps, PhysPage, PteFlags, SpaceId, SwapHandle,
    TrapReturn,
};
use crate::config::PAGE_SIZE;
use crate::error::KernelError;

/// Root directory inode.
const ROOT_INO: InodeHandle = InodeHandle(1);

struct FrameStore {
    free: usize,
    total: usize,
    mem: HashMap<PhysPage, Box<[u8]>>,
}

#[derive(Clone)]
struct Pte {
    flags: PteFlags,
    frame: Option<PhysPage>,
}

/// One simulated address space: a map from page-aligned virtual address
/// to entry.
struct Space {
    pages: HashMap<u64, Pte>,
}

/// In-memory implementation of the whole collaborator bundle.
pub struct MemHal {
    frames: Mutex<FrameStore>,
    spaces: Mutex<HashMap<SpaceId, Space>>,
    swap_files: Mutex<HashMap<SwapHandle, Vec<u8>>>,
    file_refs: Mutex<HashMap<FileHandle, u32>>,
    inode_refs: Mutex<HashMap<InodeHandle, u32>>,
    contexts: Mutex<HashMap<ContextId, bool>>,
    swap_log: Mutex<Vec<(ContextId, ContextId)>>,
    active: Mutex<Option<SpaceId>>,
    next_id: AtomicU64,
    intr: AtomicBool,
}

impl MemHal {
    /// A HAL backed by `total_frames` physical pages.
    pub fn new(total_frames: usize) -> Self {
        MemHal {
            frames: Mutex::new(FrameStore {
                free: total_frames,
                total: total_frames,
                mem: HashMap::new(),
            }),
            spaces: Mutex::new(HashMap::new()),
            swap_files: Mutex::new(HashMap::new()),
            file_refs: Mutex::new(HashMap::new()),
            inode_refs: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            swap_log: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            next_id: AtomicU64::new(2), // 1 is the root inode
            intr: AtomicBool::new(true),
        }
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a host-side file handle with one reference. Stands in for the
    /// descriptor layer, which is outside the core.
    pub fn open_file(&self) -> FileHandle {
        let f = FileHandle(self.fresh_id());
        self.file_refs.lock().insert(f, 1);
        f
    }

    /// Live reference count of a file handle (0 = closed).
    pub fn file_refs(&self, f: FileHandle) -> u32 {
        self.file_refs.lock().get(&f).copied().unwrap_or(0)
    }

    /// Live reference count of an inode.
    pub fn inode_refs(&self, ino: InodeHandle) -> u32 {
        self.inode_refs.lock().get(&ino).copied().unwrap_or(0)
    }

    /// Full contents of a swap file, if it still exists.
    pub fn swap_file_bytes(&self, file: SwapHandle) -> Option<Vec<u8>> {
        self.swap_files.lock().get(&file).cloned()
    }

    /// Number of swap files currently in existence.
    pub fn swap_file_count(&self) -> usize {
        self.swap_files.lock().len()
    }

    /// The space most recently activated on the (single) simulated core.
    pub fn active_space(&self) -> Option<SpaceId> {
        *self.active.lock()
    }

    /// Context swaps recorded so far, oldest first.
    pub fn swaps(&self) -> Vec<(ContextId, ContextId)> {
        self.swap_log.lock().clone()
    }

    fn with_pte<R>(
        &self,
        space: SpaceId,
        va: u64,
        f: impl FnOnce(&mut FrameStore, &mut Pte) -> Result<R, KernelError>,
    ) -> Result<R, KernelError> {
        let mut frames = self.frames.lock();
        let mut spaces = self.spaces.lock();
        let sp = spaces.get_mut(&space).ok_or(KernelError::WalkFailed)?;
        let pte = sp
            .pages
            .get_mut(&page_base(va))
            .ok_or(KernelError::WalkFailed)?;
        f(&mut frames, pte)
    }
}

fn page_base(va: u64) -> u64 {
    va & !(PAGE_SIZE as u64 - 1)
}

impl FrameStore {
    fn alloc(&mut self, next: &AtomicU64) -> Option<PhysPage> {
        if self.free == 0 {
            return None;
        }
        self.free -= 1;
        let frame = PhysPage(next.fetch_add(1, Ordering::Relaxed));
        self.mem.insert(frame, vec![0u8; PAGE_SIZE].into_boxed_slice());
        Some(frame)
    }

    fn release(&mut self, frame: PhysPage) {
        if self.mem.remove(&frame).is_some() {
            self.free += 1;
        }
    }
}

impl FrameAlloc for MemHal {
    fn alloc(&self) -> Option<PhysPage> {
        self.frames.lock().alloc(&self.next_id)
    }

    fn free(&self, frame: PhysPage) {
        self.frames.lock().release(frame);
    }

    fn free_frames(&self) -> usize {
        self.frames.lock().free
    }

    fn total_frames(&self) -> usize {
        self.frames.lock().total
    }
}

impl AddressSpaceOps for MemHal {
    fn create(&self) -> Result<SpaceId, KernelError> {
        let id = SpaceId(self.fresh_id());
        self.spaces.lock().insert(id, Space { pages: HashMap::new() });
        Ok(id)
    }

    fn destroy(&self, space: SpaceId, _sz: usize) {
        let mut frames = self.frames.lock();
        if let Some(sp) = self.spaces.lock().remove(&space) {
            for (_, pte) in sp.pages {
                if let Some(frame) = pte.frame {
                    frames.release(frame);
                }
            }
        }
    }

    fn duplicate(&self, space: SpaceId, sz: usize) -> Result<SpaceId, KernelError> {
        let mut frames = self.frames.lock();
        let mut spaces = self.spaces.lock();
        let src = spaces.get(&space).ok_or(KernelError::WalkFailed)?;

        let mut pages: HashMap<u64, Pte> = HashMap::new();
        for (&va, pte) in src.pages.iter().filter(|(&va, _)| (va as usize) < sz) {
            let frame = match pte.frame {
                Some(old) => {
                    let new = match frames.alloc(&self.next_id) {
                        Some(f) => f,
                        None => {
                            // Unwind the half-built copy.
                            for (_, p) in pages {
                                if let Some(f) = p.frame {
                                    frames.release(f);
                                }
                            }
                            return Err(KernelError::OutOfMemory);
                        }
                    };
                    let bytes = frames.mem[&old].clone();
                    frames.mem.insert(new, bytes);
                    Some(new)
                }
                None => None,
            };
            pages.insert(va, Pte { flags: pte.flags, frame });
        }

        let id = SpaceId(self.fresh_id());
        spaces.insert(id, Space { pages });
        Ok(id)
    }

    fn grow(&self, space: SpaceId, old: usize, new: usize) -> Result<usize, KernelError> {
        let mut frames = self.frames.lock();
        let mut spaces = self.spaces.lock();
        let sp = spaces.get_mut(&space).ok_or(KernelError::WalkFailed)?;

        let first = page_base(old as u64 + PAGE_SIZE as u64 - 1);
        let mut mapped = Vec::new();
        let mut va = first;
        while (va as usize) < new {
            match frames.alloc(&self.next_id) {
                Some(frame) => {
                    sp.pages.insert(
                        va,
                        Pte {
                            flags: PteFlags::PRESENT | PteFlags::WRITABLE,
                            frame: Some(frame),
                        },
                    );
                    mapped.push(va);
                }
                None => {
                    for va in mapped {
                        if let Some(pte) = sp.pages.remove(&va) {
                            if let Some(f) = pte.frame {
                                frames.release(f);
                            }
                        }
                    }
                    return Err(KernelError::OutOfMemory);
                }
            }
            va += PAGE_SIZE as u64;
        }
        Ok(new)
    }

    fn shrink(&self, space: SpaceId, old: usize, new: usize) -> usize {
        let mut frames = self.frames.lock();
        let mut spaces = self.spaces.lock();
        let Some(sp) = spaces.get_mut(&space) else {
            return new;
        };
        let first = page_base(new as u64 + PAGE_SIZE as u64 - 1);
        let mut va = first;
        while (va as usize) < old {
            if let Some(pte) = sp.pages.remove(&va) {
                if let Some(f) = pte.frame {
                    frames.release(f);
                }
            }
            va += PAGE_SIZE as u64;
        }
        new
    }

    fn activate(&self, space: SpaceId) {
        *self.active.lock() = Some(space);
    }

    fn activate_kernel(&self) {
        *self.active.lock() = None;
    }
}

impl PageTableOps for MemHal {
    fn flags(&self, space: SpaceId, va: u64) -> Result<PteFlags, KernelError> {
        self.with_pte(space, va, |_, pte| Ok(pte.flags))
    }

    fn set_flags(&self, space: SpaceId, va: u64, fl: PteFlags) -> Result<(), KernelError> {
        self.with_pte(space, va, |_, pte| {
            pte.flags |= fl;
            Ok(())
        })
    }

    fn clear_flags(&self, space: SpaceId, va: u64, fl: PteFlags) -> Result<(), KernelError> {
        self.with_pte(space, va, |_, pte| {
            pte.flags &= !fl;
            Ok(())
        })
    }

    fn read_page(&self, space: SpaceId, va: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        self.with_pte(space, va, |frames, pte| {
            let frame = pte.frame.ok_or(KernelError::WalkFailed)?;
            buf.copy_from_slice(&frames.mem[&frame][..buf.len()]);
            Ok(())
        })
    }

    fn write_page(&self, space: SpaceId, va: u64, buf: &[u8]) -> Result<(), KernelError> {
        self.with_pte(space, va, |frames, pte| {
            let frame = pte.frame.ok_or(KernelError::WalkFailed)?;
            let mem = frames.mem.get_mut(&frame).ok_or(KernelError::WalkFailed)?;
            mem[..buf.len()].copy_from_slice(buf);
            Ok(())
        })
    }

    fn release_frame(&self, space: SpaceId, va: u64) -> Result<(), KernelError> {
        self.with_pte(space, va, |frames, pte| {
            if let Some(frame) = pte.frame.take() {
                frames.release(frame);
            }
            Ok(())
        })
    }

    fn attach_frame(&self, space: SpaceId, va: u64) -> Result<(), KernelError> {
        self.with_pte(space, va, |frames, pte| {
            let frame = frames.alloc(&self.next_id).ok_or(KernelError::OutOfMemory)?;
            pte.frame = Some(frame);
            Ok(())
        })
    }
}

impl BackingStore for MemHal {
    fn create(&self, tag: u32) -> Result<SwapHandle, KernelError> {
        let file = SwapHandle(self.fresh_id() | (tag as u64) << 32);
        self.swap_files.lock().insert(file, Vec::new());
        Ok(file)
    }

    fn remove(&self, file: SwapHandle) {
        self.swap_files.lock().remove(&file);
    }

    fn read_at(&self, file: SwapHandle, offset: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        let files = self.swap_files.lock();
        let data = files.get(&file).ok_or(KernelError::Io)?;
        let end = offset as usize + buf.len();
        if end > data.len() {
            return Err(KernelError::Io);
        }
        buf.copy_from_slice(&data[offset as usize..end]);
        Ok(())
    }

    fn write_at(&self, file: SwapHandle, offset: u64, buf: &[u8]) -> Result<(), KernelError> {
        let mut files = self.swap_files.lock();
        let data = files.get_mut(&file).ok_or(KernelError::Io)?;
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self, file: SwapHandle) -> u64 {
        self.swap_files.lock().get(&file).map_or(0, |d| d.len() as u64)
    }
}

impl FileOps for MemHal {
    fn dup(&self, f: FileHandle) -> FileHandle {
        *self.file_refs.lock().entry(f).or_insert(0) += 1;
        f
    }

    fn close(&self, f: FileHandle) {
        let mut refs = self.file_refs.lock();
        if let Some(n) = refs.get_mut(&f) {
            *n -= 1;
            if *n == 0 {
                refs.remove(&f);
            }
        }
    }
}

impl FsOps for MemHal {
    fn root(&self) -> InodeHandle {
        *self.inode_refs.lock().entry(ROOT_INO).or_insert(0) += 1;
        ROOT_INO
    }

    fn dup(&self, ino: InodeHandle) -> InodeHandle {
        *self.inode_refs.lock().entry(ino).or_insert(0) += 1;
        ino
    }

    fn put_guarded(&self, ino: InodeHandle) {
        let mut refs = self.inode_refs.lock();
        if let Some(n) = refs.get_mut(&ino) {
            *n = n.saturating_sub(1);
        }
    }
}

impl ContextOps for MemHal {
    fn alloc(&self) -> ContextId {
        let id = ContextId(self.fresh_id());
        self.contexts.lock().insert(id, false);
        id
    }

    fn prime(&self, ctx: ContextId, _entry: Box<dyn FnOnce() + Send>) {
        // Recorded only; the in-memory HAL never transfers control, so
        // the entry closure is dropped.
        self.contexts.lock().insert(ctx, true);
    }

    fn swap(&self, save: ContextId, resume: ContextId) {
        self.swap_log.lock().push((save, resume));
    }

    fn free(&self, ctx: ContextId) {
        self.contexts.lock().remove(&ctx);
    }

    fn backtrace(&self, _ctx: ContextId) -> Vec<u64> {
        Vec::new()
    }
}

impl CpuOps for MemHal {
    fn cpu_id(&self) -> usize {
        0
    }

    fn cpu_count(&self) -> usize {
        1
    }

    fn intr_enable(&self) {
        self.intr.store(true, Ordering::SeqCst);
    }

    fn intr_disable(&self) {
        self.intr.store(false, Ordering::SeqCst);
    }

    fn intr_enabled(&self) -> bool {
        self.intr.load(Ordering::SeqCst)
    }
}

impl TrapReturn for MemHal {
    fn user_enter(&self, _pid: u32) {}
}
