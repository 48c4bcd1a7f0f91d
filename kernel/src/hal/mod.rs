//! Collaborator interfaces.
//!
//! The core never touches hardware, page tables, or the filesystem
//! directly; everything below this line of abstraction is consumed through
//! the traits in this module. A production port implements them over real
//! MMU, disk and context-switch primitives; [`mem::MemHal`] implements
//! them in memory for hosted builds and tests.

pub mod mem;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::error::KernelError;

/// Address-space handle, owned by the VM collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(pub u64);

/// One physical page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysPage(pub u64);

/// Shared (reference-counted) open-file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// Inode handle for a working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeHandle(pub u64);

/// Per-process swap-file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapHandle(pub u64);

/// Saved-context slot: the unit of CPU ownership exchanged by
/// [`ContextOps::swap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

bitflags! {
    /// Page-table entry flags the core reads and writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Page is backed by a physical frame.
        const PRESENT = 1 << 0;
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Hardware-set accessed bit.
        const ACCESSED = 1 << 2;
        /// Contents live in the swap file, not in a frame.
        const PAGED_OUT = 1 << 3;
        /// Transient marker: the page was write-protected when a restore
        /// forced it writable. Cleared once the protection is put back.
        const WAS_PROTECTED = 1 << 4;
    }
}

/// Physical page allocator.
pub trait FrameAlloc: Send + Sync {
    /// Allocate one zeroed page, or `None` when exhausted.
    fn alloc(&self) -> Option<PhysPage>;
    fn free(&self, frame: PhysPage);
    fn free_frames(&self) -> usize;
    fn total_frames(&self) -> usize;
}

/// Address-space creation, duplication and sizing.
pub trait AddressSpaceOps: Send + Sync {
    fn create(&self) -> Result<SpaceId, KernelError>;
    /// Tear down `space` and every frame it still owns. `sz` is the
    /// mapped extent in bytes.
    fn destroy(&self, space: SpaceId, sz: usize);
    /// Duplicate the first `sz` bytes of `space` into a fresh space,
    /// copying resident page contents and preserving the flags of
    /// paged-out entries.
    fn duplicate(&self, space: SpaceId, sz: usize) -> Result<SpaceId, KernelError>;
    /// Extend the mapped extent from `old` to `new` bytes, allocating
    /// frames for the new range. No partial effect on failure.
    fn grow(&self, space: SpaceId, old: usize, new: usize) -> Result<usize, KernelError>;
    /// Shrink the mapped extent from `old` down to `new` bytes, freeing
    /// frames. Returns the new size.
    fn shrink(&self, space: SpaceId, old: usize, new: usize) -> usize;
    /// Make `space` the active user mapping on the executing core.
    fn activate(&self, space: SpaceId);
    /// Switch the executing core back to the kernel-only mapping.
    fn activate_kernel(&self);
}

/// Page-table entry inspection and page I/O.
pub trait PageTableOps: Send + Sync {
    fn flags(&self, space: SpaceId, va: u64) -> Result<PteFlags, KernelError>;
    fn set_flags(&self, space: SpaceId, va: u64, fl: PteFlags) -> Result<(), KernelError>;
    fn clear_flags(&self, space: SpaceId, va: u64, fl: PteFlags) -> Result<(), KernelError>;
    /// Copy one page of memory at `va` into `buf`.
    fn read_page(&self, space: SpaceId, va: u64, buf: &mut [u8]) -> Result<(), KernelError>;
    /// Copy `buf` into the page at `va`.
    fn write_page(&self, space: SpaceId, va: u64, buf: &[u8]) -> Result<(), KernelError>;
    /// Release the frame backing `va`, leaving the entry's flags intact.
    fn release_frame(&self, space: SpaceId, va: u64) -> Result<(), KernelError>;
    /// Attach a fresh zeroed frame to `va`.
    fn attach_frame(&self, space: SpaceId, va: u64) -> Result<(), KernelError>;
}

/// Per-process swap files.
pub trait BackingStore: Send + Sync {
    /// Create the backing file for the process identified by `tag`.
    fn create(&self, tag: u32) -> Result<SwapHandle, KernelError>;
    fn remove(&self, file: SwapHandle);
    fn read_at(&self, file: SwapHandle, offset: u64, buf: &mut [u8]) -> Result<(), KernelError>;
    fn write_at(&self, file: SwapHandle, offset: u64, buf: &[u8]) -> Result<(), KernelError>;
    /// Current extent of the file in bytes.
    fn size(&self, file: SwapHandle) -> u64;
}

/// Shared file-handle duplication and release; reference counts live with
/// the collaborator.
pub trait FileOps: Send + Sync {
    fn dup(&self, f: FileHandle) -> FileHandle;
    fn close(&self, f: FileHandle);
}

/// Filesystem pieces the lifecycle needs: the root directory and guarded
/// inode release.
pub trait FsOps: Send + Sync {
    /// Resolve the root directory, taking a reference.
    fn root(&self) -> InodeHandle;
    fn dup(&self, ino: InodeHandle) -> InodeHandle;
    /// Drop a reference inside the filesystem transaction guard
    /// (begin/put/end collapsed into one call).
    fn put_guarded(&self, ino: InodeHandle);
}

/// Raw context save/restore behind an interface. `swap` is the only
/// suspension point in the kernel: it parks the calling flow of control in
/// `save` and resumes whatever was parked in `resume`.
pub trait ContextOps: Send + Sync {
    fn alloc(&self) -> ContextId;
    /// Arrange for the first resumption of `ctx` to run `entry`.
    fn prime(&self, ctx: ContextId, entry: Box<dyn FnOnce() + Send>);
    fn swap(&self, save: ContextId, resume: ContextId);
    fn free(&self, ctx: ContextId);
    /// Saved return addresses for the diagnostic dump. Best effort; may
    /// be empty.
    fn backtrace(&self, ctx: ContextId) -> Vec<u64>;
}

/// Core identity and interrupt control.
pub trait CpuOps: Send + Sync {
    /// Identity of the executing core. Interrupts must be disabled, or
    /// the caller may migrate mid-read.
    fn cpu_id(&self) -> usize;
    fn cpu_count(&self) -> usize;
    fn intr_enable(&self);
    fn intr_disable(&self);
    fn intr_enabled(&self) -> bool;
}

/// User-mode re-entry. The trampoline hands freshly dispatched processes
/// here; kill termination is applied by this collaborator, cooperatively,
/// on the way back to user mode.
pub trait TrapReturn: Send + Sync {
    fn user_enter(&self, pid: u32);
}

/// The full collaborator bundle a kernel is built over.
#[derive(Clone)]
pub struct Platform {
    pub frames: Arc<dyn FrameAlloc>,
    pub spaces: Arc<dyn AddressSpaceOps>,
    pub ptes: Arc<dyn PageTableOps>,
    pub store: Arc<dyn BackingStore>,
    pub files: Arc<dyn FileOps>,
    pub fs: Arc<dyn FsOps>,
    pub ctx: Arc<dyn ContextOps>,
    pub cpus: Arc<dyn CpuOps>,
    pub trap: Arc<dyn TrapReturn>,
}

impl Platform {
    /// Bundle every collaborator role from one implementation.
    pub fn from_host<H>(host: Arc<H>) -> Self
    where
        H: FrameAlloc
            + AddressSpaceOps
            + PageTableOps
            + BackingStore
            + FileOps
            + FsOps
            + ContextOps
            + CpuOps
            + TrapReturn
            + 'static,
    {
        Platform {
            frames: host.clone(),
            spaces: host.clone(),
            ptes: host.clone(),
            store: host.clone(),
            files: host.clone(),
            fs: host.clone(),
            ctx: host.clone(),
            cpus: host.clone(),
            trap: host,
        }
    }
}
