//! Guest thread lifecycle.
//!
//! - A fixed-capacity slot table, one slot per live guest thread
//! - Context creation on clone, release on exit
//! - A thread-local binding from OS thread to its context
//!
//! The slot table lock is only taken to allocate, release or unshare slots.
//! Everything else a context does is confined to its owning thread.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use log::{debug, warn};
use thiserror::Error;

use super::context::{RegionLayout, ThreadContext};
use super::shared::{FileTable, SignalTable};
use crate::config::ContextConfig;
use crate::jit::memory::{ContextArena, MemoryError};

/// Manager id counter for generating unique ids.
static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };
}

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("no free thread context ({capacity} in use)")]
    NoFreeSlot { capacity: usize },
    #[error("context region at {addr:#x} is not addressable by 32-bit code")]
    RegionOutOfRange { addr: usize },
    #[error(transparent)]
    Memory(MemoryError),
    #[error("clone failed with errno {errno}")]
    CloneFailed { errno: i64 },
    #[error("cannot change signal mask: {0}")]
    SignalMask(#[source] io::Error),
    #[error("cannot spawn thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("no thread context bound to this thread")]
    NotBound,
    #[error("this thread already has a context")]
    AlreadyBound,
    #[error("context belongs to another manager")]
    ForeignContext,
    #[error("invalid signal number {0}")]
    InvalidSignal(usize),
    #[error("invalid thread configuration: {0}")]
    Config(String),
}

impl From<MemoryError> for ThreadError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfRange { addr } => ThreadError::RegionOutOfRange { addr },
            err => ThreadError::Memory(err),
        }
    }
}

bitflags! {
    /// Linux `clone(2)` flags. The low byte (exit signal) is not a flag.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CloneFlags: u64 {
        const VM = 0x0000_0100;
        const FS = 0x0000_0200;
        const FILES = 0x0000_0400;
        const SIGHAND = 0x0000_0800;
        const PTRACE = 0x0000_2000;
        const VFORK = 0x0000_4000;
        const PARENT = 0x0000_8000;
        const THREAD = 0x0001_0000;
        const NEWNS = 0x0002_0000;
        const SYSVSEM = 0x0004_0000;
        const SETTLS = 0x0008_0000;
        const PARENT_SETTID = 0x0010_0000;
        const CHILD_CLEARTID = 0x0020_0000;
        const DETACHED = 0x0040_0000;
        const UNTRACED = 0x0080_0000;
        const CHILD_SETTID = 0x0100_0000;
    }
}

/// Identifies a context: the manager that owns it and its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle {
    pub manager: u64,
    pub slot: usize,
}

/// Fixed-capacity allocation bitmap.
#[derive(Debug, Clone)]
pub struct SlotTable {
    words: Vec<u64>,
    capacity: usize,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_allocated(&self, slot: usize) -> bool {
        slot < self.capacity && self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Claim the lowest free slot.
    pub fn allocate(&mut self) -> Option<usize> {
        let slot = (0..self.capacity).find(|&s| !self.is_allocated(s))?;
        self.words[slot / 64] |= 1 << (slot % 64);
        Some(slot)
    }

    /// Free `slot`. Returns false if it was not allocated.
    pub fn release(&mut self, slot: usize) -> bool {
        if !self.is_allocated(slot) {
            return false;
        }
        self.words[slot / 64] &= !(1 << (slot % 64));
        true
    }

    /// Free every slot except `keep`. Returns how many were freed.
    pub fn unshare(&mut self, keep: usize) -> usize {
        let kept = self.is_allocated(keep);
        let freed = self.count() - usize::from(kept);
        self.words.iter_mut().for_each(|w| *w = 0);
        if kept {
            self.words[keep / 64] |= 1 << (keep % 64);
        }
        freed
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Owns the context arena and the slot table.
pub struct ContextManager {
    id: u64,
    config: ContextConfig,
    layout: RegionLayout,
    arena: Arc<ContextArena>,
    slots: Mutex<SlotTable>,
    files: Arc<FileTable>,
    signals: Arc<SignalTable>,
}

impl ContextManager {
    /// Reserve the context arena. No slot is allocated yet.
    pub fn new(config: &ContextConfig) -> Result<Self, ThreadError> {
        if config.max_threads == 0 {
            return Err(ThreadError::Config("max_threads must be at least 1".into()));
        }
        let hint = usize::try_from(config.region_base)
            .map_err(|_| ThreadError::Config(format!("region_base {:#x}", config.region_base)))?;
        let layout = RegionLayout::new(config.signal_stack_pages);
        let arena = ContextArena::reserve(hint, layout.stride(), config.max_threads)?;
        let id = NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed);

        debug!(
            "context arena {} at {:#x}: {} slots of {:#x} bytes",
            id,
            arena.base(),
            config.max_threads,
            layout.stride()
        );
        Ok(Self {
            id,
            config: *config,
            layout,
            arena: Arc::new(arena),
            slots: Mutex::new(SlotTable::new(config.max_threads)),
            files: Arc::new(FileTable::new()),
            signals: Arc::new(SignalTable::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.config.max_threads
    }

    /// Number of slots currently in use.
    pub fn allocated(&self) -> usize {
        self.lock_slots().count()
    }

    pub fn is_allocated(&self, slot: usize) -> bool {
        self.lock_slots().is_allocated(slot)
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn arena_base(&self) -> usize {
        self.arena.base()
    }

    pub fn files(&self) -> &Arc<FileTable> {
        &self.files
    }

    pub fn signals(&self) -> &Arc<SignalTable> {
        &self.signals
    }

    fn lock_slots(&self) -> MutexGuard<'_, SlotTable> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_slot(&self, slot: usize) {
        if !self.lock_slots().release(slot) {
            warn!("context slot {} released twice", slot);
        }
        debug!("context slot {} released", slot);
    }

    /// Allocate a slot and initialize its region. The slot is freed again
    /// if initialization fails.
    fn allocate_context(&self) -> Result<ThreadContext, ThreadError> {
        let slot = self
            .lock_slots()
            .allocate()
            .ok_or(ThreadError::NoFreeSlot {
                capacity: self.capacity(),
            })?;
        debug!("context slot {} allocated", slot);

        let handle = ContextHandle {
            manager: self.id,
            slot,
        };
        ThreadContext::init(
            handle,
            Arc::clone(&self.arena),
            self.layout,
            &self.config.hooks,
            Arc::clone(&self.files),
            Arc::clone(&self.signals),
        )
        .inspect_err(|err| {
            warn!("context slot {} init failed, rolling back: {}", slot, err);
            self.release_slot(slot);
        })
    }

    /// Give the calling thread its first context.
    pub fn init_threads(&self) -> Result<ContextHandle, ThreadError> {
        if current_handle().is_some() {
            return Err(ThreadError::AlreadyBound);
        }
        let ctx = self.allocate_context()?;
        let handle = ctx.handle();
        bind(ctx);
        Ok(handle)
    }

    /// Create a guest thread or process.
    ///
    /// `clone` performs the actual creation call and follows the raw syscall
    /// convention: a negative errno on failure, 0 in the child, the child's
    /// tid in the parent. With [`CloneFlags::VM`] a context is prepared
    /// before the call and bound in the child. Without it the child is a new
    /// process and releases every slot but its own.
    pub fn user_clone<F>(&self, flags: CloneFlags, clone: F) -> Result<i64, ThreadError>
    where
        F: FnOnce() -> i64,
    {
        if !flags.contains(CloneFlags::VM) {
            let ret = clone();
            if ret < 0 {
                return Err(ThreadError::CloneFailed { errno: -ret });
            }
            if ret == 0 {
                self.unshare()?;
            }
            return Ok(ret);
        }

        let ctx = self.allocate_context()?;
        let slot = ctx.slot();
        let ret = clone();
        if ret < 0 {
            drop(ctx);
            warn!("clone failed ({}), releasing context slot {}", ret, slot);
            self.release_slot(slot);
            return Err(ThreadError::CloneFailed { errno: -ret });
        }
        if ret == 0 {
            // the context the child may have inherited describes the parent
            if let Some(parent) = replace_current(ctx) {
                std::mem::forget(parent);
            }
        }
        // in the parent the slot now belongs to the child
        Ok(ret)
    }

    /// Release the calling thread's context slot and hand back `status`.
    ///
    /// The context is torn down before the slot is freed; once the lock is
    /// dropped the slot memory may be handed to another thread. This does
    /// not end the OS thread. The caller must end it right away with
    /// `status` and must not touch the context region (its stacks, control
    /// block or fragment page) after this returns.
    pub fn user_exit(&self, status: i32) -> Result<i32, ThreadError> {
        let ctx = take_current().ok_or(ThreadError::NotBound)?;
        if ctx.handle().manager != self.id {
            bind(ctx);
            return Err(ThreadError::ForeignContext);
        }
        let slot = ctx.slot();

        let mut slots = self.lock_slots();
        drop(ctx);
        slots.release(slot);
        drop(slots);

        debug!("context slot {} exited with status {}", slot, status);
        Ok(status)
    }

    /// Forget every other thread after a fork-style clone.
    fn unshare(&self) -> Result<usize, ThreadError> {
        let handle = current_handle().ok_or(ThreadError::NotBound)?;
        if handle.manager != self.id {
            return Err(ThreadError::ForeignContext);
        }
        let freed = self.lock_slots().unshare(handle.slot);
        debug!("unshared: released {} context slots", freed);
        Ok(freed)
    }

    /// Run `f` on a new OS thread with its own context.
    ///
    /// The slot is released when `f` returns or unwinds, or right away if the
    /// thread cannot be started.
    pub fn spawn<F, T>(self: &Arc<Self>, f: F) -> Result<JoinHandle<T>, ThreadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let ctx = self.allocate_context()?;
        let slot = ctx.slot();
        let manager = Arc::clone(self);

        let spawned = thread::Builder::new()
            .name(format!("guest-{}", slot))
            .spawn(move || {
                bind(ctx);
                let _exit = ExitOnDrop(manager);
                f()
            });

        spawned.map_err(|err| {
            warn!("thread spawn failed, releasing context slot {}", slot);
            self.release_slot(slot);
            ThreadError::Spawn(err)
        })
    }
}

struct ExitOnDrop(Arc<ContextManager>);

impl Drop for ExitOnDrop {
    fn drop(&mut self) {
        if let Err(err) = self.0.user_exit(0) {
            warn!("guest thread exit: {}", err);
        }
    }
}

fn bind(ctx: ThreadContext) {
    CURRENT.with(|c| *c.borrow_mut() = Some(ctx));
}

fn replace_current(ctx: ThreadContext) -> Option<ThreadContext> {
    CURRENT.with(|c| c.borrow_mut().replace(ctx))
}

fn take_current() -> Option<ThreadContext> {
    CURRENT.with(|c| c.borrow_mut().take())
}

/// Handle of the calling thread's context, if it has one.
pub fn current_handle() -> Option<ContextHandle> {
    CURRENT.with(|c| c.borrow().as_ref().map(ThreadContext::handle))
}

/// Run `f` on the calling thread's context.
///
/// `f` must not call back into this function.
pub fn with_current<R>(f: impl FnOnce(&mut ThreadContext) -> R) -> Result<R, ThreadError> {
    CURRENT.with(|c| c.borrow_mut().as_mut().map(f).ok_or(ThreadError::NotBound))
}

/// Make the calling thread's fragment page executable.
pub fn protect_context() -> Result<(), ThreadError> {
    with_current(|ctx| ctx.protect())?
}

/// Make the calling thread's fragment page writable.
pub fn unprotect_context() -> Result<(), ThreadError> {
    with_current(|ctx| ctx.unprotect())?
}
