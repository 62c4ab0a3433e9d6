//! Per-thread execution context.
//!
//! Each guest thread owns one slot of the context arena:
//!
//! ```text
//! [control page][signal stack: N pages][guard page][fragment page]
//! ```
//!
//! The control page starts with a [`ContextBlock`] that generated code and
//! the dispatcher address directly; the rest of it is the scratch stack.
//! The guard page is never accessible. The fragment page is execute-read
//! except while a fragment is being written into it.

use std::io;
use std::mem::{self, offset_of};
use std::ptr;
use std::sync::Arc;

use log::{debug, error};

use super::shared::{FileTable, SignalTable};
use super::threads::{ContextHandle, ThreadError};
use crate::config::HookAddrs;
use crate::decode::Decoder;
use crate::jit::memory::{self, ContextArena, PageState, Protection, ScratchPage};
use crate::jit::{FragmentCells, GuestRegion, OutputPage, Translator};

/// Fixed header of the control page. All fields are 32-bit guest-visible addresses.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextBlock {
    /// Address of this block.
    pub my_addr: u32,
    pub jit_return_addr: u32,
    pub runtime_ijmp_addr: u32,
    pub jit_fragment_exit_addr: u32,
    /// Guest address to resume at after a fragment exit.
    pub jit_eip: u32,
    /// `%eax` spill slot for fragment code.
    pub jit_fragment_scratch: u32,
    /// Guest stack pointer saved while runtime code runs.
    pub user_esp: u32,
    pub scratch_stack_top: u32,
    pub sigwrap_stack_top: u32,
}

impl ContextBlock {
    /// Fragment cells of a block located at `base`.
    pub fn cells_at(base: u32) -> FragmentCells {
        let cell = |offset: usize| base.wrapping_add(offset as u32);
        FragmentCells {
            next_eip: cell(offset_of!(ContextBlock, jit_eip)),
            scratch: cell(offset_of!(ContextBlock, jit_fragment_scratch)),
            exit_hook: cell(offset_of!(ContextBlock, jit_fragment_exit_addr)),
        }
    }
}

/// Page offsets inside one arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    page: usize,
    signal_stack_pages: usize,
}

impl RegionLayout {
    pub fn new(signal_stack_pages: usize) -> Self {
        Self {
            page: memory::page_size(),
            signal_stack_pages,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page
    }

    pub fn signal_stack_offset(&self) -> usize {
        self.page
    }

    pub fn signal_stack_len(&self) -> usize {
        self.signal_stack_pages * self.page
    }

    pub fn guard_offset(&self) -> usize {
        (self.signal_stack_pages + 1) * self.page
    }

    pub fn fragment_offset(&self) -> usize {
        (self.signal_stack_pages + 2) * self.page
    }

    /// Size of a whole slot.
    pub fn stride(&self) -> usize {
        (self.signal_stack_pages + 3) * self.page
    }
}

/// Guest range of the fragment currently held in the fragment page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidentFragment {
    pub guest_base: u32,
    pub guest_len: u32,
    pub entry: u32,
    pub code_len: usize,
}

impl ResidentFragment {
    fn overlaps(&self, addr: u32, len: u32) -> bool {
        let (a0, a1) = (u64::from(addr), u64::from(addr) + u64::from(len));
        let b0 = u64::from(self.guest_base);
        // the fallthrough address belongs to the fragment too
        let b1 = b0 + u64::from(self.guest_len) + 1;
        len != 0 && a0 < b1 && b0 < a1
    }
}

/// A thread's context: its arena slot plus references to shared state.
///
/// Dropping a context does not release its slot; that is done by the
/// context manager under its lock.
pub struct ThreadContext {
    handle: ContextHandle,
    addr: usize,
    layout: RegionLayout,
    page: ScratchPage,
    files: Arc<FileTable>,
    signals: Arc<SignalTable>,
    resident: Option<ResidentFragment>,
    // keeps the slot mapped
    _arena: Arc<ContextArena>,
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("handle", &self.handle)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("page", &self.page.state())
            .field("resident", &self.resident)
            .finish()
    }
}

impl ThreadContext {
    /// Map a fresh region for `handle` and lay it out.
    ///
    /// On return the guard page is inaccessible and the fragment page is
    /// execute-read.
    pub(crate) fn init(
        handle: ContextHandle,
        arena: Arc<ContextArena>,
        layout: RegionLayout,
        hooks: &HookAddrs,
        files: Arc<FileTable>,
        signals: Arc<SignalTable>,
    ) -> Result<Self, ThreadError> {
        let addr = arena.commit(handle.slot)?;
        let base = addr as u32;

        let block = ContextBlock {
            my_addr: base,
            jit_return_addr: hooks.dispatcher_return,
            runtime_ijmp_addr: hooks.indirect_jump,
            jit_fragment_exit_addr: hooks.fragment_exit,
            jit_eip: 0,
            jit_fragment_scratch: 0,
            user_esp: 0,
            scratch_stack_top: base.wrapping_add(layout.page_size() as u32),
            sigwrap_stack_top: base
                .wrapping_add(layout.guard_offset() as u32)
                .wrapping_sub(mem::size_of::<u32>() as u32),
        };
        // SAFETY: the control page was just committed read-write
        unsafe { ptr::write_volatile(addr as *mut ContextBlock, block) };

        memory::protect(addr + layout.guard_offset(), layout.page_size(), Protection::None)?;
        let fragment = addr + layout.fragment_offset();
        memory::protect(fragment, layout.page_size(), Protection::ExecRead)?;
        // SAFETY: the fragment page belongs to this slot, which stays mapped while `arena` lives
        let page = unsafe { ScratchPage::from_executable(fragment, layout.page_size()) };

        debug!("context {:?} initialized at {:#x}", handle, addr);
        Ok(Self {
            handle,
            addr,
            layout,
            page,
            files,
            signals,
            resident: None,
            _arena: arena,
        })
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn slot(&self) -> usize {
        self.handle.slot
    }

    /// Address of the control block.
    pub fn base_addr(&self) -> u32 {
        self.addr as u32
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn fragment_page_addr(&self) -> u32 {
        self.page.addr() as u32
    }

    pub fn guard_page_addr(&self) -> u32 {
        (self.addr + self.layout.guard_offset()) as u32
    }

    pub fn page_state(&self) -> PageState {
        self.page.state()
    }

    pub fn files(&self) -> &Arc<FileTable> {
        &self.files
    }

    pub fn signals(&self) -> &Arc<SignalTable> {
        &self.signals
    }

    fn block_ptr(&self) -> *mut ContextBlock {
        self.addr as *mut ContextBlock
    }

    /// Copy of the control block.
    pub fn block(&self) -> ContextBlock {
        // SAFETY: the control page stays mapped read-write for the life of the context
        unsafe { ptr::read_volatile(self.block_ptr()) }
    }

    /// Cells referenced by fragment code.
    pub fn cells(&self) -> FragmentCells {
        ContextBlock::cells_at(self.base_addr())
    }

    /// Guest address stored by the last fragment exit.
    pub fn next_eip(&self) -> u32 {
        self.block().jit_eip
    }

    pub fn set_next_eip(&mut self, eip: u32) {
        // SAFETY: see `block`
        unsafe { ptr::addr_of_mut!((*self.block_ptr()).jit_eip).write_volatile(eip) };
    }

    pub fn user_esp(&self) -> u32 {
        self.block().user_esp
    }

    pub fn set_user_esp(&mut self, esp: u32) {
        // SAFETY: see `block`
        unsafe { ptr::addr_of_mut!((*self.block_ptr()).user_esp).write_volatile(esp) };
    }

    /// Make the fragment page execute-read.
    pub fn protect(&mut self) -> Result<(), ThreadError> {
        Ok(self.page.make_executable()?)
    }

    /// Make the fragment page read-write. Guest code must not run until
    /// [`ThreadContext::protect`] is called again.
    pub fn unprotect(&mut self) -> Result<(), ThreadError> {
        Ok(self.page.make_writable()?)
    }

    /// Open the fragment page for writing.
    ///
    /// All signals are blocked on the calling thread while the guard lives,
    /// so no handler can run a nested translation on a half-written page.
    pub fn writable(&mut self) -> Result<WritableGuard<'_>, ThreadError> {
        let old_mask = block_all_signals()?;
        if let Err(err) = self.page.make_writable() {
            restore_signal_mask(&old_mask);
            return Err(err.into());
        }
        Ok(WritableGuard {
            page: &mut self.page,
            old_mask,
        })
    }

    /// Translate `region` into this context's fragment page and return the
    /// entry address. Translation failures abort.
    pub fn translate_fragment<D: Decoder>(
        &mut self,
        translator: &Translator<D>,
        region: &GuestRegion<'_>,
        entry: usize,
    ) -> u32 {
        let cells = self.cells();
        let base = self.fragment_page_addr();
        let fragment = {
            let mut guard = self.writable().unwrap_or_else(|err| crate::jit::fatal(err));
            let mut out = OutputPage::new(guard.bytes(), base, cells);
            translator.translate(region, entry, &mut out)
        };
        self.resident = Some(ResidentFragment {
            guest_base: region.base,
            guest_len: region.len() as u32,
            entry: fragment.entry,
            code_len: fragment.code_len,
        });
        fragment.entry
    }

    pub fn resident(&self) -> Option<&ResidentFragment> {
        self.resident.as_ref()
    }

    /// Forget the resident fragment if it was translated from guest code
    /// overlapping `[addr, addr + len)`.
    pub fn forget_fragment_in(&mut self, addr: u32, len: u32) -> bool {
        match self.resident {
            Some(r) if r.overlaps(addr, len) => {
                self.resident = None;
                true
            }
            _ => false,
        }
    }

    /// Copy of the fragment page.
    pub fn fragment_snapshot(&self) -> Vec<u8> {
        self.page.snapshot()
    }
}

/// Scoped write access to a context's fragment page.
///
/// Dropping the guard makes the page executable again and restores the
/// signal mask, on every exit path.
pub struct WritableGuard<'a> {
    page: &'a mut ScratchPage,
    old_mask: libc::sigset_t,
}

impl WritableGuard<'_> {
    pub fn bytes(&mut self) -> &mut [u8] {
        self.page.as_mut_slice().unwrap_or_default()
    }

    pub fn addr(&self) -> u32 {
        self.page.addr() as u32
    }
}

impl Drop for WritableGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.page.make_executable() {
            // a writable page must never be left behind
            error!("cannot re-protect fragment page: {}", err);
            std::process::abort();
        }
        restore_signal_mask(&self.old_mask);
    }
}

fn block_all_signals() -> Result<libc::sigset_t, ThreadError> {
    // SAFETY: sigset_t is plain data; both sets are initialized before use
    unsafe {
        let mut all: libc::sigset_t = mem::zeroed();
        let mut old: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&mut all);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut old);
        if rc != 0 {
            return Err(ThreadError::SignalMask(io::Error::from_raw_os_error(rc)));
        }
        Ok(old)
    }
}

fn restore_signal_mask(mask: &libc::sigset_t) {
    // SAFETY: `mask` came from pthread_sigmask
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, mask, ptr::null_mut());
    }
}
