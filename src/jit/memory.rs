//! Memory mapping and protection primitives.
//!
//! Thread contexts live in one arena reserved up front with `mmap`. Each
//! slot is committed on demand, and the fragment page inside a slot is
//! flipped between writable and executable with `mprotect`. A page is never
//! writable and executable at the same time.

use std::io;
use std::ptr::{self, NonNull};

use thiserror::Error;

/// Error type for memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("mmap of {size:#x} bytes failed: {source}")]
    AllocationFailed {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("mprotect({addr:#x}, {len:#x}) failed: {source}")]
    ProtectionFailed {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("invalid memory size")]
    InvalidSize,
    #[error("mapping at {addr:#x} is not addressable by 32-bit code")]
    OutOfRange { addr: usize },
}

/// Access modes used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    ReadWrite,
    ExecRead,
}

impl Protection {
    fn to_prot(self) -> libc::c_int {
        match self {
            Protection::None => libc::PROT_NONE,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ExecRead => libc::PROT_READ | libc::PROT_EXEC,
        }
    }
}

/// Get the page size for the current system.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

fn fits_32bit(addr: usize, size: usize) -> bool {
    addr as u64 + size as u64 <= 1u64 << 32
}

/// Map `size` bytes of inaccessible, unbacked address space.
fn reserve_range(hint: usize, size: usize, extra_flags: libc::c_int) -> Result<usize, MemoryError> {
    let ptr = unsafe {
        libc::mmap(
            hint as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | extra_flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed {
            size,
            source: io::Error::last_os_error(),
        });
    }
    Ok(ptr as usize)
}

/// Change the protection of `[addr, addr + len)`.
pub fn protect(addr: usize, len: usize, prot: Protection) -> Result<(), MemoryError> {
    let result = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot.to_prot()) };
    if result != 0 {
        return Err(MemoryError::ProtectionFailed {
            addr,
            len,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// A reserved, initially inaccessible range holding `capacity` equally sized slots.
pub struct ContextArena {
    ptr: NonNull<u8>,
    stride: usize,
    capacity: usize,
}

impl ContextArena {
    /// Reserve `capacity * stride` bytes, preferably at `hint`.
    ///
    /// The arena must end below 4 GiB since generated code addresses it with
    /// 32-bit absolute operands.
    pub fn reserve(hint: usize, stride: usize, capacity: usize) -> Result<Self, MemoryError> {
        let size = stride.checked_mul(capacity).ok_or(MemoryError::InvalidSize)?;
        if size == 0 || stride % page_size() != 0 {
            return Err(MemoryError::InvalidSize);
        }

        let addr = reserve_range(hint, size, 0)?;
        if fits_32bit(addr, size) {
            return Self::adopt(addr, stride, capacity);
        }
        unsafe { libc::munmap(addr as *mut libc::c_void, size) };

        // hint taken: ask the kernel for the low 2 GiB instead
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        {
            let addr = reserve_range(0, size, libc::MAP_32BIT)?;
            if fits_32bit(addr, size) {
                return Self::adopt(addr, stride, capacity);
            }
            unsafe { libc::munmap(addr as *mut libc::c_void, size) };
        }

        Err(MemoryError::OutOfRange { addr })
    }

    fn adopt(addr: usize, stride: usize, capacity: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            ptr: NonNull::new(addr as *mut u8).ok_or(MemoryError::InvalidSize)?,
            stride,
            capacity,
        })
    }

    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.stride * self.capacity
    }

    /// Address of slot `index`.
    pub fn slot_addr(&self, index: usize) -> usize {
        debug_assert!(index < self.capacity);
        self.base() + index * self.stride
    }

    /// Replace slot `index` with fresh zeroed read-write memory.
    pub fn commit(&self, index: usize) -> Result<usize, MemoryError> {
        if index >= self.capacity {
            return Err(MemoryError::InvalidSize);
        }
        let addr = self.slot_addr(index);
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                self.stride,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED || ptr as usize != addr {
            return Err(MemoryError::AllocationFailed {
                size: self.stride,
                source: io::Error::last_os_error(),
            });
        }
        Ok(addr)
    }
}

impl Drop for ContextArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size());
        }
    }
}

// The arena only hands out addresses; every slot is used by one thread at a time.
unsafe impl Send for ContextArena {}
unsafe impl Sync for ContextArena {}

/// Access state of a scratch page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Read-write, being filled by the translator.
    Writable,
    /// Execute-read, runnable.
    Executable,
}

/// One page that alternates between writable and executable.
#[derive(Debug)]
pub struct ScratchPage {
    addr: usize,
    len: usize,
    state: PageState,
}

impl ScratchPage {
    /// Adopt a page that is currently mapped execute-read.
    ///
    /// # Safety
    /// `[addr, addr + len)` must be a mapped, page-aligned range owned by the caller
    /// for as long as the `ScratchPage` lives.
    pub unsafe fn from_executable(addr: usize, len: usize) -> Self {
        Self {
            addr,
            len,
            state: PageState::Executable,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn is_executable(&self) -> bool {
        self.state == PageState::Executable
    }

    /// Make the page read-write (and no longer executable).
    pub fn make_writable(&mut self) -> Result<(), MemoryError> {
        if self.state == PageState::Writable {
            return Ok(());
        }
        protect(self.addr, self.len, Protection::ReadWrite)?;
        self.state = PageState::Writable;
        Ok(())
    }

    /// Make the page execute-read (and no longer writable).
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.state == PageState::Executable {
            return Ok(());
        }
        protect(self.addr, self.len, Protection::ExecRead)?;
        self.state = PageState::Executable;
        Ok(())
    }

    /// The page contents. Returns None unless the page is writable.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.state != PageState::Writable {
            return None;
        }
        // SAFETY: the page is mapped read-write and owned by `self`
        Some(unsafe { std::slice::from_raw_parts_mut(self.addr as *mut u8, self.len) })
    }

    /// Copy out the page contents, temporarily making it readable if needed.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        // SAFETY: both protection states include PROT_READ
        unsafe { ptr::copy_nonoverlapping(self.addr as *const u8, out.as_mut_ptr(), self.len) };
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(hint: usize, capacity: usize) -> ContextArena {
        ContextArena::reserve(hint, page_size() * 2, capacity).unwrap()
    }

    #[test]
    fn test_page_size() {
        assert!(page_size() >= 4096);
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn test_reserve_and_commit() {
        let arena = arena(0x5800_0000, 2);
        assert_eq!(arena.capacity(), 2);
        assert_eq!(arena.slot_addr(1) - arena.slot_addr(0), arena.stride());

        let addr = arena.commit(1).unwrap();
        assert_eq!(addr, arena.slot_addr(1));
        unsafe {
            assert_eq!(*(addr as *const u8), 0);
            *(addr as *mut u8) = 0x90;
            assert_eq!(*(addr as *const u8), 0x90);
        }

        // recommitting yields fresh zeroed memory
        arena.commit(1).unwrap();
        unsafe { assert_eq!(*(addr as *const u8), 0) };
    }

    #[test]
    fn test_commit_out_of_range() {
        let arena = arena(0x5810_0000, 1);
        assert!(matches!(arena.commit(1), Err(MemoryError::InvalidSize)));
    }

    #[test]
    fn test_invalid_stride() {
        assert!(matches!(
            ContextArena::reserve(0, page_size() + 1, 1),
            Err(MemoryError::InvalidSize)
        ));
    }

    #[test]
    fn test_scratch_page_transitions() {
        let arena = arena(0x5820_0000, 1);
        let addr = arena.commit(0).unwrap();
        let len = page_size();
        protect(addr, len, Protection::ExecRead).unwrap();

        let mut page = unsafe { ScratchPage::from_executable(addr, len) };
        assert!(page.is_executable());
        assert!(page.as_mut_slice().is_none());

        page.make_writable().unwrap();
        assert_eq!(page.state(), PageState::Writable);
        page.as_mut_slice().unwrap()[0] = 0xC3;

        page.make_executable().unwrap();
        assert!(page.is_executable());
        assert_eq!(page.snapshot()[0], 0xC3);
    }
}
