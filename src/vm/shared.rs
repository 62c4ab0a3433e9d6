//! Process-wide tables shared by every guest thread.
//!
//! Threads created with shared memory see the same file and signal
//! state; contexts hold them by `Arc` and never own them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::threads::ThreadError;

/// Highest signal number (Linux real-time signals included).
pub const MAX_SIGNAL: usize = 64;

/// Guest handler value meaning "default action".
pub const SIG_DFL: u32 = 0;

/// One open guest file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    pub host_fd: i32,
    pub close_on_exec: bool,
}

/// Guest fd → host fd table.
#[derive(Debug, Default)]
pub struct FileTable {
    entries: Mutex<BTreeMap<i32, FileEntry>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, FileEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map `guest_fd`, returning the previous entry.
    pub fn insert(&self, guest_fd: i32, entry: FileEntry) -> Option<FileEntry> {
        self.lock().insert(guest_fd, entry)
    }

    pub fn get(&self, guest_fd: i32) -> Option<FileEntry> {
        self.lock().get(&guest_fd).copied()
    }

    pub fn remove(&self, guest_fd: i32) -> Option<FileEntry> {
        self.lock().remove(&guest_fd)
    }

    /// Lowest free guest descriptor at or above `min`.
    pub fn lowest_free(&self, min: i32) -> i32 {
        let entries = self.lock();
        let mut fd = min;
        while entries.contains_key(&fd) {
            fd += 1;
        }
        fd
    }

    /// Drop every close-on-exec entry. Returns the host fds to close.
    pub fn close_on_exec(&self) -> Vec<i32> {
        let mut entries = self.lock();
        let closing: Vec<i32> = entries
            .iter()
            .filter(|(_, e)| e.close_on_exec)
            .map(|(fd, _)| *fd)
            .collect();
        closing
            .into_iter()
            .filter_map(|fd| entries.remove(&fd).map(|e| e.host_fd))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Guest signal handler addresses, indexed by signal number.
#[derive(Debug)]
pub struct SignalTable {
    handlers: [AtomicU32; MAX_SIGNAL + 1],
}

impl Default for SignalTable {
    fn default() -> Self {
        Self {
            handlers: std::array::from_fn(|_| AtomicU32::new(SIG_DFL)),
        }
    }
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, signo: usize) -> Result<&AtomicU32, ThreadError> {
        if signo == 0 {
            return Err(ThreadError::InvalidSignal(signo));
        }
        self.handlers
            .get(signo)
            .ok_or(ThreadError::InvalidSignal(signo))
    }

    /// Install `handler` for `signo`, returning the previous handler.
    pub fn set(&self, signo: usize, handler: u32) -> Result<u32, ThreadError> {
        Ok(self.slot(signo)?.swap(handler, Ordering::AcqRel))
    }

    pub fn get(&self, signo: usize) -> Result<u32, ThreadError> {
        Ok(self.slot(signo)?.load(Ordering::Acquire))
    }

    /// Reset every handler to the default action (as on exec).
    pub fn reset(&self) {
        for h in &self.handlers {
            h.store(SIG_DFL, Ordering::Release);
        }
    }
}
