//! FFI type definitions for the C API.

use std::ffi::c_void;

use crate::config::{ContextConfig, EngineConfig, HookAddrs, TranslatorConfig};
use crate::vm::ThreadError;

/// Result codes for FFI operations.
///
/// These map to the `XlatResult` enum in C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlatResult {
    /// Operation succeeded
    Ok = 0,
    /// The calling thread has no context
    ErrorNotBound = 1,
    /// A mapping or protection change failed
    ErrorMemory = 2,
    /// Every context slot is in use
    ErrorNoSlot = 3,
    /// Anything else
    ErrorRuntime = 4,
    /// The engine configuration was rejected
    ErrorConfig = 5,
    /// The clone callback reported an errno
    ErrorClone = 6,
}

impl XlatResult {
    pub fn is_ok(self) -> bool {
        self == XlatResult::Ok
    }

    pub fn is_err(self) -> bool {
        self != XlatResult::Ok
    }
}

impl From<ThreadError> for XlatResult {
    fn from(err: ThreadError) -> Self {
        match err {
            ThreadError::NotBound => XlatResult::ErrorNotBound,
            ThreadError::Memory(_) | ThreadError::RegionOutOfRange { .. } => XlatResult::ErrorMemory,
            ThreadError::NoFreeSlot { .. } => XlatResult::ErrorNoSlot,
            ThreadError::Config(_) => XlatResult::ErrorConfig,
            ThreadError::CloneFailed { .. } => XlatResult::ErrorClone,
            _ => XlatResult::ErrorRuntime,
        }
    }
}

impl From<Result<(), ThreadError>> for XlatResult {
    fn from(result: Result<(), ThreadError>) -> Self {
        result.map_or_else(XlatResult::from, |()| XlatResult::Ok)
    }
}

/// Engine configuration passed by the dispatcher.
///
/// These map to the `XlatConfig` struct in C. Addresses are 32-bit because
/// generated code refers to them directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlatConfig {
    pub max_threads: u32,
    pub region_base: u32,
    pub signal_stack_pages: u32,
    pub dispatcher_return: u32,
    pub indirect_jump: u32,
    pub fragment_exit: u32,
    pub runtime_code_start: u32,
    pub runtime_code_size: u32,
    /// Log a listing of every translated fragment
    pub trace: bool,
}

impl Default for XlatConfig {
    fn default() -> Self {
        let threads = ContextConfig::default();
        Self {
            max_threads: threads.max_threads as u32,
            region_base: threads.region_base as u32,
            signal_stack_pages: threads.signal_stack_pages as u32,
            dispatcher_return: 0,
            indirect_jump: 0,
            fragment_exit: 0,
            runtime_code_start: 0,
            runtime_code_size: 0,
            trace: false,
        }
    }
}

impl From<XlatConfig> for EngineConfig {
    fn from(config: XlatConfig) -> Self {
        EngineConfig {
            translator: TranslatorConfig {
                runtime_code_start: config.runtime_code_start,
                runtime_code_size: config.runtime_code_size,
            },
            threads: ContextConfig {
                max_threads: config.max_threads as usize,
                region_base: u64::from(config.region_base),
                signal_stack_pages: config.signal_stack_pages as usize,
                hooks: HookAddrs {
                    dispatcher_return: config.dispatcher_return,
                    indirect_jump: config.indirect_jump,
                    fragment_exit: config.fragment_exit,
                },
            },
            trace: config.trace,
        }
    }
}

/// Performs the actual `clone` system call on behalf of `xlat_user_clone`.
///
/// Returns the raw result: a negative errno, 0 in the child, the child's
/// tid in the parent.
pub type XlatCloneFn = extern "C" fn(data: *mut c_void) -> i64;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::memory::MemoryError;

    #[test]
    fn test_result_mapping() {
        assert!(XlatResult::from(Ok::<(), ThreadError>(())).is_ok());
        assert_eq!(
            XlatResult::from(Err::<(), _>(ThreadError::NotBound)),
            XlatResult::ErrorNotBound
        );
        assert_eq!(
            XlatResult::from(ThreadError::Memory(MemoryError::InvalidSize)),
            XlatResult::ErrorMemory
        );
        assert_eq!(
            XlatResult::from(ThreadError::NoFreeSlot { capacity: 1 }),
            XlatResult::ErrorNoSlot
        );
        assert_eq!(
            XlatResult::from(ThreadError::CloneFailed { errno: 11 }),
            XlatResult::ErrorClone
        );
        assert_eq!(
            XlatResult::from(ThreadError::Config("max_threads".into())),
            XlatResult::ErrorConfig
        );
        assert_eq!(XlatResult::from(ThreadError::AlreadyBound), XlatResult::ErrorRuntime);
    }

    #[test]
    fn test_config_conversion() {
        let config = EngineConfig::from(XlatConfig {
            max_threads: 4,
            fragment_exit: 0x0700_0300,
            runtime_code_size: 0x1000,
            ..XlatConfig::default()
        });
        assert_eq!(config.threads.max_threads, 4);
        assert_eq!(config.threads.region_base, 0x6000_0000);
        assert_eq!(config.threads.signal_stack_pages, 4);
        assert_eq!(config.threads.hooks.fragment_exit, 0x0700_0300);
        assert_eq!(config.translator.runtime_code_size, 0x1000);
        assert!(config.validate().is_ok());

        let config = EngineConfig::from(XlatConfig::default());
        assert_eq!(config, EngineConfig::default());
    }
}
