//! xlat - fragment translation core for an i386 binary translator
//!
//! This library provides the fragment translator, the jump cache and the
//! per-thread execution contexts a dispatcher builds on.
//! For the native dispatcher, use the FFI module functions.

pub mod config;
pub mod decode;
pub mod ffi;
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{ContextConfig, EngineConfig, HookAddrs, TranslatorConfig};
pub use decode::{ControlAction, Decoder, I386Decoder, Instruction};
pub use jit::{Fragment, FragmentCells, GuestRegion, JumpCache, OutputPage, TranslateError, Translator};
pub use vm::{CloneFlags, ContextManager, ThreadContext, ThreadError};

// Re-export FFI types for C bindings
pub use ffi::*;
