//! Code generation for translated guest fragments.
//!
//! - `memory`: mapping and W^X protection of context regions
//! - `codebuf` / `i386`: byte buffer and typed i386 encoder
//! - `fragment`: the two-pass fragment translator
//! - `jmp_cache`: guest → generated address cache
//! - `listing`: hex parsing and dumps

mod codebuf;
pub mod fragment;
pub mod i386;
pub mod jmp_cache;
pub mod listing;
pub mod memory;

use std::fmt::Display;

pub use codebuf::CodeBuffer;
pub use fragment::{Fragment, FragmentCells, GuestRegion, OutputPage, TranslateError, Translator};
pub use jmp_cache::{CacheStats, Invalidation, JumpCache};

/// Abort translation for good.
///
/// A half-built fragment cannot be abandoned safely, so translation errors
/// never reach the dispatcher. Release builds abort on panic.
#[cold]
#[track_caller]
pub fn fatal(err: impl Display) -> ! {
    log::error!("fatal: {}", err);
    panic!("{}", err);
}
