//! Guest thread contexts and their lifecycle.

pub mod context;
pub mod shared;
pub mod threads;

pub use context::{ContextBlock, RegionLayout, ResidentFragment, ThreadContext, WritableGuard};
pub use shared::{FileEntry, FileTable, SignalTable};
pub use threads::{
    CloneFlags, ContextHandle, ContextManager, SlotTable, ThreadError, current_handle,
    protect_context, unprotect_context, with_current,
};
