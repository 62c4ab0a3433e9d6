//! C entry points for the native dispatcher.
//!
//! The dispatcher is written in assembly and C; it starts the engine,
//! requests fragments, manages guest thread lifetime and reaches the jump
//! cache through these functions. Only the entry points that read guest
//! memory or write through a caller pointer are `unsafe` to call.

mod types;

pub use types::{XlatCloneFn, XlatConfig, XlatResult};

use std::ffi::c_void;
use std::sync::OnceLock;

use log::{debug, error};

use crate::config::EngineConfig;
use crate::jit::{GuestRegion, JumpCache, Translator};
use crate::vm::{self, CloneFlags, ContextManager, ThreadError};

/// Version information
pub const XLAT_VERSION_MAJOR: u32 = 0;
pub const XLAT_VERSION_MINOR: u32 = 1;
pub const XLAT_VERSION_PATCH: u32 = 0;

/// Process-wide translator and context manager behind the C API.
struct Engine {
    manager: ContextManager,
    translator: Translator,
}

static ENGINE: OnceLock<Engine> = OnceLock::new();

/// The running engine, starting it with `config` if needed.
fn start_engine(config: &EngineConfig) -> Result<&'static Engine, ThreadError> {
    if let Some(engine) = ENGINE.get() {
        return Ok(engine);
    }
    let manager = ContextManager::new(&config.threads)?;
    let translator = Translator::new(&config.translator).with_trace(config.trace);
    // a racing start may win; its engine is the one kept
    Ok(ENGINE.get_or_init(|| Engine {
        manager,
        translator,
    }))
}

/// Default engine configuration, for the dispatcher to adjust.
#[unsafe(no_mangle)]
pub extern "C" fn xlat_default_config() -> XlatConfig {
    XlatConfig::default()
}

/// Start the engine and give the calling thread its first context.
///
/// The first successful call fixes the configuration of the process; later
/// calls only bind a context to the calling thread.
#[unsafe(no_mangle)]
pub extern "C" fn xlat_init_threads(config: XlatConfig) -> XlatResult {
    let config = EngineConfig::from(config);
    if let Err(err) = config.validate() {
        error!("xlat_init_threads: {}", err);
        return XlatResult::ErrorConfig;
    }
    match start_engine(&config).and_then(|engine| engine.manager.init_threads()) {
        Ok(handle) => {
            debug!("xlat_init_threads: bound slot {}", handle.slot);
            XlatResult::Ok
        }
        Err(err) => {
            error!("xlat_init_threads: {}", err);
            err.into()
        }
    }
}

/// Translate the guest code at `[addr, addr + len)` into the calling
/// thread's fragment page and return the generated address of the guest
/// instruction at `entry`.
///
/// Returns 0 if the calling thread has no context. Code that cannot be
/// translated aborts the process.
///
/// # Safety
/// `[addr, addr + len)` must be readable and must not change during the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xlat_jit_fragment(addr: u32, len: u32, entry: u32) -> u32 {
    let Some(engine) = ENGINE.get() else {
        error!("xlat_jit_fragment: engine not started");
        return 0;
    };
    let bytes: &[u8] = if len == 0 {
        &[]
    } else {
        // SAFETY: the caller guarantees the range is readable
        unsafe { std::slice::from_raw_parts(addr as usize as *const u8, len as usize) }
    };
    let region = GuestRegion::new(bytes, addr);
    let entry = entry.wrapping_sub(addr) as usize;

    match vm::with_current(|ctx| ctx.translate_fragment(&engine.translator, &region, entry)) {
        Ok(jit_entry) => jit_entry,
        Err(err) => {
            error!("xlat_jit_fragment: {}", err);
            0
        }
    }
}

/// Create a guest thread or process.
///
/// `clone` performs the system call with `data`. With `CLONE_VM` in
/// `flags` a context is prepared first and bound in the child. The raw
/// result of `clone` is stored in `ret` when it ran: the child's tid, 0 in
/// the child, or a negative errno (reported as `ErrorClone`).
///
/// # Safety
/// `ret` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xlat_user_clone(
    flags: u64,
    clone: XlatCloneFn,
    data: *mut c_void,
    ret: *mut i64,
) -> XlatResult {
    let Some(engine) = ENGINE.get() else {
        return XlatResult::ErrorNotBound;
    };
    let flags = CloneFlags::from_bits_truncate(flags);
    let result = engine.manager.user_clone(flags, || clone(data));

    let raw = match &result {
        Ok(value) => Some(*value),
        Err(ThreadError::CloneFailed { errno }) => Some(-errno),
        Err(_) => None,
    };
    if let (Some(raw), false) = (raw, ret.is_null()) {
        // SAFETY: non-null and valid for writes per the caller
        unsafe { ret.write(raw) };
    }
    result.map(|_| ()).into()
}

/// Release the calling thread's context.
///
/// On `Ok` the caller must end the OS thread with `status` right away and
/// must not touch its context region again.
#[unsafe(no_mangle)]
pub extern "C" fn xlat_user_exit(status: i32) -> XlatResult {
    let Some(engine) = ENGINE.get() else {
        return XlatResult::ErrorNotBound;
    };
    engine.manager.user_exit(status).map(|_| ()).into()
}

/// Record a translation in the process-wide jump cache.
#[unsafe(no_mangle)]
pub extern "C" fn xlat_add_jmp_mapping(addr: u32, jit_addr: u32) {
    JumpCache::global().insert(addr, jit_addr);
}

/// Look up a translation. Returns 0 on a miss.
#[unsafe(no_mangle)]
pub extern "C" fn xlat_find_jmp_mapping(addr: u32) -> u32 {
    JumpCache::global().lookup(addr).unwrap_or(0)
}

/// Invalidate guest code in `[addr, addr + len)`.
///
/// Also drops the calling thread's resident fragment when it overlaps.
/// Threads without a context only evict cache entries.
#[unsafe(no_mangle)]
pub extern "C" fn xlat_clear_jmp_cache(addr: u32, len: u32) -> XlatResult {
    let cache = JumpCache::global();
    match vm::with_current(|ctx| cache.invalidate_range(ctx, addr, len)) {
        Ok(_) => XlatResult::Ok,
        Err(ThreadError::NotBound) => {
            cache.evict_range(addr, len);
            XlatResult::Ok
        }
        Err(err) => err.into(),
    }
}

/// Make the calling thread's fragment page executable.
#[unsafe(no_mangle)]
pub extern "C" fn xlat_protect_ctx() -> XlatResult {
    vm::protect_context().into()
}

/// Make the calling thread's fragment page writable.
#[unsafe(no_mangle)]
pub extern "C" fn xlat_unprotect_ctx() -> XlatResult {
    vm::unprotect_context().into()
}

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn xlat_version() -> *const std::ffi::c_char {
    static VERSION: &[u8] = b"0.1.0\0";
    VERSION.as_ptr() as *const std::ffi::c_char
}

/// Get the major version number
#[unsafe(no_mangle)]
pub extern "C" fn xlat_version_major() -> u32 {
    XLAT_VERSION_MAJOR
}

/// Get the minor version number
#[unsafe(no_mangle)]
pub extern "C" fn xlat_version_minor() -> u32 {
    XLAT_VERSION_MINOR
}

/// Get the patch version number
#[unsafe(no_mangle)]
pub extern "C" fn xlat_version_patch() -> u32 {
    XLAT_VERSION_PATCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(xlat_version_major(), 0);
        assert_eq!(xlat_version_minor(), 1);
        assert_eq!(xlat_version_patch(), 0);

        let version = unsafe { std::ffi::CStr::from_ptr(xlat_version()).to_str().unwrap() };
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_jmp_mapping_roundtrip() {
        // high addresses keep clear of other tests using the global cache
        xlat_add_jmp_mapping(0xF00D_1230, 0x6000_3000);
        assert_eq!(xlat_find_jmp_mapping(0xF00D_1230), 0x6000_3000);
        assert_eq!(xlat_find_jmp_mapping(0xF00E_1230), 0);

        assert_eq!(xlat_clear_jmp_cache(0xF00D_1230, 1), XlatResult::Ok);
        assert_eq!(xlat_find_jmp_mapping(0xF00D_1230), 0);
    }

    #[test]
    fn test_protect_without_context() {
        assert_eq!(xlat_protect_ctx(), XlatResult::ErrorNotBound);
        assert_eq!(xlat_unprotect_ctx(), XlatResult::ErrorNotBound);
    }
}
