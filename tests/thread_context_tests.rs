//! Thread context lifecycle against real mappings.
//!
//! Each test builds its own manager with its own arena hint, and the test
//! harness runs every test on a fresh thread, so thread-local bindings do
//! not leak between tests.

use std::mem;
use std::ptr;
use std::sync::Arc;
use std::thread;

use xlat::config::{ContextConfig, HookAddrs, TranslatorConfig};
use xlat::jit::memory::PageState;
use xlat::jit::{GuestRegion, JumpCache, Translator};
use xlat::vm::{
    CloneFlags, ContextManager, ThreadError, current_handle, protect_context, unprotect_context,
    with_current,
};

const HOOKS: HookAddrs = HookAddrs {
    dispatcher_return: 0x0700_0100,
    indirect_jump: 0x0700_0200,
    fragment_exit: 0x0700_0300,
};

fn manager(region_base: u64, max_threads: usize) -> ContextManager {
    let config = ContextConfig {
        max_threads,
        region_base,
        signal_stack_pages: 2,
        hooks: HOOKS,
    };
    ContextManager::new(&config).unwrap()
}

fn signal_blocked(signo: libc::c_int) -> bool {
    unsafe {
        let mut cur: libc::sigset_t = mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut cur);
        libc::sigismember(&cur, signo) == 1
    }
}

/// Permissions (`r-xp` and so on) of the mapping holding `addr`.
fn mapping_perms(addr: u32) -> String {
    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    let addr = u64::from(addr);
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next().unwrap().split_once('-').unwrap();
        let start = u64::from_str_radix(start, 16).unwrap();
        let end = u64::from_str_radix(end, 16).unwrap();
        if (start..end).contains(&addr) {
            return fields.next().unwrap().to_string();
        }
    }
    panic!("{:#x} is not mapped", addr);
}

#[test]
fn test_init_threads_lays_out_region() {
    let mgr = manager(0x6100_0000, 4);
    let handle = mgr.init_threads().unwrap();
    assert_eq!(handle.slot, 0);
    assert_eq!(handle.manager, mgr.id());
    assert_eq!(current_handle(), Some(handle));
    assert_eq!(mgr.allocated(), 1);
    assert!(matches!(mgr.init_threads(), Err(ThreadError::AlreadyBound)));

    with_current(|ctx| {
        let layout = *ctx.layout();
        let base = ctx.base_addr();
        assert_eq!(base as usize, mgr.arena_base());
        assert_eq!(ctx.fragment_page_addr(), base + layout.fragment_offset() as u32);
        assert_eq!(ctx.guard_page_addr(), base + layout.guard_offset() as u32);
        assert_eq!(ctx.page_state(), PageState::Executable);

        let block = ctx.block();
        assert_eq!(block.my_addr, base);
        assert_eq!(block.jit_return_addr, HOOKS.dispatcher_return);
        assert_eq!(block.runtime_ijmp_addr, HOOKS.indirect_jump);
        assert_eq!(block.jit_fragment_exit_addr, HOOKS.fragment_exit);
        assert_eq!(block.scratch_stack_top, base + layout.page_size() as u32);
        assert_eq!(block.sigwrap_stack_top, ctx.guard_page_addr() - 4);

        ctx.set_next_eip(0x0804_8123);
        ctx.set_user_esp(0xBFFF_F000);
        assert_eq!(ctx.next_eip(), 0x0804_8123);
        assert_eq!(ctx.user_esp(), 0xBFFF_F000);
        assert_eq!(ctx.cells().next_eip, base + 16);
    })
    .unwrap();

    assert_eq!(mgr.user_exit(3).unwrap(), 3);
    assert_eq!(current_handle(), None);
    assert_eq!(mgr.allocated(), 0);
}

#[test]
fn test_protect_unprotect() {
    let mgr = manager(0x6140_0000, 2);
    mgr.init_threads().unwrap();

    unprotect_context().unwrap();
    assert_eq!(with_current(|ctx| ctx.page_state()).unwrap(), PageState::Writable);
    protect_context().unwrap();
    assert_eq!(with_current(|ctx| ctx.page_state()).unwrap(), PageState::Executable);
    mgr.user_exit(0).unwrap();
}

#[test]
fn test_region_protections() {
    let mgr = manager(0x6440_0000, 2);
    mgr.init_threads().unwrap();
    let (control, guard, page) = with_current(|ctx| {
        (ctx.base_addr(), ctx.guard_page_addr(), ctx.fragment_page_addr())
    })
    .unwrap();

    assert_eq!(mapping_perms(control), "rw-p");
    assert_eq!(mapping_perms(guard), "---p");
    assert_eq!(mapping_perms(page), "r-xp");

    unprotect_context().unwrap();
    assert_eq!(mapping_perms(page), "rw-p");
    assert_eq!(mapping_perms(guard), "---p");
    protect_context().unwrap();
    assert_eq!(mapping_perms(page), "r-xp");

    with_current(|ctx| {
        let _guard = ctx.writable().unwrap();
        assert_eq!(mapping_perms(page), "rw-p");
    })
    .unwrap();
    assert_eq!(mapping_perms(page), "r-xp");
    mgr.user_exit(0).unwrap();
}

#[test]
fn test_writable_guard_restores_state() {
    let mgr = manager(0x6180_0000, 2);
    mgr.init_threads().unwrap();
    assert!(!signal_blocked(libc::SIGUSR1));

    with_current(|ctx| {
        {
            let mut guard = ctx.writable().unwrap();
            assert!(signal_blocked(libc::SIGUSR1));
            let bytes = guard.bytes();
            bytes[0] = 0xCC;
            bytes[1] = 0x90;
        }
        assert_eq!(ctx.page_state(), PageState::Executable);
        assert_eq!(&ctx.fragment_snapshot()[..2], &[0xCC, 0x90]);
    })
    .unwrap();

    assert!(!signal_blocked(libc::SIGUSR1));
    mgr.user_exit(0).unwrap();
}

#[test]
fn test_translate_into_context_and_invalidate() {
    let mgr = manager(0x61C0_0000, 2);
    mgr.init_threads().unwrap();
    let translator = Translator::new(&TranslatorConfig::default());
    let guest = [0x90, 0x70, 0xFD, 0x90];
    let region = GuestRegion::new(&guest, 0x0804_8000);

    with_current(|ctx| {
        let entry = ctx.translate_fragment(&translator, &region, 1);
        let page = ctx.fragment_page_addr();
        assert_eq!(entry, page + 1);
        assert_eq!(ctx.page_state(), PageState::Executable);

        let code = ctx.fragment_snapshot();
        assert_eq!(code[0], 0x90);
        assert_eq!(&code[1..3], &[0x0F, 0x80]);
        // stores into this context's next-address cell
        let cell = ctx.cells().next_eip.to_le_bytes();
        assert_eq!(code[7], 0x90);
        assert_eq!(&code[8..10], &[0xC7, 0x05]);
        assert_eq!(&code[10..14], &cell);

        let again = ctx.translate_fragment(&translator, &region, 1);
        assert_eq!(again, entry);
        assert_eq!(ctx.fragment_snapshot(), code);

        let resident = *ctx.resident().unwrap();
        assert_eq!(resident.guest_base, 0x0804_8000);
        assert_eq!(resident.guest_len, 4);
        assert_eq!(resident.entry, entry);

        let cache = JumpCache::new();
        cache.insert(0x0804_8001, entry);
        cache.insert(0x0805_0000, 0x6500_0000);

        let miss = cache.invalidate_range(ctx, 0x0804_9000, 0x100);
        assert_eq!(miss.evicted, 0);
        assert!(!miss.fragment_dropped);
        assert!(ctx.resident().is_some());

        let hit = cache.invalidate_range(ctx, 0x0804_8002, 1);
        assert_eq!(hit.evicted, 0);
        assert!(hit.fragment_dropped);
        assert!(ctx.resident().is_none());

        cache.invalidate_range(ctx, 0x0804_8000, 4);
        assert_eq!(cache.lookup(0x0804_8001), None);
        assert_eq!(cache.lookup(0x0805_0000), Some(0x6500_0000));
    })
    .unwrap();
    mgr.user_exit(0).unwrap();
}

#[test]
fn test_failed_clone_releases_slot() {
    let mgr = manager(0x6200_0000, 4);
    mgr.init_threads().unwrap();

    let err = mgr
        .user_clone(CloneFlags::VM | CloneFlags::THREAD, || -11)
        .unwrap_err();
    assert!(matches!(err, ThreadError::CloneFailed { errno: 11 }));
    assert_eq!(mgr.allocated(), 1);
    assert!(!mgr.is_allocated(1));
    mgr.user_exit(0).unwrap();
}

#[test]
fn test_clone_beyond_capacity() {
    let mgr = manager(0x6240_0000, 1);
    mgr.init_threads().unwrap();

    let mut called = false;
    let err = mgr
        .user_clone(CloneFlags::VM, || {
            called = true;
            1000
        })
        .unwrap_err();
    assert!(matches!(err, ThreadError::NoFreeSlot { capacity: 1 }));
    assert!(!called);
    mgr.user_exit(0).unwrap();
}

#[test]
fn test_clone_parent_and_child() {
    let mgr = Arc::new(manager(0x6280_0000, 4));
    let parent = mgr.init_threads().unwrap();

    // parent side keeps its binding; the new slot is the child's
    assert_eq!(mgr.user_clone(CloneFlags::VM, || 4242).unwrap(), 4242);
    assert_eq!(current_handle(), Some(parent));
    assert!(mgr.is_allocated(1));

    // child side binds the freshly prepared context
    let child_mgr = Arc::clone(&mgr);
    let child = thread::spawn(move || {
        assert_eq!(child_mgr.user_clone(CloneFlags::VM, || 0).unwrap(), 0);
        let handle = current_handle().unwrap();
        let state = with_current(|ctx| ctx.page_state()).unwrap();
        child_mgr.user_exit(0).unwrap();
        (handle, state)
    })
    .join()
    .unwrap();

    assert_eq!(child.0.slot, 2);
    assert_eq!(child.1, PageState::Executable);
    assert!(!mgr.is_allocated(2));
    assert_eq!(mgr.allocated(), 2);
    mgr.user_exit(0).unwrap();
}

#[test]
fn test_fork_style_clone_unshares() {
    let mgr = manager(0x62C0_0000, 8);
    mgr.init_threads().unwrap();
    mgr.user_clone(CloneFlags::VM, || 11).unwrap();
    mgr.user_clone(CloneFlags::VM, || 12).unwrap();
    assert_eq!(mgr.allocated(), 3);

    // parent of a fork keeps everything
    assert_eq!(mgr.user_clone(CloneFlags::empty(), || 99).unwrap(), 99);
    assert_eq!(mgr.allocated(), 3);

    // the child only keeps its own slot
    assert_eq!(mgr.user_clone(CloneFlags::empty(), || 0).unwrap(), 0);
    assert_eq!(mgr.allocated(), 1);
    assert!(mgr.is_allocated(0));

    let err = mgr.user_clone(CloneFlags::empty(), || -12).unwrap_err();
    assert!(matches!(err, ThreadError::CloneFailed { errno: 12 }));
    mgr.user_exit(0).unwrap();
}

#[test]
fn test_spawn_releases_slot() {
    let mgr = Arc::new(manager(0x6300_0000, 4));
    let worker = mgr.spawn(|| current_handle()).unwrap();
    let handle = worker.join().unwrap().unwrap();
    assert_eq!(handle.slot, 0);
    assert_eq!(mgr.allocated(), 0);
}

#[test]
fn test_exit_without_context() {
    let mgr = manager(0x6340_0000, 2);
    assert!(matches!(mgr.user_exit(0), Err(ThreadError::NotBound)));
}

#[test]
fn test_foreign_context_exit() {
    let a = manager(0x6380_0000, 2);
    let b = manager(0x63C0_0000, 2);
    a.init_threads().unwrap();
    assert!(matches!(b.user_exit(0), Err(ThreadError::ForeignContext)));
    assert!(current_handle().is_some());
    a.user_exit(0).unwrap();
}

#[test]
fn test_shared_tables_follow_contexts() {
    let mgr = manager(0x6400_0000, 2);
    mgr.init_threads().unwrap();
    mgr.signals().set(10, 0x0804_9000).unwrap();
    let seen = with_current(|ctx| ctx.signals().get(10).unwrap()).unwrap();
    assert_eq!(seen, 0x0804_9000);
    assert!(with_current(|ctx| Arc::ptr_eq(ctx.files(), mgr.files())).unwrap());
    mgr.user_exit(0).unwrap();
}
