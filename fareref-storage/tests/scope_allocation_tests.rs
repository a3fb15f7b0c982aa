//! Heap traffic of scope registrations, measured with a counting allocator.
//!
//! Lives in its own test binary so the global allocator does not affect the
//! other suites. Counting is switched on per thread, so the test harness's
//! own threads do not pollute the numbers.

use fareref_storage::DeferredOwnershipScope;
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountingAllocator;

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
}

fn note_allocation() {
    if COUNTING.try_with(Cell::get).unwrap_or(false) {
        ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        note_allocation();
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

/// Number of allocations made by the current thread while running `f`.
fn allocations_during(f: impl FnOnce()) -> usize {
    let before = ALLOCATIONS.load(Ordering::SeqCst);
    COUNTING.with(|counting| counting.set(true));
    f();
    COUNTING.with(|counting| counting.set(false));
    ALLOCATIONS.load(Ordering::SeqCst) - before
}

#[test]
fn test_single_extension_does_not_allocate() {
    let shared = Arc::new(vec![1u32, 2, 3]);
    let mut scope = DeferredOwnershipScope::new();

    let allocations = allocations_during(|| {
        {
            let view = scope.extend(&shared).expect("extend");
            assert_eq!(view.len(), 3);
        }
        let report = scope.release().expect("release");
        assert_eq!(report.extended, 1);
    });

    assert_eq!(allocations, 0);
    assert_eq!(Arc::strong_count(&shared), 1);
}

#[test]
fn test_single_adoption_allocates_only_the_object() {
    let mut scope = DeferredOwnershipScope::new();

    // The adopted Arc and its type-erased disposal record.
    let allocations = allocations_during(|| {
        scope.adopt(7u64).expect("adopt");
        assert_eq!(scope.release().expect("release").adopted, 1);
    });

    assert_eq!(allocations, 2);
}
