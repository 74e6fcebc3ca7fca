//! Sampling profiler behavior observable through the public API.

use parking_lot::Mutex;

// Sampling rates are process-wide; tests that override them take this.
static RATES: Mutex<()> = Mutex::new(());

#[test]
fn test_sampled_allocation_reports_exact_size() {
    let _lock = RATES.lock();
    let _all = spanalloc::ScopedAlwaysSample::new();

    for size in [1usize, 37, 1000, 12_345, 300_000] {
        let p = spanalloc::try_alloc(size).expect("alloc");
        assert_eq!(spanalloc::allocated_size(p.as_ptr()), Some(size));
        unsafe {
            if size > 0 {
                p.as_ptr().write_bytes(0x99, size);
            }
            spanalloc::dealloc_sized(p.as_ptr(), size);
        }
    }
}

#[test]
fn test_sampled_size_returning_capacity_is_exact() {
    let _lock = RATES.lock();
    let _all = spanalloc::ScopedAlwaysSample::new();

    let a = spanalloc::try_alloc_size_returning(12_345).expect("alloc");
    assert_eq!(a.capacity, 12_345);
    unsafe { spanalloc::dealloc_sized(a.ptr.as_ptr(), 12_345) };
}

#[test]
fn test_never_sample_reports_rounded_size() {
    let _lock = RATES.lock();
    let _none = spanalloc::ScopedNeverSample::new();

    let p = spanalloc::try_alloc(12_345).expect("alloc");
    let reported = spanalloc::allocated_size(p.as_ptr()).expect("live");
    assert_eq!(
        reported,
        spanalloc::rounded_size(12_345, spanalloc::MIN_ALIGN).expect("satisfiable")
    );
    assert!(reported > 12_345);
    unsafe { spanalloc::dealloc(p.as_ptr()) };
}

#[test]
fn test_guarded_sampling_allocations_are_usable() {
    let _lock = RATES.lock();
    let _all = spanalloc::ScopedAlwaysSample::new();
    let _guarded = spanalloc::ScopedGuardedSamplingRate::new(0);

    for size in [1usize, 4000, 8192, 100_000] {
        let p = spanalloc::try_alloc(size).expect("alloc");
        assert_eq!(spanalloc::allocated_size(p.as_ptr()), Some(size));
        unsafe {
            // The whole requested range must be writable right up to the
            // guard page.
            p.as_ptr().write_bytes(0xEE, size);
            assert_eq!(p.as_ptr().add(size - 1).read(), 0xEE);
            spanalloc::dealloc_sized(p.as_ptr(), size);
        }
    }
}

#[test]
fn test_sampled_count_grows_under_always_sample() {
    let _lock = RATES.lock();
    let before = spanalloc::numeric_property("sampler.sampled_count").expect("prop");
    let _all = spanalloc::ScopedAlwaysSample::new();
    let mut held = Vec::new();
    for _ in 0..32 {
        held.push(spanalloc::try_alloc(100).expect("alloc"));
    }
    let after = spanalloc::numeric_property("sampler.sampled_count").expect("prop");
    assert!(after >= before + 32);
    for p in held {
        unsafe { spanalloc::dealloc(p.as_ptr()) };
    }
}

#[test]
fn test_realloc_of_sampled_allocation_copies() {
    let _lock = RATES.lock();
    let p = {
        let _all = spanalloc::ScopedAlwaysSample::new();
        spanalloc::try_alloc(1000).expect("alloc")
    };
    unsafe {
        for i in 0..1000 {
            p.as_ptr().add(i).write((i % 127) as u8);
        }
        let q = spanalloc::realloc(p.as_ptr(), 2000).expect("realloc");
        for i in 0..1000 {
            assert_eq!(q.as_ptr().add(i).read(), (i % 127) as u8);
        }
        spanalloc::dealloc(q.as_ptr());
    }
}
