//! Misuse must abort deterministically, not corrupt the heap.
//!
//! Each case re-runs this test binary with an environment variable that
//! makes `misuse_child` perform the invalid operation; the parent
//! asserts the child died.

use std::env;
use std::process::Command;

const CASE_VAR: &str = "SPANALLOC_MISUSE_CASE";

#[test]
fn misuse_child() {
    let Ok(case) = env::var(CASE_VAR) else {
        return;
    };
    match case.as_str() {
        "wrong_sized_free" => {
            let p = spanalloc::try_alloc(100).expect("alloc");
            // 100 and 10000 round to different classes.
            unsafe { spanalloc::dealloc_sized(p.as_ptr(), 10_000) };
        }
        "foreign_pointer" => {
            let local = Box::new(7u64);
            unsafe { spanalloc::dealloc(Box::into_raw(local).cast()) };
        }
        "large_double_free" => {
            let p = spanalloc::try_alloc(1 << 20).expect("alloc");
            unsafe {
                spanalloc::dealloc(p.as_ptr());
                spanalloc::dealloc(p.as_ptr());
            }
        }
        "interior_pointer" => {
            let p = spanalloc::try_alloc(1 << 20).expect("alloc");
            unsafe { spanalloc::dealloc(p.as_ptr().add(8)) };
        }
        other => panic!("unknown case {other}"),
    }
    unreachable!("misuse case {case} did not abort");
}

fn assert_child_aborts(case: &str) {
    let exe = env::current_exe().expect("test binary path");
    let out = Command::new(exe)
        .env(CASE_VAR, case)
        .args(["--exact", "misuse_child", "--nocapture", "--test-threads=1"])
        .output()
        .expect("spawn child");
    assert!(
        !out.status.success(),
        "case {case} did not abort; stdout: {}",
        String::from_utf8_lossy(&out.stdout)
    );
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("spanalloc:"),
        "case {case} died without diagnostic; stderr: {stderr}"
    );
}

#[test]
fn test_wrong_sized_free_aborts() {
    assert_child_aborts("wrong_sized_free");
}

#[test]
fn test_foreign_pointer_free_aborts() {
    assert_child_aborts("foreign_pointer");
}

#[test]
fn test_large_double_free_aborts() {
    assert_child_aborts("large_double_free");
}

#[test]
fn test_interior_pointer_free_aborts() {
    assert_child_aborts("interior_pointer");
}
