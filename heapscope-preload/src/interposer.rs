//! Replacements for the six C allocator / dynamic-loader entry points.
//!
//! Each exported function (1) calls the real underlying routine and
//! forwards its result unchanged, then (2) traces the call if this
//! thread isn't already inside a traced call on the same entry point.
//! See [`crate::guard::trace_if_outermost`] for the recursion contract.

use std::ffi::c_void;
use std::sync::OnceLock;

use libc::{c_char, c_int, size_t};

use crate::config::Config;
use crate::guard::{
    trace_if_outermost, CALLOC_INSIDE, DLCLOSE_INSIDE, DLOPEN_INSIDE, FREE_INSIDE,
    MALLOC_INSIDE, REALLOC_INSIDE,
};
use crate::tracker::Tracker;

type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;

/// Resolves `name` via `dlsym(RTLD_NEXT, ...)`. Failing to resolve an
/// underlying allocator primitive is a programming bug, not something the
/// target can run without, so this aborts the process rather than
/// returning an error the caller would have to thread through every
/// allocation.
unsafe fn resolve_next(name: &[u8]) -> *mut c_void {
    let ptr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char);
    if ptr.is_null() {
        libc::abort();
    }
    ptr
}

/// `calloc` is resolved specially: `dlsym(RTLD_NEXT, "calloc")` itself
/// allocates on some libcs (to build its own internal bookkeeping),
/// which would recurse back into this very function before it has a
/// resolved pointer to call. Glibc's internal `__libc_calloc` entry
/// point breaks that cycle; fall back to the ordinary lookup when it
/// isn't present (e.g. musl).
unsafe fn resolve_calloc() -> CallocFn {
    let direct = libc::dlsym(libc::RTLD_DEFAULT, c"__libc_calloc".as_ptr());
    let resolved = if !direct.is_null() {
        direct
    } else {
        resolve_next(b"calloc\0")
    };
    std::mem::transmute(resolved)
}

fn calloc_fn() -> CallocFn {
    static CALLOC: OnceLock<CallocFn> = OnceLock::new();
    *CALLOC.get_or_init(|| unsafe { resolve_calloc() })
}

fn malloc_fn() -> MallocFn {
    static MALLOC: OnceLock<MallocFn> = OnceLock::new();
    *MALLOC.get_or_init(|| unsafe { std::mem::transmute(resolve_next(b"malloc\0")) })
}

fn realloc_fn() -> ReallocFn {
    static REALLOC: OnceLock<ReallocFn> = OnceLock::new();
    *REALLOC.get_or_init(|| unsafe { std::mem::transmute(resolve_next(b"realloc\0")) })
}

fn free_fn() -> FreeFn {
    static FREE: OnceLock<FreeFn> = OnceLock::new();
    *FREE.get_or_init(|| unsafe { std::mem::transmute(resolve_next(b"free\0")) })
}

fn dlopen_fn() -> DlopenFn {
    static DLOPEN: OnceLock<DlopenFn> = OnceLock::new();
    *DLOPEN.get_or_init(|| unsafe { std::mem::transmute(resolve_next(b"dlopen\0")) })
}

fn dlclose_fn() -> DlcloseFn {
    static DLCLOSE: OnceLock<DlcloseFn> = OnceLock::new();
    *DLCLOSE.get_or_init(|| unsafe { std::mem::transmute(resolve_next(b"dlclose\0")) })
}

fn record_alloc(tracker: &Tracker, addr: u64, size: u64) {
    tracker.append(|buf, ts| heapscope_proto::write_alloc(buf, ts, addr, size));
    record_backtrace(tracker);
}

fn record_free(tracker: &Tracker, addr: u64, size: u64) {
    tracker.append(|buf, ts| heapscope_proto::write_free(buf, ts, addr, size));
    record_backtrace(tracker);
}

fn record_backtrace(tracker: &Tracker) {
    for ip in crate::unwinder::capture(Config::get().max_frames) {
        tracker.append(|buf, ts| heapscope_proto::write_backtrace(buf, ts, ip));
    }
}

/// What the interposer should report for a given `realloc` call, decided
/// before any tracing side effect runs.
#[derive(Debug, PartialEq, Eq)]
enum ReallocOutcome {
    /// `realloc(ptr, 0)` with `ptr != null`: report a free of `ptr`.
    Freed { addr: u64 },
    /// Anything else: report an allocation of `new_size` at the address
    /// `realloc` returned.
    Allocated { addr: u64, size: u64 },
}

fn realloc_outcome(ptr: *mut c_void, new_size: size_t, result: *mut c_void) -> ReallocOutcome {
    if !ptr.is_null() && new_size == 0 {
        ReallocOutcome::Freed { addr: ptr as u64 }
    } else {
        ReallocOutcome::Allocated {
            addr: result as u64,
            size: new_size as u64,
        }
    }
}

fn calloc_total_size(num: size_t, size: size_t) -> u64 {
    (num as u64).saturating_mul(size as u64)
}

#[no_mangle]
pub unsafe extern "C" fn calloc(num: size_t, size: size_t) -> *mut c_void {
    let real = calloc_fn();
    let result = real(num, size);
    trace_if_outermost(&CALLOC_INSIDE, || {
        let tracker = Tracker::global();
        tracker.refresh_module_map_if_dirty();
        record_alloc(tracker, result as u64, calloc_total_size(num, size));
    });
    result
}

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let real = malloc_fn();
    let result = real(size);
    trace_if_outermost(&MALLOC_INSIDE, || {
        let tracker = Tracker::global();
        tracker.refresh_module_map_if_dirty();
        record_alloc(tracker, result as u64, size as u64);
    });
    result
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, new_size: size_t) -> *mut c_void {
    let real = realloc_fn();
    let result = real(ptr, new_size);
    trace_if_outermost(&REALLOC_INSIDE, || {
        let tracker = Tracker::global();
        tracker.refresh_module_map_if_dirty();
        match realloc_outcome(ptr, new_size, result) {
            ReallocOutcome::Freed { addr } => record_free(tracker, addr, 0),
            ReallocOutcome::Allocated { addr, size } => record_alloc(tracker, addr, size),
        }
    });
    result
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let real = free_fn();
    real(ptr);
    trace_if_outermost(&FREE_INSIDE, || {
        if !ptr.is_null() {
            let tracker = Tracker::global();
            tracker.refresh_module_map_if_dirty();
            record_free(tracker, ptr as u64, 0);
        }
    });
}

#[no_mangle]
pub unsafe extern "C" fn dlopen(file: *const c_char, mode: c_int) -> *mut c_void {
    let real = dlopen_fn();
    let result = real(file, mode);
    trace_if_outermost(&DLOPEN_INSIDE, || {
        if !result.is_null() {
            Tracker::global().mark_dirty();
        }
    });
    result
}

#[no_mangle]
pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    let real = dlclose_fn();
    let result = real(handle);
    trace_if_outermost(&DLCLOSE_INSIDE, || {
        if result == 0 {
            Tracker::global().mark_dirty();
        }
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn realloc_null_ptr_is_treated_as_alloc() {
        let result = 0x1000 as *mut c_void;
        let outcome = realloc_outcome(ptr::null_mut(), 64, result);
        assert_eq!(
            outcome,
            ReallocOutcome::Allocated {
                addr: 0x1000,
                size: 64
            }
        );
    }

    #[test]
    fn realloc_to_zero_is_treated_as_free_of_original_ptr() {
        let original = 0x2000 as *mut c_void;
        let result = 0x3000 as *mut c_void;
        let outcome = realloc_outcome(original, 0, result);
        assert_eq!(outcome, ReallocOutcome::Freed { addr: 0x2000 });
    }

    #[test]
    fn realloc_grow_reports_the_returned_address() {
        let original = 0x4000 as *mut c_void;
        let result = 0x5000 as *mut c_void;
        let outcome = realloc_outcome(original, 128, result);
        assert_eq!(
            outcome,
            ReallocOutcome::Allocated {
                addr: 0x5000,
                size: 128
            }
        );
    }

    #[test]
    fn calloc_size_is_the_product() {
        assert_eq!(calloc_total_size(4, 16), 64);
    }

    #[test]
    fn calloc_with_zero_count_or_size_does_not_overflow_or_panic() {
        assert_eq!(calloc_total_size(0, 100), 0);
        assert_eq!(calloc_total_size(100, 0), 0);
    }

    #[test]
    fn calloc_size_saturates_instead_of_wrapping() {
        assert_eq!(calloc_total_size(usize::MAX, 2), u64::MAX);
    }
}
