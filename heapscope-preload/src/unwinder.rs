use lazy_static::lazy_static;
use std::sync::Mutex;

lazy_static! {
    /// Serializes calls into `backtrace::trace`. Distinct from, and
    /// always acquired before, the Tracker's write lock (see the
    /// acquisition order in the concurrency model).
    static ref UNWIND_MUTEX: Mutex<()> = Mutex::new(());
}

/// Frames already on the stack above the caller's own code by the time
/// any interposed entry point reaches this function: this closure, and
/// the trampoline (`calloc`/`malloc`/`realloc`/`free`) that called it.
const FRAMES_TO_SKIP: usize = 2;

/// Captures up to `max_frames` return addresses, innermost first, never
/// touching the underlying allocator itself.
pub(crate) fn capture(max_frames: usize) -> Vec<u64> {
    let max_frames = max_frames.min(heapscope_proto::MAX_BACKTRACE_FRAMES);
    let _guard = UNWIND_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let mut frames = Vec::with_capacity(max_frames);
    let mut to_skip = FRAMES_TO_SKIP;
    backtrace::trace(|frame| {
        if to_skip > 0 {
            to_skip -= 1;
            return true;
        }
        frames.push(frame.ip() as u64);
        frames.len() < max_frames
    });
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_requested_cap() {
        let frames = capture(3);
        assert!(frames.len() <= 3);
    }

    #[test]
    fn clamps_to_wire_format_cap_even_if_asked_for_more() {
        let frames = capture(10_000);
        assert!(frames.len() <= heapscope_proto::MAX_BACKTRACE_FRAMES);
    }
}
