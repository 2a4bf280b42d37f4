use std::cell::Cell;
use std::thread::LocalKey;

thread_local! {
    pub(crate) static CALLOC_INSIDE: Cell<bool> = const { Cell::new(false) };
    pub(crate) static MALLOC_INSIDE: Cell<bool> = const { Cell::new(false) };
    pub(crate) static REALLOC_INSIDE: Cell<bool> = const { Cell::new(false) };
    pub(crate) static FREE_INSIDE: Cell<bool> = const { Cell::new(false) };
    pub(crate) static DLOPEN_INSIDE: Cell<bool> = const { Cell::new(false) };
    pub(crate) static DLCLOSE_INSIDE: Cell<bool> = const { Cell::new(false) };
}

/// Runs `emit` only if this entry point is not already being traced on
/// this thread. The real allocator call has already happened by the time
/// this is invoked (see each interposed function); this only guards the
/// tracing side-effect, so a tracer-internal allocation (the trace
/// writer, the unwinder, the symbolizer) is never itself retraced.
pub(crate) fn trace_if_outermost<F: FnOnce()>(flag: &'static LocalKey<Cell<bool>>, emit: F) {
    if flag.with(Cell::get) {
        return;
    }
    flag.with(|c| c.set(true));
    emit();
    flag.with(|c| c.set(false));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_calls_on_same_flag_do_not_reenter() {
        thread_local! {
            static FLAG: Cell<bool> = const { Cell::new(false) };
        }

        let mut outer_ran = false;
        let mut inner_ran = false;

        trace_if_outermost(&FLAG, || {
            outer_ran = true;
            trace_if_outermost(&FLAG, || {
                inner_ran = true;
            });
        });

        assert!(outer_ran);
        assert!(!inner_ran);
        // The flag must be clear again once the outer call returns.
        assert!(!FLAG.with(Cell::get));
    }

    #[test]
    fn sequential_calls_both_run() {
        thread_local! {
            static FLAG: Cell<bool> = const { Cell::new(false) };
        }

        let mut count = 0;
        trace_if_outermost(&FLAG, || count += 1);
        trace_if_outermost(&FLAG, || count += 1);
        assert_eq!(count, 2);
    }
}
