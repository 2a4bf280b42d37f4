//! The wire format shared between the in-process tracer
//! (`heapscope-preload`) and the offline resolver (`heapscope-resolve`).
//!
//! Nothing in here is allowed to allocate on the hot write path: the
//! tracer calls into this crate from inside an interposed `malloc`, so
//! [`FixedBuf`] and the `write_*` helpers only ever touch a caller-owned
//! stack buffer.

mod buf;
mod error;
pub mod log;
mod record;

pub use buf::FixedBuf;
pub use error::TraceError;
pub use record::{
    parse_line, write_alloc, write_backtrace, write_exec_path, write_free, write_map_boundary,
    write_module, Event, OP_ALLOC, OP_BACKTRACE, OP_EXEC_PATH, OP_FREE, OP_MAP_BOUNDARY,
    OP_MODULE,
};

/// Hard cap on backtrace depth, both on the write side (the unwinder
/// adapter never captures more) and the read side (display only).
pub const MAX_BACKTRACE_FRAMES: usize = 32;

/// Upper bound on a single formatted trace record, including its
/// timestamp prefix and trailing newline.
pub const MAX_RECORD_SIZE: usize = 8192;

/// True for the kernel's virtual DSOs, which never get an `m` record:
/// they have no backing file and carry no useful debug info.
pub fn is_virtual_module(name: &str) -> bool {
    name.starts_with("linux-vdso.so")
        || matches!(name, "[vdso]" | "[vsyscall]" | "[vvar]" | "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_known_virtual_dsos() {
        assert!(is_virtual_module("linux-vdso.so.1"));
        assert!(is_virtual_module("[vdso]"));
        assert!(is_virtual_module("[vsyscall]"));
    }

    #[test]
    fn keeps_real_modules() {
        assert!(!is_virtual_module("/usr/lib/libc.so.6"));
        assert!(!is_virtual_module("/bin/myprogram"));
    }
}
