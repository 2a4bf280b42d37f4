use heapscope_proto::log::LogLevel;
use heapscope_proto::{FixedBuf, MAX_RECORD_SIZE};
use std::cell::Cell;
use std::ffi::CString;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, Once, OnceLock};
use std::time::Instant;

use crate::config::Config;

/// Single owner of the trace file descriptor and the module-map dirty
/// flag. Every interposed entry point reaches this through
/// [`Tracker::global`].
pub struct Tracker {
    fd: AtomicI32,
    start: Instant,
    write_lock: Mutex<()>,
    dirty: Mutex<bool>,
    exec_path: OnceLock<String>,
    trace_path: OnceLock<String>,
    enabled: AtomicBool,
    init_once: Once,
}

static TRACKER: OnceLock<Tracker> = OnceLock::new();

thread_local! {
    /// Set while this thread is running `Tracker::finish_init`. Lets a
    /// nested call into `Tracker::global()` — a String/format! allocation
    /// inside `finish_init` routing through a *different* interposed
    /// entry point than the one that triggered it — recognize it's
    /// reentering and back off instead of calling `Once::call_once`
    /// reentrantly, which deadlocks or panics.
    static INITIALIZING: Cell<bool> = const { Cell::new(false) };
}

impl Tracker {
    /// Returns the process-wide Tracker. The slot itself is installed the
    /// first time any thread calls this, via a cheap, non-allocating
    /// placeholder (`Tracker::placeholder`) — so a nested call made while
    /// that placeholder's real setup (`finish_init`) is still running
    /// finds `TRACKER` already populated and never re-enters
    /// `OnceLock::get_or_init`'s closure.
    pub fn global() -> &'static Tracker {
        let tracker = TRACKER.get_or_init(Tracker::placeholder);
        tracker.ensure_initialized();
        tracker
    }

    fn placeholder() -> Tracker {
        Tracker {
            fd: AtomicI32::new(-1),
            start: Instant::now(),
            write_lock: Mutex::new(()),
            dirty: Mutex::new(true),
            exec_path: OnceLock::new(),
            trace_path: OnceLock::new(),
            enabled: AtomicBool::new(false),
            init_once: Once::new(),
        }
    }

    /// Runs `finish_init` exactly once per process. Reentrant calls from
    /// the same thread (a nested allocation during `finish_init` itself)
    /// see `INITIALIZING` already set and return immediately, leaving the
    /// tracker disabled until the outer call finishes — `append` and
    /// `refresh_module_map_if_dirty` both already no-op while disabled.
    fn ensure_initialized(&self) {
        if self.init_once.is_completed() {
            return;
        }
        if INITIALIZING.with(Cell::get) {
            return;
        }
        INITIALIZING.with(|c| c.set(true));
        self.init_once.call_once(|| self.finish_init());
        INITIALIZING.with(|c| c.set(false));
    }

    /// Resolves the executable path, opens the trace file, scrubs
    /// `LD_PRELOAD`, and registers the at-exit and at-fork hooks. Runs
    /// once; everything it does that allocates (`String`, `format!`,
    /// `CString`, `Config::get()`'s env lookups) is safe to run here
    /// because `self` is already reachable through `TRACKER` by the time
    /// this executes, so any nested `Tracker::global()` call it triggers
    /// just observes the still-disabled placeholder instead of
    /// recursing into this closure.
    fn finish_init(&self) {
        let exec_path = read_exec_path().unwrap_or_else(|| "unknown".to_string());
        let basename = Path::new(&exec_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        let pid = std::process::id();
        let trace_path = format!("{}/{basename}.{basename}.{pid}", Config::get().trace_dir);

        let fd = open_trace_file(&trace_path);
        if fd < 0 {
            heapscope_proto::log!(
                LogLevel::LogWarn,
                "could not open trace file '{trace_path}': {}",
                std::io::Error::last_os_error()
            );
        }

        let exec_path = self.exec_path.get_or_init(|| exec_path);
        let _ = self.trace_path.set(trace_path);
        self.fd.store(fd, Ordering::SeqCst);
        self.enabled.store(fd >= 0, Ordering::SeqCst);

        if fd >= 0 {
            self.append(|buf, ts| heapscope_proto::write_exec_path(buf, ts, exec_path));
        }

        // Clear the injection variable so a child the target execs isn't
        // also traced, unless it re-sets it explicitly.
        unsafe {
            libc::unsetenv(c"LD_PRELOAD".as_ptr());
        }

        register_atexit();
        register_atfork();
    }

    /// The format-and-append primitive: stamps a timestamp, formats the
    /// record into a fixed on-stack buffer via `build`, and writes it
    /// with a single syscall. Never touches the heap.
    pub(crate) fn append<F>(&self, build: F)
    where
        F: FnOnce(&mut FixedBuf<MAX_RECORD_SIZE>, u64) -> std::fmt::Result,
    {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let ts = self.start.elapsed().as_nanos() as u64;
        let mut buf = FixedBuf::<MAX_RECORD_SIZE>::new();
        if build(&mut buf, ts).is_err() {
            // Record didn't fit; drop it rather than write a truncated,
            // unparseable line.
            return;
        }
        self.write_bytes(buf.as_bytes());
    }

    fn write_bytes(&self, bytes: &[u8]) {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let fd = self.fd.load(Ordering::Relaxed);
        if fd < 0 {
            return;
        }
        let mut written = 0usize;
        while written < bytes.len() {
            let ret = unsafe {
                libc::write(
                    fd,
                    bytes[written..].as_ptr() as *const libc::c_void,
                    bytes.len() - written,
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                // Silent degradation: the target keeps running even if
                // the trace file write fails partway through.
                break;
            }
            written += ret as usize;
        }
    }

    /// Marks the module map dirty; set by the Interposer on successful
    /// `dlopen`/`dlclose`, and once at construction so the first refresh
    /// always runs.
    pub(crate) fn mark_dirty(&self) {
        if let Ok(mut dirty) = self.dirty.lock() {
            *dirty = true;
        }
    }

    /// Refreshes the module map if it's dirty, emitting a `u <` ... `u >`
    /// bracketed set of `m` records. A non-blocking try-lock: if another
    /// thread is already refreshing, this call is a no-op rather than a
    /// wait.
    ///
    /// Bails out before touching the dirty flag at all while the tracker
    /// isn't enabled yet: a reentrant call made from inside `finish_init`
    /// (see `ensure_initialized`) would otherwise clear `dirty` without
    /// ever being able to write anything, starving the real refresh that
    /// runs once `finish_init` actually finishes.
    pub(crate) fn refresh_module_map_if_dirty(&self) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut dirty = match self.dirty.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if !*dirty {
            return;
        }
        *dirty = false;

        self.append(|buf, ts| heapscope_proto::write_map_boundary(buf, ts, true));

        let exec_path = self.exec_path.get().map(String::as_str).unwrap_or("unknown");
        for_each_loaded_module(|base, name| {
            let path = if name.is_empty() { exec_path } else { name };
            if heapscope_proto::is_virtual_module(path) {
                return;
            }
            self.append(|buf, ts| heapscope_proto::write_module(buf, ts, base, path));
        });

        self.append(|buf, ts| heapscope_proto::write_map_boundary(buf, ts, false));
    }

    fn finalize(&self) {
        static FINALIZE_ONCE: Once = Once::new();
        FINALIZE_ONCE.call_once(|| {
            self.enabled.store(false, Ordering::SeqCst);
            let fd = self.fd.swap(-1, Ordering::SeqCst);
            if fd >= 0 {
                unsafe {
                    libc::close(fd);
                }
            }
            if let (Some(resolver), Some(trace_path)) =
                (&Config::get().resolver_path, self.trace_path.get())
            {
                // Development-build convenience: replay the trace we
                // just closed. Opt-in only; never runs unless
                // HEAPSCOPE_RESOLVER is set.
                let _ = std::process::Command::new(resolver).arg(trace_path).status();
            }
        });
    }

    fn disable_after_fork(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

fn open_trace_file(path: &str) -> libc::c_int {
    let Ok(c_path) = CString::new(path) else {
        return -1;
    };
    unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC,
            0o644,
        )
    }
}

fn read_exec_path() -> Option<String> {
    std::fs::read_link("/proc/self/exe")
        .ok()
        .and_then(|p| p.into_os_string().into_string().ok())
}

extern "C" fn atexit_handler() {
    Tracker::global().finalize();
}

extern "C" fn atfork_child_handler() {
    Tracker::global().disable_after_fork();
}

fn register_atexit() {
    unsafe {
        libc::atexit(atexit_handler);
    }
}

fn register_atfork() {
    unsafe {
        libc::pthread_atfork(None, None, Some(atfork_child_handler));
    }
}

/// Enumerates the loaded shared objects via `dl_iterate_phdr`, the
/// platform's iteration primitive for the process's module list.
fn for_each_loaded_module(mut f: impl FnMut(u64, &str)) {
    extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        unsafe {
            let info = &*info;
            let name = if info.dlpi_name.is_null() {
                ""
            } else {
                std::ffi::CStr::from_ptr(info.dlpi_name)
                    .to_str()
                    .unwrap_or("")
            };
            let callback = &mut *(data as *mut &mut dyn FnMut(u64, &str));
            callback(info.dlpi_addr as u64, name);
        }
        0
    }

    let mut trait_obj: &mut dyn FnMut(u64, &str) = &mut f;
    unsafe {
        libc::dl_iterate_phdr(
            Some(callback),
            &mut trait_obj as *mut &mut dyn FnMut(u64, &str) as *mut libc::c_void,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_at_least_the_main_executable() {
        let mut count = 0;
        for_each_loaded_module(|_base, _name| count += 1);
        assert!(count > 0);
    }

    #[test]
    fn reentrant_ensure_initialized_does_not_deadlock() {
        // Simulates a nested Tracker::global() call arriving on the same
        // thread while finish_init is conceptually still running: with
        // INITIALIZING already set, a second call must return instead of
        // touching init_once again.
        let tracker = Tracker::placeholder();
        INITIALIZING.with(|c| c.set(true));
        tracker.ensure_initialized();
        INITIALIZING.with(|c| c.set(false));
        assert!(!tracker.init_once.is_completed());
    }
}
