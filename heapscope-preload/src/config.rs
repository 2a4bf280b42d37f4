use lazy_static::lazy_static;

lazy_static! {
    static ref CONFIG: Config = init_config();
}

/// Runtime knobs for the tracer, read once from the environment: a single
/// `lazy_static` struct with a `get()` accessor, rather than threading
/// configuration through every call site.
#[derive(Clone)]
pub struct Config {
    /// Directory the trace file is created in. Original hardcodes `/tmp`;
    /// `HEAPSCOPE_TRACE_DIR` overrides it.
    pub trace_dir: String,
    /// Backtrace depth cap, clamped to the wire format's hard limit.
    pub max_frames: usize,
    /// Path to the resolver binary, run automatically against the trace
    /// once it's closed, when set. Opt-in via environment variable so a
    /// release build has no surprise child-process behavior.
    pub resolver_path: Option<String>,
}

impl Config {
    pub fn get() -> &'static Config {
        &CONFIG
    }
}

fn init_config() -> Config {
    let trace_dir = std::env::var("HEAPSCOPE_TRACE_DIR").unwrap_or_else(|_| "/tmp".to_string());

    let max_frames = std::env::var("HEAPSCOPE_MAX_FRAMES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .map(|n| n.min(heapscope_proto::MAX_BACKTRACE_FRAMES))
        .unwrap_or(heapscope_proto::MAX_BACKTRACE_FRAMES);

    let resolver_path = std::env::var("HEAPSCOPE_RESOLVER").ok();

    Config {
        trace_dir,
        max_frames,
        resolver_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_frames_never_exceeds_wire_cap() {
        // Config::get() reads whatever the test process's environment
        // happens to be, so only assert the invariant, not a fixed value.
        assert!(Config::get().max_frames <= heapscope_proto::MAX_BACKTRACE_FRAMES);
    }
}
