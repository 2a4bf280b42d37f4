//! Offline trace replay: reads the file `heapscope-preload` wrote and
//! prints a leak summary (text by default, `--json` for a machine-readable
//! one).

mod resolver;
mod symbolizer;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use heapscope_proto::log::LogLevel;
use structopt::StructOpt;

use resolver::Resolver;

#[derive(StructOpt)]
#[structopt(
    name = "heapscope-resolve",
    about = "Replay a heapscope trace file and print a leak summary"
)]
struct Options {
    /// Path to the trace file written by heapscope-preload.
    trace_path: PathBuf,

    /// Emit a machine-readable JSON summary instead of the text report.
    #[structopt(long)]
    json: bool,

    /// Cap the number of backtrace frames shown per leak. Purely a
    /// display limit; the trace itself is already capped at
    /// `heapscope_proto::MAX_BACKTRACE_FRAMES`.
    #[structopt(long, default_value = "32")]
    max_frames: usize,
}

fn main() -> ExitCode {
    let options = match Options::from_args_safe() {
        Ok(options) => options,
        Err(_) => {
            heapscope_proto::log!(LogLevel::LogError, "{}", heapscope_proto::TraceError::MissingArgument);
            return ExitCode::FAILURE;
        }
    };

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            heapscope_proto::log!(LogLevel::LogError, "{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: &Options) -> Result<(), heapscope_proto::TraceError> {
    let file =
        std::fs::File::open(&options.trace_path).map_err(|source| heapscope_proto::TraceError::Open {
            path: options.trace_path.display().to_string(),
            source,
        })?;

    let max_frames = options.max_frames.min(heapscope_proto::MAX_BACKTRACE_FRAMES);
    let mut resolver = Resolver::new(max_frames);
    for line in io::BufReader::new(file).lines().map_while(Result::ok) {
        resolver.feed_line(&line);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if options.json {
        let summary = resolver.to_json_summary();
        let _ = serde_json::to_writer_pretty(&mut out, &summary);
        let _ = writeln!(out);
    } else {
        let _ = resolver.print_summary(&mut out);
    }
    Ok(())
}
