use std::fmt;

/// Errors surfaced on the resolver side only. The preload side never
/// constructs one of these: a malformed write is a bug in this crate, not
/// something the tracee should ever observe.
#[derive(Debug)]
pub enum TraceError {
    Open { path: String, source: std::io::Error },
    MissingArgument,
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Open { path, source } => {
                write!(f, "unable to open trace file '{path}': {source}")
            }
            TraceError::MissingArgument => write!(f, "missing required trace file path"),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TraceError::Open { source, .. } => Some(source),
            TraceError::MissingArgument => None,
        }
    }
}
