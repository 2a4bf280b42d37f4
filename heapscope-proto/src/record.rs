use core::fmt::{self, Write};

pub const OP_EXEC_PATH: char = 'x';
pub const OP_MODULE: char = 'm';
pub const OP_MAP_BOUNDARY: char = 'u';
pub const OP_ALLOC: char = 'a';
pub const OP_FREE: char = 'f';
pub const OP_BACKTRACE: char = 'b';

const MAP_BEGIN: char = '<';
const MAP_END: char = '>';

pub fn write_exec_path<W: Write>(w: &mut W, timestamp_ns: u64, path: &str) -> fmt::Result {
    write!(w, "{timestamp_ns} {OP_EXEC_PATH} {path}\n")
}

pub fn write_module<W: Write>(w: &mut W, timestamp_ns: u64, base: u64, path: &str) -> fmt::Result {
    write!(w, "{timestamp_ns} {OP_MODULE} 0x{base:x} {path}\n")
}

pub fn write_map_boundary<W: Write>(w: &mut W, timestamp_ns: u64, begin: bool) -> fmt::Result {
    let marker = if begin { MAP_BEGIN } else { MAP_END };
    write!(w, "{timestamp_ns} {OP_MAP_BOUNDARY} {marker}\n")
}

pub fn write_alloc<W: Write>(w: &mut W, timestamp_ns: u64, addr: u64, size: u64) -> fmt::Result {
    write!(w, "{timestamp_ns} {OP_ALLOC} 0x{addr:x} {size}\n")
}

pub fn write_free<W: Write>(w: &mut W, timestamp_ns: u64, addr: u64, size: u64) -> fmt::Result {
    write!(w, "{timestamp_ns} {OP_FREE} 0x{addr:x} {size}\n")
}

pub fn write_backtrace<W: Write>(w: &mut W, timestamp_ns: u64, ip: u64) -> fmt::Result {
    write!(w, "{timestamp_ns} {OP_BACKTRACE} 0x{ip:x}\n")
}

/// A decoded trace record, borrowing its string fields from the line it
/// was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<'a> {
    ExecPath(&'a str),
    Module { base: u64, path: &'a str },
    MapBegin,
    MapEnd,
    Alloc { addr: u64, size: u64 },
    Free { addr: u64, size: u64 },
    Backtrace { ip: u64 },
    /// An opcode outside the closed set, or a record missing its
    /// required fields. Resolver data errors (spec §7): the caller
    /// ignores these.
    Unknown,
}

fn parse_hex_addr(s: &str) -> Option<u64> {
    u64::from_str_radix(s.strip_prefix("0x")?, 16).ok()
}

/// Parse one newline-stripped trace line into `(timestamp_ns, Event)`.
///
/// Returns `None` only when the line has no parseable timestamp at all
/// (an empty line, or outright garbage); every other malformed case
/// degrades to `Event::Unknown` so the resolver can count it and move on,
/// per spec §7's "resolver data errors are ignored, not fatal" rule.
pub fn parse_line(line: &str) -> Option<(u64, Event<'_>)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let space = memchr::memchr(b' ', line.as_bytes())?;
    let (ts_str, rest) = line.split_at(space);
    let timestamp_ns: u64 = ts_str.parse().ok()?;
    let rest = rest.trim_start_matches(' ');

    let mut fields = rest.splitn(2, ' ');
    let opcode = fields.next()?;
    let args = fields.next().unwrap_or("");

    let event = match opcode.chars().next() {
        Some(c) if c == OP_EXEC_PATH => Event::ExecPath(args),
        Some(c) if c == OP_MODULE => {
            let mut it = args.splitn(2, ' ');
            match (it.next().and_then(parse_hex_addr), it.next()) {
                (Some(base), Some(path)) => Event::Module { base, path },
                _ => Event::Unknown,
            }
        }
        Some(c) if c == OP_MAP_BOUNDARY => match args {
            "<" => Event::MapBegin,
            ">" => Event::MapEnd,
            _ => Event::Unknown,
        },
        Some(c) if c == OP_ALLOC || c == OP_FREE => {
            let mut it = args.splitn(2, ' ');
            let addr = it.next().and_then(parse_hex_addr);
            let size = it.next().and_then(|s| s.parse().ok());
            match (addr, size) {
                (Some(addr), Some(size)) if c == OP_ALLOC => Event::Alloc { addr, size },
                (Some(addr), Some(size)) => Event::Free { addr, size },
                _ => Event::Unknown,
            }
        }
        Some(c) if c == OP_BACKTRACE => match parse_hex_addr(args) {
            Some(ip) => Event::Backtrace { ip },
            None => Event::Unknown,
        },
        _ => Event::Unknown,
    };

    Some((timestamp_ns, event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_alloc() {
        let mut buf = crate::FixedBuf::<128>::new();
        write_alloc(&mut buf, 42, 0xdead_beef, 64).unwrap();
        let line = core::str::from_utf8(buf.as_bytes()).unwrap();
        let (ts, event) = parse_line(line).unwrap();
        assert_eq!(ts, 42);
        assert_eq!(
            event,
            Event::Alloc {
                addr: 0xdead_beef,
                size: 64
            }
        );
    }

    #[test]
    fn round_trips_free_with_zero_size() {
        let mut buf = crate::FixedBuf::<128>::new();
        write_free(&mut buf, 7, 0x1000, 0).unwrap();
        let line = core::str::from_utf8(buf.as_bytes()).unwrap();
        let (_, event) = parse_line(line).unwrap();
        assert_eq!(
            event,
            Event::Free {
                addr: 0x1000,
                size: 0
            }
        );
    }

    #[test]
    fn round_trips_module_and_boundaries() {
        let mut buf = crate::FixedBuf::<256>::new();
        write_map_boundary(&mut buf, 1, true).unwrap();
        write_module(&mut buf, 2, 0x5555_0000, "/usr/lib/libfoo.so").unwrap();
        write_map_boundary(&mut buf, 3, false).unwrap();
        let text = core::str::from_utf8(buf.as_bytes()).unwrap();
        let mut lines = text.lines();
        assert_eq!(parse_line(lines.next().unwrap()).unwrap().1, Event::MapBegin);
        assert_eq!(
            parse_line(lines.next().unwrap()).unwrap().1,
            Event::Module {
                base: 0x5555_0000,
                path: "/usr/lib/libfoo.so"
            }
        );
        assert_eq!(parse_line(lines.next().unwrap()).unwrap().1, Event::MapEnd);
    }

    #[test]
    fn unknown_opcode_is_ignored_not_fatal() {
        let (_, event) = parse_line("5 z something").unwrap();
        assert_eq!(event, Event::Unknown);
    }

    #[test]
    fn malformed_alloc_missing_size_is_unknown() {
        let (_, event) = parse_line("5 a 0xdead").unwrap();
        assert_eq!(event, Event::Unknown);
    }

    #[test]
    fn empty_line_has_no_timestamp() {
        assert!(parse_line("").is_none());
    }
}
