//! Replays a decoded trace event stream into a leak summary.
//!
//! Every allocation gets its own entry keyed by address; a matching free
//! marks it not-leaked. Whatever is still marked live once the trace is
//! exhausted gets printed as a leak. This mirrors `interpret.c`'s
//! single-pass instruction loop, minus its C memory-ownership bookkeeping.

use std::collections::HashMap;
use std::io::{self, Write};

use heapscope_proto::Event;
use serde::Serialize;

use crate::symbolizer::{ResolvedFrame, Symbolizer};

pub struct AllocEntry {
    pub addr: u64,
    pub size: u64,
    pub timestamp_ns: u64,
    pub frames: Vec<ResolvedFrame>,
    pub live: bool,
}

#[derive(Default, Clone, Copy)]
pub struct Stats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub net_bytes: i64,
}

/// Replays `heapscope_proto::Event`s and accumulates the allocation table
/// plus the running totals. One instance consumes exactly one trace file.
pub struct Resolver {
    symbolizer: Symbolizer,
    exec_path: String,
    stats: Stats,
    entries: Vec<AllocEntry>,
    live_index: HashMap<u64, usize>,
    current: Option<usize>,
    max_display_frames: usize,
}

impl Resolver {
    pub fn new(max_display_frames: usize) -> Self {
        Resolver {
            symbolizer: Symbolizer::new(),
            exec_path: "??".to_string(),
            stats: Stats::default(),
            entries: Vec::new(),
            live_index: HashMap::new(),
            current: None,
            max_display_frames,
        }
    }

    /// Feeds one newline-stripped trace line. Lines that don't parse are
    /// data errors, not fatal (spec'd ignore-and-continue policy).
    pub fn feed_line(&mut self, line: &str) {
        let Some((timestamp_ns, event)) = heapscope_proto::parse_line(line) else {
            return;
        };
        match event {
            Event::ExecPath(path) => self.exec_path = path.to_string(),
            Event::MapBegin => self.symbolizer.begin_module_set(),
            Event::Module { base, path } => {
                if !heapscope_proto::is_virtual_module(path) {
                    self.symbolizer.add_module(path, base);
                }
            }
            Event::MapEnd => self.symbolizer.end_module_set(),
            Event::Alloc { addr, size } => self.handle_alloc(timestamp_ns, addr, size),
            Event::Free { addr, .. } => self.handle_free(addr),
            Event::Backtrace { ip } => self.handle_backtrace(ip),
            Event::Unknown => {}
        }
    }

    fn handle_alloc(&mut self, timestamp_ns: u64, addr: u64, size: u64) {
        self.stats.alloc_count += 1;
        self.stats.net_bytes = self.stats.net_bytes.saturating_add(size as i64);

        let index = self.entries.len();
        self.entries.push(AllocEntry {
            addr,
            size,
            timestamp_ns,
            frames: Vec::new(),
            live: true,
        });
        // A second `a` for an address still marked live in the index
        // simply displaces it here: the old entry stays in `entries`,
        // still live, and is printed as its own leak unless something
        // frees its (no-longer-indexed) address directly.
        self.live_index.insert(addr, index);
        self.current = Some(index);
    }

    fn handle_free(&mut self, addr: u64) {
        self.stats.free_count += 1;
        let Some(&index) = self.live_index.get(&addr) else {
            // Freed something that was never seen as an `a` — can arise
            // from allocations that predate the tracer attaching.
            self.current = None;
            return;
        };
        if let Some(entry) = self.entries.get_mut(index) {
            if entry.live {
                entry.live = false;
                self.stats.net_bytes = self.stats.net_bytes.saturating_sub(entry.size as i64);
            }
        }
        self.current = Some(index);
    }

    fn handle_backtrace(&mut self, ip: u64) {
        let Some(index) = self.current else { return };
        let frame = self.symbolizer.resolve(ip);
        if let Some(entry) = self.entries.get_mut(index) {
            if entry.frames.len() < self.max_display_frames {
                entry.frames.push(frame);
            }
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn leaks(&self) -> impl Iterator<Item = &AllocEntry> {
        self.entries.iter().filter(|entry| entry.live)
    }

    /// Renders the human-readable report: a header naming the traced
    /// executable, a one-line summary, then one block per leak in the
    /// order its `a` record appeared in the trace.
    pub fn print_summary(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "heapscope leak summary")?;
        writeln!(out, "> {}", self.exec_path)?;
        writeln!(out)?;
        writeln!(
            out,
            "{} allocs, {} frees, {} bytes unaccounted for",
            self.stats.alloc_count, self.stats.free_count, self.stats.net_bytes
        )?;

        let leaks: Vec<&AllocEntry> = self.leaks().collect();
        if leaks.is_empty() {
            writeln!(out, "no leaks detected")?;
            return Ok(());
        }

        writeln!(out)?;
        for (number, entry) in leaks.iter().enumerate() {
            writeln!(
                out,
                "leak #{} -- {} bytes at 0x{:x} (t={} ns)",
                number + 1,
                entry.size,
                entry.addr,
                entry.timestamp_ns
            )?;
            for frame in &entry.frames {
                writeln!(
                    out,
                    "    0x{:016x} {} ({}:{}:{}) [{} +0x{:x}]",
                    frame.instruction_address,
                    frame.symbol_name,
                    frame.source_file,
                    frame.line,
                    frame.column,
                    frame.module_name,
                    frame.instruction_address.saturating_sub(frame.module_base)
                )?;
            }
        }
        Ok(())
    }

    pub fn to_json_summary(&self) -> JsonSummary {
        JsonSummary {
            exec_path: self.exec_path.clone(),
            alloc_count: self.stats.alloc_count,
            free_count: self.stats.free_count,
            net_bytes: self.stats.net_bytes,
            leaks: self
                .leaks()
                .map(|entry| JsonLeak {
                    address: format!("0x{:x}", entry.addr),
                    size: entry.size,
                    timestamp_ns: entry.timestamp_ns,
                    frames: entry
                        .frames
                        .iter()
                        .map(|frame| JsonFrame {
                            instruction_address: format!("0x{:x}", frame.instruction_address),
                            module: frame.module_name.clone(),
                            module_base: format!("0x{:x}", frame.module_base),
                            symbol: frame.symbol_name.clone(),
                            source_file: frame.source_file.clone(),
                            line: frame.line,
                            column: frame.column,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
pub struct JsonSummary {
    pub exec_path: String,
    pub alloc_count: u64,
    pub free_count: u64,
    pub net_bytes: i64,
    pub leaks: Vec<JsonLeak>,
}

#[derive(Serialize)]
pub struct JsonLeak {
    pub address: String,
    pub size: u64,
    pub timestamp_ns: u64,
    pub frames: Vec<JsonFrame>,
}

#[derive(Serialize)]
pub struct JsonFrame {
    pub instruction_address: String,
    pub module: String,
    pub module_base: String,
    pub symbol: String,
    pub source_file: String,
    pub line: u32,
    pub column: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matched_alloc_and_free_leave_no_leak() {
        let mut resolver = Resolver::new(32);
        resolver.feed_line("1 a 0x1000 64");
        resolver.feed_line("2 f 0x1000 0");
        assert_eq!(resolver.leaks().count(), 0);
        assert_eq!(resolver.stats().net_bytes, 0);
    }

    #[test]
    fn unmatched_alloc_is_a_leak() {
        let mut resolver = Resolver::new(32);
        resolver.feed_line("1 a 0x2000 128");
        let leaks: Vec<_> = resolver.leaks().collect();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].addr, 0x2000);
        assert_eq!(leaks[0].size, 128);
        assert_eq!(resolver.stats().net_bytes, 128);
    }

    #[test]
    fn free_of_unknown_address_is_ignored_but_counted() {
        let mut resolver = Resolver::new(32);
        resolver.feed_line("1 f 0xdead 0");
        assert_eq!(resolver.stats().free_count, 1);
        assert_eq!(resolver.stats().alloc_count, 0);
        assert_eq!(resolver.leaks().count(), 0);
    }

    #[test]
    fn repeated_alloc_on_same_address_leaks_the_superseded_entry() {
        let mut resolver = Resolver::new(32);
        resolver.feed_line("1 a 0x3000 16");
        resolver.feed_line("2 a 0x3000 32");
        // Only the second entry is reachable by a future free; the first
        // stays live and is reported as its own leak.
        resolver.feed_line("3 f 0x3000 0");
        let leaks: Vec<_> = resolver.leaks().collect();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].size, 16);
    }

    #[test]
    fn realloc_style_reuse_of_the_same_address_nets_to_zero() {
        // realloc growing in place reports two `a` records at the same
        // address; the matching policy naturally collapses them.
        let mut resolver = Resolver::new(32);
        resolver.feed_line("1 a 0x4000 16");
        resolver.feed_line("2 a 0x4000 128");
        resolver.feed_line("3 f 0x4000 0");
        assert_eq!(resolver.leaks().count(), 0);
    }

    #[test]
    fn backtrace_records_attach_to_the_most_recent_alloc_or_free() {
        let mut resolver = Resolver::new(32);
        resolver.feed_line("1 a 0x5000 8");
        resolver.feed_line("1 b 0x401000");
        resolver.feed_line("1 b 0x402000");
        let leaks: Vec<_> = resolver.leaks().collect();
        assert_eq!(leaks[0].frames.len(), 2);
    }

    #[test]
    fn backtrace_frame_count_is_capped_at_display_limit() {
        let mut resolver = Resolver::new(1);
        resolver.feed_line("1 a 0x6000 8");
        resolver.feed_line("1 b 0x401000");
        resolver.feed_line("1 b 0x402000");
        let leaks: Vec<_> = resolver.leaks().collect();
        assert_eq!(leaks[0].frames.len(), 1);
    }

    #[test]
    fn malformed_lines_are_skipped_without_affecting_counts() {
        let mut resolver = Resolver::new(32);
        resolver.feed_line("not a trace line");
        resolver.feed_line("1 a 0xbad");
        resolver.feed_line("1 a 0x7000 8");
        assert_eq!(resolver.stats().alloc_count, 1);
    }
}
