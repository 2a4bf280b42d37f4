//! Resolves runtime addresses against the module map reconstructed by
//! the [`crate::resolver::Resolver`]. Realizes the "debug-info reader"
//! abstraction with `goblin` (ELF headers, symbol table) and `gimli`
//! (`.debug_line` line-number programs) — the same pair `backtrace`'s own
//! gimli-based symbolizer backend uses.

use std::rc::Rc;

use gimli::{EndianRcSlice, LittleEndian, Reader};
use goblin::elf::Elf;

type GimliReader = EndianRcSlice<LittleEndian>;

/// A single resolved backtrace frame. Any field that can't be determined
/// is the sentinel `"??"` (or `0` for the numeric fields), per the
/// Symbolizer adapter's contract.
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub instruction_address: u64,
    pub module_name: String,
    pub module_base: u64,
    pub symbol_name: String,
    pub source_file: String,
    pub line: u32,
    pub column: u32,
}

impl ResolvedFrame {
    fn unknown(ip: u64) -> Self {
        ResolvedFrame {
            instruction_address: ip,
            module_name: "??".to_string(),
            module_base: 0,
            symbol_name: "??".to_string(),
            source_file: "??".to_string(),
            line: 0,
            column: 0,
        }
    }
}

struct LoadedModule {
    path: String,
    base: u64,
    span: u64,
    symbols: Vec<(u64, u64, String)>,
    dwarf: Option<gimli::Dwarf<GimliReader>>,
}

impl LoadedModule {
    fn load(path: &str, base: u64) -> LoadedModule {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => return LoadedModule::placeholder(path, base),
        };
        let elf = match Elf::parse(&bytes) {
            Ok(elf) => elf,
            Err(_) => return LoadedModule::placeholder(path, base),
        };

        let span = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == goblin::elf::program_header::PT_LOAD)
            .map(|ph| ph.p_vaddr + ph.p_memsz)
            .max()
            .unwrap_or(0);

        let symbols = build_symbol_table(&elf);
        let dwarf = load_dwarf(&bytes, &elf);

        LoadedModule {
            path: path.to_string(),
            base,
            span,
            symbols,
            dwarf,
        }
    }

    fn placeholder(path: &str, base: u64) -> LoadedModule {
        LoadedModule {
            path: path.to_string(),
            base,
            span: u64::MAX - base,
            symbols: Vec::new(),
            dwarf: None,
        }
    }

    fn contains(&self, ip: u64) -> bool {
        ip >= self.base && ip.saturating_sub(self.base) < self.span.max(1)
    }

    fn resolve(&self, ip: u64) -> ResolvedFrame {
        let offset = ip.saturating_sub(self.base);
        let symbol_name = self
            .find_symbol(offset)
            .unwrap_or_else(|| "??".to_string());
        let (source_file, line, column) = self
            .dwarf
            .as_ref()
            .and_then(|dwarf| resolve_line(dwarf, offset))
            .unwrap_or_else(|| ("??".to_string(), 0, 0));

        ResolvedFrame {
            instruction_address: ip,
            module_name: self.path.clone(),
            module_base: self.base,
            symbol_name,
            source_file,
            line,
            column,
        }
    }

    fn find_symbol(&self, offset: u64) -> Option<String> {
        match self.symbols.binary_search_by_key(&offset, |&(addr, _, _)| addr) {
            Ok(idx) => Some(self.symbols[idx].2.clone()),
            Err(0) => None,
            Err(idx) => {
                let (addr, size, name) = &self.symbols[idx - 1];
                if *size == 0 || offset < addr + size {
                    Some(name.clone())
                } else {
                    None
                }
            }
        }
    }
}

fn build_symbol_table(elf: &Elf) -> Vec<(u64, u64, String)> {
    let mut symbols = Vec::new();
    for sym in elf.syms.iter().chain(elf.dynsyms.iter()) {
        if sym.st_value == 0 {
            continue;
        }
        if goblin::elf::sym::st_type(sym.st_info) != goblin::elf::sym::STT_FUNC {
            continue;
        }
        let name = elf
            .strtab
            .get_at(sym.st_name)
            .or_else(|| elf.dynstrtab.get_at(sym.st_name))
            .unwrap_or("??");
        symbols.push((sym.st_value, sym.st_size, name.to_string()));
    }
    symbols.sort_by_key(|&(addr, _, _)| addr);
    symbols
}

fn load_dwarf(bytes: &[u8], elf: &Elf) -> Option<gimli::Dwarf<GimliReader>> {
    let load_section = |id: gimli::SectionId| -> Result<GimliReader, gimli::Error> {
        let data: Rc<[u8]> = elf
            .section_headers
            .iter()
            .find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(id.name()))
            .and_then(|sh| {
                let start = sh.sh_offset as usize;
                let end = start.checked_add(sh.sh_size as usize)?;
                bytes.get(start..end)
            })
            .map(Rc::from)
            .unwrap_or_else(|| Rc::from(&b""[..]));
        Ok(EndianRcSlice::new(data, LittleEndian))
    };

    gimli::Dwarf::load(load_section).ok()
}

fn resolve_line(dwarf: &gimli::Dwarf<GimliReader>, offset: u64) -> Option<(String, u32, u32)> {
    let mut units = dwarf.units();
    while let Ok(Some(header)) = units.next() {
        let Ok(unit) = dwarf.unit(header) else {
            continue;
        };
        if let Some(result) = resolve_line_in_unit(dwarf, &unit, offset) {
            return Some(result);
        }
    }
    None
}

fn resolve_line_in_unit(
    dwarf: &gimli::Dwarf<GimliReader>,
    unit: &gimli::Unit<GimliReader>,
    offset: u64,
) -> Option<(String, u32, u32)> {
    let program = unit.line_program.clone()?;
    let mut rows = program.rows();
    let mut best: Option<(u64, String, u32, u32)> = None;

    while let Ok(Some((header, row))) = rows.next_row() {
        if row.end_sequence() || row.address() > offset {
            continue;
        }
        if best.as_ref().is_some_and(|(addr, ..)| row.address() < *addr) {
            continue;
        }

        let file_name = row
            .file(header)
            .and_then(|file| dwarf.attr_string(unit, file.path_name()).ok())
            .and_then(|s| s.to_string_lossy().ok().map(|s| s.into_owned()))
            .unwrap_or_else(|| "??".to_string());
        let line = row.line().map(|l| l.get() as u32).unwrap_or(0);
        let column = match row.column() {
            gimli::ColumnType::LeftEdge => 0,
            gimli::ColumnType::Column(c) => c.get() as u32,
        };

        best = Some((row.address(), file_name, line, column));
    }

    best.map(|(_, file, line, column)| (file, line, column))
}

/// Accumulates the module map between a `u <` ... `u >` pair and answers
/// address resolutions against whatever set was last committed with
/// [`Symbolizer::end_module_set`].
pub struct Symbolizer {
    committed: Vec<LoadedModule>,
    pending: Vec<LoadedModule>,
}

impl Symbolizer {
    pub fn new() -> Self {
        Symbolizer {
            committed: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn begin_module_set(&mut self) {
        self.pending.clear();
    }

    pub fn add_module(&mut self, path: &str, base: u64) {
        self.pending.push(LoadedModule::load(path, base));
    }

    pub fn end_module_set(&mut self) {
        self.committed = std::mem::take(&mut self.pending);
    }

    pub fn resolve(&self, ip: u64) -> ResolvedFrame {
        match self.committed.iter().find(|m| m.contains(ip)) {
            Some(module) => module.resolve(ip),
            None => ResolvedFrame::unknown(ip),
        }
    }
}

impl Default for Symbolizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolving_before_any_module_set_returns_sentinels() {
        let symbolizer = Symbolizer::new();
        let frame = symbolizer.resolve(0x1234);
        assert_eq!(frame.module_name, "??");
        assert_eq!(frame.symbol_name, "??");
        assert_eq!(frame.line, 0);
        assert_eq!(frame.column, 0);
    }

    #[test]
    fn pending_modules_are_invisible_until_committed() {
        let mut symbolizer = Symbolizer::new();
        symbolizer.begin_module_set();
        symbolizer.add_module("/nonexistent/does-not-matter.so", 0x1000);
        // not yet end_module_set()'d
        let frame = symbolizer.resolve(0x1000);
        assert_eq!(frame.module_name, "??");
    }

    #[test]
    fn unreadable_module_file_degrades_to_placeholder_not_panic() {
        let mut symbolizer = Symbolizer::new();
        symbolizer.begin_module_set();
        symbolizer.add_module("/definitely/not/a/real/path.so", 0x4000);
        symbolizer.end_module_set();
        let frame = symbolizer.resolve(0x4010);
        assert_eq!(frame.module_name, "/definitely/not/a/real/path.so");
        assert_eq!(frame.module_base, 0x4000);
        assert_eq!(frame.symbol_name, "??");
    }
}
