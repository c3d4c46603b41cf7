use std::fs::File;
use std::io::{BufWriter, Write};

use indexmap::IndexMap;

use crate::area::{AreaAttributes, AreaId, AreaStore};
use crate::error::{Diagnostics, LinkError};
use crate::library::LibraryStore;
use crate::link::StringTables;
use crate::module::ModuleStore;
use crate::symbol::{SymbolId, SymbolTable};

/// At most this many map files may be open simultaneously.
pub const MAX_MAP_FILE_COUNT: usize = 10;

/// Read-only view of the frozen link graph handed to map encoders.
pub struct MapView<'a> {
    pub areas: &'a AreaStore,
    pub modules: &'a ModuleStore,
    pub symbols: &'a SymbolTable,
    pub libraries: &'a LibraryStore,
    pub tables: &'a StringTables,
    pub link_files: &'a [String],
    /// Radix for number output (16, 10 or 8).
    pub base: u32,
}

/// A textual map format fed by the map-file fan-out.
pub trait MapEncoder {
    /// Receives `;`-comment lines seen during pass 1.
    fn write_comment(&mut self, _out: &mut dyn Write, _comment: &str) -> Result<(), LinkError> {
        Ok(())
    }

    fn generate(&mut self, out: &mut dyn Write, view: &MapView<'_>) -> Result<(), LinkError>;
}

struct MapStream {
    suffix: String,
    out: Option<Box<dyn Write>>,
    encoder: Box<dyn MapEncoder>,
}

/// Registry of requested map outputs.
#[derive(Default)]
pub struct MapFileTable {
    entries: Vec<MapStream>,
    is_open: bool,
}

impl MapFileTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a map format under a file-name suffix; the file is opened
    /// by [`MapFileTable::open_all`]. Duplicate suffixes are ignored with
    /// a warning.
    pub fn register(
        &mut self,
        suffix: &str,
        encoder: Box<dyn MapEncoder>,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        self.register_stream(suffix, None, encoder, diag)
    }

    /// Registers a map format over an already open sink (used by tests and
    /// by callers writing somewhere other than `stem + suffix`).
    pub fn register_with_sink(
        &mut self,
        suffix: &str,
        out: Box<dyn Write>,
        encoder: Box<dyn MapEncoder>,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        self.register_stream(suffix, Some(out), encoder, diag)
    }

    fn register_stream(
        &mut self,
        suffix: &str,
        out: Option<Box<dyn Write>>,
        encoder: Box<dyn MapEncoder>,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        if self.entries.len() >= MAX_MAP_FILE_COUNT {
            return Err(LinkError::TooManyMapFiles);
        }
        if self.entries.iter().any(|entry| entry.suffix == suffix) {
            diag.warning(&format!("ignored duplicate map file request for {suffix}"));
            return Ok(());
        }
        self.entries.push(MapStream {
            suffix: suffix.to_string(),
            out,
            encoder,
        });
        Ok(())
    }

    /// Opens `stem + suffix` for every registered format without a sink.
    pub fn open_all(&mut self, stem: &str) -> Result<(), LinkError> {
        for entry in &mut self.entries {
            if entry.out.is_none() {
                let path = format!("{stem}{}", entry.suffix);
                let file = File::create(&path).map_err(|source| LinkError::FileOpen {
                    path: path.clone(),
                    source,
                })?;
                entry.out = Some(Box::new(BufWriter::new(file)));
            }
        }
        self.is_open = true;
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Forwards a source comment line to every open map format.
    pub fn write_special_comment(&mut self, comment: &str) {
        for entry in &mut self.entries {
            if let Some(out) = entry.out.as_mut() {
                let _ = entry.encoder.write_comment(out, comment);
            }
        }
    }

    /// Mirrors a relocation diagnostic into every open map file.
    pub fn write_error_message(&mut self, message: &str) {
        for entry in &mut self.entries {
            if let Some(out) = entry.out.as_mut() {
                let _ = write!(out, "\n?ASlink-Warning-{message}");
            }
        }
    }

    /// Emits the post-layout linking data through every registered format.
    pub fn write_linking_data(&mut self, view: &MapView<'_>) -> Result<(), LinkError> {
        for entry in &mut self.entries {
            if let Some(out) = entry.out.as_mut() {
                entry.encoder.generate(out, view)?;
            }
        }
        Ok(())
    }

    pub fn close_all(&mut self) -> Result<(), LinkError> {
        for entry in &mut self.entries {
            if let Some(mut out) = entry.out.take() {
                out.flush()?;
            }
        }
        self.entries.clear();
        self.is_open = false;
        Ok(())
    }
}

/// All symbols of an area, sorted ascending by absolute address with a
/// stable tie-break preserving insertion order. Defined symbols without a
/// segment (the `s_`/`l_` auto-symbols, `-g` overrides) are already
/// absolute and report under the `.ABS.` area.
#[must_use]
pub fn sorted_area_symbols(
    areas: &AreaStore,
    symbols: &SymbolTable,
    area: AreaId,
) -> Vec<SymbolId> {
    let mut collected: Vec<SymbolId> = areas
        .area(area)
        .segments
        .iter()
        .flat_map(|&segment| areas.segment(segment).symbols.iter().copied())
        .collect();
    if area == areas.absolute_area() {
        collected.extend(symbols.ids().filter(|&id| {
            let symbol = symbols.get(id);
            symbol.segment.is_none() && symbol.is_defined()
        }));
    }
    collected.sort_by_key(|&id| symbols.absolute_address(id, areas));
    collected
}

/// Renders `value` in `base` (8, 10 or 16, upper-case digits).
#[must_use]
pub fn number_in_base(value: u32, base: u32) -> String {
    match base {
        8 => format!("{value:o}"),
        10 => format!("{value}"),
        _ => format!("{value:X}"),
    }
}

fn aligned(text: &str, width: usize, pad: char, left_justified: bool) -> String {
    if text.len() >= width {
        return text.to_string();
    }
    let padding: String = std::iter::repeat_n(pad, width - text.len()).collect();
    if left_justified {
        format!("{text}{padding}")
    } else {
        format!("{padding}{text}")
    }
}

fn write_header_lines(
    out: &mut dyn Write,
    line_prefix: &str,
    separator: &str,
    headings: &[&str],
    widths: &[usize],
) -> Result<(), LinkError> {
    writeln!(out)?;
    for pass in 0..2 {
        write!(out, "{line_prefix}")?;
        for (index, heading) in headings.iter().enumerate() {
            let last = index == headings.len() - 1;
            let column = if pass == 0 {
                if last {
                    (*heading).to_string()
                } else {
                    aligned(heading, widths[index], ' ', true)
                }
            } else {
                aligned("", widths[index], '-', true)
            };
            write!(out, "{column}")?;
            write!(out, "{}", if last { "\n" } else { separator })?;
        }
    }
    Ok(())
}

/// The standard `.map` format: per-area blocks with sorted symbols, the
/// files linked, libraries, user overrides and the undefined-symbol
/// cross-reference.
#[derive(Debug, Default)]
pub struct StandardMapEncoder;

impl StandardMapEncoder {
    fn write_area(
        out: &mut dyn Write,
        view: &MapView<'_>,
        area_id: AreaId,
    ) -> Result<(), LinkError> {
        const HEADER_WIDTHS: [usize; 5] = [35, 6, 6, 14, 15];
        const SYMBOL_WIDTHS: [usize; 2] = [8, 50];
        const MEMORY_PAGE_WIDTH: usize = 3;

        let area = view.areas.area(area_id);
        write_header_lines(
            out,
            "",
            " ",
            &["Area", "Addr", "Size", "Decimal Bytes", "(Attributes)"],
            &HEADER_WIDTHS,
        )?;

        let is_paged = area.attributes.contains(AreaAttributes::PAGED);
        let mut attributes = String::from(
            if area.attributes.contains(AreaAttributes::ABSOLUTE) {
                "(ABS"
            } else {
                "(REL"
            },
        );
        attributes.push_str(if area.attributes.contains(AreaAttributes::OVERLAYED) {
            ",OVR"
        } else {
            ",CON"
        });
        if is_paged {
            attributes.push_str(",PAG");
        }
        attributes.push(')');
        if is_paged {
            let address_is_bad = area.start_address & 0xFF != 0;
            let size_is_bad = area.total_size > 256;
            if address_is_bad || size_is_bad {
                attributes.push_str("  ");
                if address_is_bad {
                    attributes.push_str(" Boundary");
                }
                if address_is_bad && size_is_bad {
                    attributes.push_str(" /");
                }
                if size_is_bad {
                    attributes.push_str(" Length");
                }
                attributes.push_str(" Error");
            }
        }

        writeln!(
            out,
            "{} {} {} {} {}",
            aligned(&area.name, HEADER_WIDTHS[0], ' ', true),
            aligned(
                &number_in_base(u32::from(area.start_address), view.base),
                HEADER_WIDTHS[1],
                ' ',
                false
            ),
            aligned(
                &number_in_base(u32::from(area.total_size), view.base),
                HEADER_WIDTHS[2],
                ' ',
                false
            ),
            aligned(
                &format!("= {} bytes", aligned(&area.total_size.to_string(), 6, ' ', false)),
                HEADER_WIDTHS[3],
                ' ',
                true
            ),
            attributes,
        )?;

        writeln!(out)?;
        write_header_lines(out, "  ", " ", &["Value", "Global"], &SYMBOL_WIDTHS)?;

        let memory_page = area.attributes.memory_page();
        for symbol_id in sorted_area_symbols(view.areas, view.symbols, area_id) {
            let symbol = view.symbols.get(symbol_id);
            let address = view.symbols.absolute_address(symbol_id, view.areas);
            let page_column = if memory_page == 0 {
                " ".repeat(MEMORY_PAGE_WIDTH)
            } else {
                format!(
                    "{}:",
                    aligned(
                        &number_in_base(u32::from(memory_page), view.base),
                        MEMORY_PAGE_WIDTH - 1,
                        '0',
                        false
                    )
                )
            };
            writeln!(
                out,
                "  {page_column}{} {}",
                aligned(
                    &number_in_base(u32::from(address), view.base),
                    SYMBOL_WIDTHS[0] - MEMORY_PAGE_WIDTH,
                    ' ',
                    false
                ),
                symbol.name,
            )?;
        }
        Ok(())
    }

    fn write_files_linked(out: &mut dyn Write, view: &MapView<'_>) -> Result<(), LinkError> {
        const WIDTHS: [usize; 2] = [32, 55];
        const MODULES_PER_LINE: usize = 3;
        const MODULE_COLUMN_WIDTH: usize = 16;

        let mut file_to_modules: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for id in view.modules.ids() {
            let module = view.modules.get(id);
            file_to_modules
                .entry(module.file_name.as_str())
                .or_default()
                .push(module.name.as_str());
        }

        writeln!(out)?;
        write_header_lines(out, "", "", &["Files Linked", "[ module(s) ]"], &WIDTHS)?;

        for file_name in view.link_files {
            let modules = file_to_modules
                .get(file_name.as_str())
                .map(Vec::as_slice)
                .unwrap_or_default();
            write!(out, "{}", aligned(file_name, WIDTHS[0], ' ', true))?;
            if !modules.is_empty() {
                write!(out, "[ ")?;
                for (index, name) in modules.iter().enumerate() {
                    if index > 0 {
                        write!(out, ",")?;
                        if index % MODULES_PER_LINE != 0 {
                            write!(out, " ")?;
                        } else {
                            write!(out, "\n{}", " ".repeat(WIDTHS[0] + 2))?;
                        }
                    }
                    write!(out, "{}", aligned(name, MODULE_COLUMN_WIDTH, ' ', true))?;
                }
                write!(out, " ]")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn write_libraries(out: &mut dyn Write, view: &MapView<'_>) -> Result<(), LinkError> {
        const WIDTHS: [usize; 2] = [32, 55];

        writeln!(out)?;
        write_header_lines(
            out,
            "",
            "",
            &["Libraries Linked", "[ object file     ]"],
            &WIDTHS,
        )?;

        for path in view.libraries.file_names() {
            let (directory, base_name) = match path.rfind('/') {
                Some(position) => path.split_at(position + 1),
                None => ("", path.as_str()),
            };
            let directory_column = if directory.len() <= WIDTHS[0] {
                aligned(directory, WIDTHS[0], ' ', true)
            } else {
                format!("...{}", &directory[directory.len() - (WIDTHS[0] - 3)..])
            };
            writeln!(out, "{directory_column}  {base_name}")?;
        }
        Ok(())
    }
}

impl MapEncoder for StandardMapEncoder {
    fn generate(&mut self, out: &mut dyn Write, view: &MapView<'_>) -> Result<(), LinkError> {
        match view.base {
            8 => writeln!(out, "Octal\n")?,
            10 => writeln!(out, "Decimal\n")?,
            _ => writeln!(out, "Hexadecimal\n")?,
        }

        for area_id in view.areas.area_ids() {
            Self::write_area(out, view, area_id)?;
        }

        Self::write_files_linked(out, view)?;
        Self::write_libraries(out, view)?;

        if !view.tables.base_address_list.is_empty() {
            writeln!(out, "\nUser Base Address Definitions\n")?;
            for line in &view.tables.base_address_list {
                writeln!(out, "{line}")?;
            }
        }
        if !view.tables.global_def_list.is_empty() {
            writeln!(out, "\nUser Global Definitions\n")?;
            for line in &view.tables.global_def_list {
                writeln!(out, "{line}")?;
            }
        }

        write!(out, "\n\x0c")?;
        view.symbols.check_undefined(out, view.modules)?;
        Ok(())
    }
}
