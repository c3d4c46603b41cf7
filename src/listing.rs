use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::debug;

use crate::area::Address;
use crate::banking::{self, BankingState};
use crate::error::{Diagnostics, LinkError};
use crate::link::Link;
use crate::module::{ModuleId, ModuleStore};
use crate::scanner::{self, TokenKind};
use crate::target::{Bank, Target};

const PREFIX_LENGTH: usize = 25;
const LINE_NUMBER_LENGTH: usize = 6;
const MINIMUM_LENGTH: usize = PREFIX_LENGTH + LINE_NUMBER_LENGTH + 1;
const MAX_NUMBER_COUNT: usize = 10;

const AREA_KEYWORD: &str = ".area";

fn format_value(value: u16, base: u32, width: usize) -> String {
    match base {
        8 => format!("{value:0width$o}"),
        10 => format!("{value:0width$}"),
        _ => format!("{value:0width$X}"),
    }
}

/// Stem of a link file name: the extension is stripped only when the dot
/// belongs to the last path component.
fn file_stem(link_file_name: &str) -> &str {
    let dot = link_file_name.rfind('.');
    let slash = link_file_name.rfind('/');
    match (dot, slash) {
        (Some(dot), Some(slash)) if dot < slash => link_file_name,
        (Some(dot), _) => &link_file_name[..dot],
        (None, _) => link_file_name,
    }
}

struct ListingState<'a> {
    target: &'a dyn Target,
    banking: &'a BankingState,
    modules: &'a ModuleStore,
    module: ModuleId,
    base: u32,
    segment_addresses: HashMap<String, Address>,
    segment_bank: Bank,
    segment_address: Address,
    program_counter: Address,
}

impl ListingState<'_> {
    /// Detects an `.area` directive in a source-only line, switching the
    /// relocation base to that segment. When banking moved the segment,
    /// the directive is rewritten to the banked area name.
    fn check_for_area_decl(&mut self, code_line: &mut String) -> bool {
        let Ok(tokens) = scanner::tokenize_line(code_line) else {
            return true;
        };
        let [keyword, rest @ ..] = tokens.as_slice() else {
            return true;
        };
        if keyword.kind != TokenKind::Identifier || keyword.text != AREA_KEYWORD {
            return true;
        }
        let Some(name) = rest.first().filter(|token| token.is_identifier()) else {
            return false;
        };

        let segment_name = banking::adapt_area_name(
            self.target,
            self.banking,
            self.modules,
            self.module,
            &name.text,
        );
        if segment_name != name.text {
            *code_line = format!("\t{AREA_KEYWORD}\t{segment_name}");
        }

        self.segment_bank = self.target.bank_from_segment_name(&segment_name);
        match self.segment_addresses.get(&segment_name) {
            Some(&address) => {
                self.segment_address = address;
                true
            }
            None => false,
        }
    }

    /// Rewrites the address and data bytes of one listing data line to
    /// their post-layout values. The first four-digit group is the line
    /// address; the remaining groups are code bytes.
    fn relocate_data(&mut self, data_line: &mut String) -> bool {
        let mut bytes = data_line.clone().into_bytes();
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut is_okay = true;

        let mut position = 0;
        while position < bytes.len() {
            let ch = bytes[position];
            if ch == b' ' {
                position += 1;
                continue;
            }
            if !ch.is_ascii_hexdigit() || spans.len() >= MAX_NUMBER_COUNT {
                is_okay = false;
                position += 1;
                continue;
            }
            let start = position;
            while position < bytes.len() && bytes[position].is_ascii_hexdigit() {
                position += 1;
            }
            spans.push((start, position - start));
        }

        for &(start, count) in &spans {
            let text = std::str::from_utf8(&bytes[start..start + count]).unwrap_or("0");
            let parsed = u16::from_str_radix(text, self.base).unwrap_or(0);
            let value = if count == 4 {
                let address = self.segment_address.wrapping_add(parsed);
                self.program_counter = address;
                address
            } else {
                let byte = self
                    .target
                    .code_byte(self.segment_bank, self.program_counter);
                self.program_counter = self.program_counter.wrapping_add(1);
                u16::from(byte)
            };
            let formatted = format_value(value, self.base, count);
            let formatted = formatted.as_bytes();
            let copied = &formatted[formatted.len() - count..];
            bytes[start..start + count].copy_from_slice(copied);
        }

        *data_line = String::from_utf8(bytes).unwrap_or_default();
        is_okay
    }

    fn adapt_file(
        &mut self,
        listing_file_name: &str,
        listing: &mut dyn BufRead,
        revised: &mut dyn Write,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        let empty_prefix = " ".repeat(PREFIX_LENGTH);
        let mut after_code_lines = false;
        let mut line_number: u32 = 0;

        self.program_counter = 0;
        let mut buffer = String::new();
        loop {
            buffer.clear();
            if listing.read_line(&mut buffer)? == 0 {
                break;
            }
            let line = buffer.trim_end_matches(['\r', '\n']).to_string();

            if line.starts_with('\x0c') {
                after_code_lines = true;
            }
            if after_code_lines {
                writeln!(revised, "{line}")?;
                continue;
            }

            let is_continuation = line.len() < MINIMUM_LENGTH;
            let (mut prefix, number_column, mut suffix);
            if is_continuation {
                prefix = line.clone();
                number_column = String::new();
                suffix = String::new();
            } else {
                line_number += 1;
                prefix = line[..PREFIX_LENGTH].to_string();
                number_column = line[PREFIX_LENGTH..MINIMUM_LENGTH - 1].to_string();
                suffix = line[MINIMUM_LENGTH..].to_string();
            }

            let is_okay = if prefix == empty_prefix {
                self.check_for_area_decl(&mut suffix)
            } else {
                self.relocate_data(&mut prefix)
            };
            if !is_okay {
                diag.warning(&format!(
                    "problems with listing file line {listing_file_name} ({line_number})"
                ));
            }

            if is_continuation {
                writeln!(revised, "{prefix}")?;
            } else {
                writeln!(revised, "{prefix}{number_column} {suffix}")?;
            }
        }
        Ok(())
    }
}

/// Rewrites each `<stem>.lst` assembler listing into `<stem>.rst` with
/// final addresses and post-layout bytes patched in.
pub fn update(link: &mut Link) -> Result<(), LinkError> {
    let base = link.options.radix;
    let link_files = link.options.link_files.clone();

    for link_file_name in &link_files {
        let stem = file_stem(link_file_name).to_string();
        let listing_file_name = format!("{stem}.lst");
        if !Path::new(&listing_file_name).is_file() {
            continue;
        }
        if !link.modules.set_current_by_file_name(link_file_name) {
            continue;
        }
        let module = link.modules.current().expect("module selected above");

        let mut segment_addresses = HashMap::new();
        for &segment in &link.modules.get(module).segments {
            segment_addresses.insert(
                link.areas.segment_area_name(segment).to_string(),
                link.areas.segment(segment).start_address,
            );
        }

        debug!("updating listing {listing_file_name}");
        let listing = File::open(&listing_file_name).map_err(|source| LinkError::FileOpen {
            path: listing_file_name.clone(),
            source,
        })?;
        let revised_file_name = format!("{stem}.rst");
        let revised = File::create(&revised_file_name).map_err(|source| LinkError::FileOpen {
            path: revised_file_name,
            source,
        })?;

        let Link {
            modules,
            banking,
            target,
            diag,
            ..
        } = link;
        let mut state = ListingState {
            target: target.as_ref(),
            banking,
            modules,
            module,
            base,
            segment_addresses,
            segment_bank: 0,
            segment_address: 0,
            program_counter: 0,
        };
        state.adapt_file(
            &listing_file_name,
            &mut BufReader::new(listing),
            &mut BufWriter::new(revised),
            diag,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems_respect_path_components() {
        assert_eq!(file_stem("main.o"), "main");
        assert_eq!(file_stem("dir.d/main.o"), "dir.d/main");
        assert_eq!(file_stem("dir.d/main"), "dir.d/main");
        assert_eq!(file_stem("plain"), "plain");
    }

    #[test]
    fn value_formatting_matches_radix() {
        assert_eq!(format_value(0x01AB, 16, 4), "01AB");
        assert_eq!(format_value(0o17, 8, 3), "017");
        assert_eq!(format_value(42, 10, 2), "42");
    }
}
