use std::io::Write;

use crate::area::Address;
use crate::error::LinkError;
use crate::mapfile::{MapEncoder, MapView, sorted_area_symbols};

const GLOBAL_FUNC_SUFFIX: &str = ".FN";
const STATIC_FUNC_SUFFIX: &str = ".SFN";
const END_OF_FUNC_SUFFIX: &str = ".EFN";
const SPECIAL_COMMENT_PREFIX: &str = ";!";

/// NoICE debug map: decodes the SDCC name mangling (`file.line#`,
/// `file.function.symbol`, `file.function..FN`) into `FILE`, `FUNC`,
/// `ENDF`, `DEF` and `LINE` directives with `page:0xaddr` addresses.
#[derive(Debug, Default)]
pub struct NoIceMapEncoder {
    current_file: String,
    current_function: String,
}

fn paged_address(address: Address, page: u8) -> String {
    format!(" {page:X}:0x{address:X}")
}

impl NoIceMapEncoder {
    fn write_file(&mut self, out: &mut dyn Write, file_name: &str) -> Result<(), LinkError> {
        if file_name != self.current_file {
            self.current_file = file_name.to_string();
            writeln!(out, "FILE {file_name}")?;
        }
        Ok(())
    }

    fn write_function(
        &mut self,
        out: &mut dyn Write,
        name: &str,
        is_static: bool,
        address: Address,
        page: u8,
    ) -> Result<(), LinkError> {
        if name == self.current_function {
            return Ok(());
        }
        self.current_function = name.to_string();
        if address != 0 {
            let command = if is_static { "DEFS" } else { "DEF" };
            writeln!(out, "{command} {name}{}", paged_address(address, page))?;
        }
        let command = if is_static { "SFUNC" } else { "FUNC" };
        write!(out, "{command} {name}")?;
        if address != 0 {
            write!(out, "{}", paged_address(address, page))?;
        }
        writeln!(out)?;
        Ok(())
    }

    fn write_function_end(
        &mut self,
        out: &mut dyn Write,
        address: Address,
        page: u8,
    ) -> Result<(), LinkError> {
        if self.current_function.is_empty() {
            return Ok(());
        }
        self.current_function.clear();
        write!(out, "ENDF")?;
        if address != 0 {
            write!(out, "{}", paged_address(address, page))?;
        }
        writeln!(out)?;
        Ok(())
    }

    fn write_line_number(
        out: &mut dyn Write,
        line_text: &str,
        address: Address,
        page: u8,
    ) -> Result<(), LinkError> {
        let line_number: u32 = line_text.parse().unwrap_or(0);
        writeln!(out, "LINE {line_number}{}", paged_address(address, page))?;
        Ok(())
    }

    fn write_symbol(
        out: &mut dyn Write,
        name: &str,
        is_static: bool,
        address: Address,
        page: u8,
    ) -> Result<(), LinkError> {
        let command = if is_static { "DEFS" } else { "DEF" };
        writeln!(out, "{command} {name}{}", paged_address(address, page))?;
        Ok(())
    }

    fn process_symbol(
        &mut self,
        out: &mut dyn Write,
        name: &str,
        address: Address,
        page: u8,
    ) -> Result<(), LinkError> {
        let Some(dot) = name.find('.') else {
            // a plain symbol without any mangling
            return Self::write_symbol(out, name, false, address, page);
        };
        if dot == name.len() - 1 {
            log::debug!("unparsable mangled symbol {name}");
            return Ok(());
        }

        let file_token = &name[..dot];
        let suffix = &name[dot + 1..];

        match suffix.find('.') {
            Some(inner) if inner == suffix.len() - 1 => {
                log::debug!("unparsable mangled symbol {name}");
                Ok(())
            }
            None => {
                self.write_file(out, file_token)?;
                if suffix.as_bytes()[0].is_ascii_digit() {
                    // "file.line#"
                    Self::write_line_number(out, suffix, address, page)
                } else {
                    self.write_function_end(out, 0, 0)?;
                    Self::write_symbol(out, suffix, true, address, page)
                }
            }
            Some(inner) => {
                self.write_file(out, file_token)?;
                let function_token = &suffix[..inner];
                let rest = &suffix[inner + 1..];
                if rest.starts_with('.') {
                    // "file.function..FN" and friends
                    match rest {
                        GLOBAL_FUNC_SUFFIX => {
                            self.write_function(out, function_token, false, address, page)
                        }
                        STATIC_FUNC_SUFFIX => {
                            self.write_function(out, function_token, true, address, page)
                        }
                        END_OF_FUNC_SUFFIX => self.write_function_end(out, address, page),
                        _ => Ok(()),
                    }
                } else {
                    // "file.function.symbol", optionally with a scope level
                    self.write_function(out, function_token, false, 0, 0)?;
                    let mut scoped_name = file_token.to_string();
                    if let Some(level_dot) = rest.find('.') {
                        if level_dot != rest.len() - 1 {
                            if let Ok(level) = rest[level_dot + 1..].parse::<u32>() {
                                if level > 0 {
                                    scoped_name.push('_');
                                    scoped_name.push_str(&level.to_string());
                                }
                            }
                        }
                    }
                    Self::write_symbol(out, &scoped_name, true, address, page)
                }
            }
        }
    }
}

impl MapEncoder for NoIceMapEncoder {
    fn write_comment(&mut self, out: &mut dyn Write, comment: &str) -> Result<(), LinkError> {
        if let Some(rest) = comment.strip_prefix(SPECIAL_COMMENT_PREFIX) {
            writeln!(out, "{rest}")?;
        }
        Ok(())
    }

    fn generate(&mut self, out: &mut dyn Write, view: &MapView<'_>) -> Result<(), LinkError> {
        for area_id in view.areas.area_ids() {
            let page = view.areas.area(area_id).attributes.memory_page();
            for symbol_id in sorted_area_symbols(view.areas, view.symbols, area_id) {
                let name = view.symbols.get(symbol_id).name.clone();
                let address = view.symbols.absolute_address(symbol_id, view.areas);
                self.process_symbol(out, &name, address, page)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paged_address_format() {
        assert_eq!(paged_address(0x1234, 0x0C), " C:0x1234");
        assert_eq!(paged_address(0x0042, 0), " 0:0x42");
    }
}
