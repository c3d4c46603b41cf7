use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};

use log::debug;

use crate::error::{Diagnostics, LinkError};
use crate::link::Link;
use crate::module::{ModuleId, ModuleStore};
use crate::parser;
use crate::symbol;
use crate::target::{Bank, Target, UNDEFINED_BANK};

/// Virtual input file carrying the synthesized trampoline object.
pub const STUB_FILE_NAME: &str = "generatedBanking.o";

/// Module name declared by the synthesized stub object.
pub const STUB_MODULE_NAME: &str = "generatedBanking";

/// Module-to-bank assignments read from the banking configuration file.
#[derive(Debug, Default)]
pub struct BankingState {
    module_bank: HashMap<String, Bank>,
}

impl BankingState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_module_bank(&mut self, module_name: &str, bank: Bank) {
        self.module_bank.insert(module_name.to_uppercase(), bank);
    }

    #[must_use]
    pub fn module_bank(&self, module_name: &str) -> Bank {
        self.module_bank
            .get(&module_name.to_uppercase())
            .copied()
            .unwrap_or(UNDEFINED_BANK)
    }

    /// Reads `moduleName = bankNumber` lines; `;` introduces a comment
    /// line and a blank line terminates the list.
    pub fn read_configuration_file(
        &mut self,
        path: &str,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        let file = fs::File::open(path).map_err(|source| LinkError::FileOpen {
            path: path.to_string(),
            source,
        })?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if line.starts_with(';') {
                continue;
            }
            match parser::parse_value_map_line(line) {
                Some((name, bank)) => self.set_module_bank(&name, bank as Bank),
                None => diag.warning(&format!("bad definition: {line}")),
            }
        }
        Ok(())
    }
}

fn bank_of_module(banking: &BankingState, modules: &ModuleStore, module: ModuleId) -> Bank {
    banking.module_bank(&modules.get(module).name)
}

/// Rewrites an `A`-line area name during pass 2: segments of the generic
/// banked area live in the per-bank area of their module.
#[must_use]
pub fn adapt_area_name(
    target: &dyn Target,
    banking: &BankingState,
    modules: &ModuleStore,
    module: ModuleId,
    area_name: &str,
) -> String {
    if let Some(configuration) = target.banking() {
        if area_name == configuration.generic_banked_area_name() {
            let bank = bank_of_module(banking, modules, module);
            return configuration.banked_area_name(bank);
        }
    }
    area_name.to_string()
}

/// Moves every segment of the generic banked-code area into the per-bank
/// area derived from its module's bank, emptying the generic area.
fn relocate_banked_segments(link: &mut Link) {
    let Some(configuration) = link.target.banking() else {
        return;
    };
    let generic_name = configuration.generic_banked_area_name().to_string();
    let Some(generic_area) = link.areas.lookup(&generic_name) else {
        link.diag
            .warning(&format!("no banked segments found for area {generic_name}"));
        return;
    };

    let attributes = link.areas.area(generic_area).attributes;
    let segments = link.areas.area(generic_area).segments.clone();
    for segment in segments {
        let module = link.areas.segment(segment).module;
        let bank = bank_of_module(&link.banking, &link.modules, module);
        let banked_name = configuration.banked_area_name(bank);
        let banked_area = link.areas.make_area(&banked_name, attributes, &mut link.diag);
        link.areas.set_segment_area(segment, banked_area);
    }
    link.areas.clear_area_segments(generic_area);
}

/// Detects interbank references, splits each referenced symbol into a
/// surrogate, and feeds a synthesized trampoline object back through the
/// pass-1 parser. Returns whether any interbank reference was found.
pub fn resolve_interbank_references(link: &mut Link) -> Result<bool, LinkError> {
    if link.target.banking().is_none() {
        return Ok(false);
    }

    relocate_banked_segments(link);

    let mut jump_labels: Vec<String> = Vec::new();
    let mut surrogate_names: Vec<String> = Vec::new();
    let mut symbol_names: Vec<String> = Vec::new();
    let mut symbol_to_label: Vec<usize> = Vec::new();
    let mut bank_to_label: HashMap<Bank, usize> = HashMap::new();

    let stub_text = {
        let configuration = link.target.banking().expect("banking checked above");

        for module in link.modules.ids().collect::<Vec<_>>() {
            let current_bank = bank_of_module(&link.banking, &link.modules, module);
            let module_symbols = link.modules.get(module).symbols.clone();

            for symbol_id in module_symbols {
                let record = link.symbols.get(symbol_id);
                let Some(segment) = record.segment else {
                    continue;
                };
                if record.is_surrogate() {
                    continue;
                }

                let target_module = link.areas.segment(segment).module;
                let target_bank = bank_of_module(&link.banking, &link.modules, target_module);
                if current_bank == target_bank || target_bank == UNDEFINED_BANK {
                    continue;
                }
                if !configuration.is_valid_call_target(
                    &link.modules.get(target_module).name,
                    link.areas.segment_area_name(segment),
                    &record.name,
                ) {
                    continue;
                }

                let symbol_name = record.name.clone();
                let surrogate_name = configuration.surrogate_name(&symbol_name);
                if symbol::split_symbol(
                    &mut link.symbols,
                    &mut link.areas,
                    &mut link.modules,
                    symbol_id,
                    &surrogate_name,
                )
                .is_none()
                {
                    continue;
                }

                symbol_names.push(symbol_name);
                surrogate_names.push(surrogate_name);
                let label_index = *bank_to_label.entry(target_bank).or_insert_with(|| {
                    jump_labels.push(configuration.jump_label(target_bank));
                    jump_labels.len() - 1
                });
                symbol_to_label.push(label_index);
            }
        }

        if symbol_names.is_empty() {
            return Ok(false);
        }
        debug!(
            "banking: {} interbank calls through {} switch labels",
            symbol_names.len(),
            jump_labels.len()
        );

        write_stub_object(
            configuration,
            &jump_labels,
            &surrogate_names,
            &symbol_names,
            &symbol_to_label,
        )?
    };

    link.virtual_files
        .insert(STUB_FILE_NAME.to_string(), stub_text);
    parser::parse_object_files(link, true, &[STUB_FILE_NAME.to_string()])?;
    link.options.link_files.push(STUB_FILE_NAME.to_string());
    Ok(true)
}

/// Renders the synthesized stub object. Its symbol list starts with the
/// bank-switch jump labels and the surrogate-name references (the real
/// routines), followed by the trampoline definitions under the original
/// names; relocation records index into that order.
fn write_stub_object(
    configuration: &dyn crate::target::BankingConfiguration,
    jump_labels: &[String],
    surrogate_names: &[String],
    symbol_names: &[String],
    symbol_to_label: &[usize],
) -> Result<String, LinkError> {
    if jump_labels.is_empty() {
        return Err(LinkError::BadStubPrecondition("no jump labels"));
    }
    if surrogate_names.len() != symbol_names.len() {
        return Err(LinkError::BadStubPrecondition(
            "no matching surrogates for external symbols",
        ));
    }

    let trampoline_size = u16::from(configuration.trampoline_size());
    let total_symbol_count = jump_labels.len() + 2 * surrogate_names.len();
    let mut text = String::new();

    text.push_str("X\n");
    text.push_str(&format!("H 1 areas {total_symbol_count:04X} global symbols\n"));
    text.push_str(&format!("M {STUB_MODULE_NAME}\n"));

    for external_name in jump_labels.iter().chain(surrogate_names) {
        text.push_str(&format!("S {external_name} Ref0000\n"));
    }

    let jump_table_size = symbol_names.len() as u16 * trampoline_size;
    text.push_str(&format!(
        "A {} size {jump_table_size:04X} flags 0\n",
        configuration.nonbanked_area_name()
    ));

    let mut offset_in_segment: u16 = 0;
    for trampoline_name in symbol_names {
        text.push_str(&format!("S {trampoline_name} Def{offset_in_segment:04X}\n"));
        offset_in_segment = offset_in_segment.wrapping_add(trampoline_size);
    }

    let mut start_address: u16 = 0;
    let mut target_symbol_index = jump_labels.len() as u16;
    for &label_index in symbol_to_label {
        text.push_str(&configuration.trampoline_code(
            start_address,
            0,
            target_symbol_index,
            label_index as u16,
        ));
        target_symbol_index += 1;
        start_address = start_address.wrapping_add(trampoline_size);
    }
    Ok(text)
}
