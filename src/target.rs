use crate::area::Address;
use crate::error::{Diagnostics, LinkError};
use crate::link::StringTables;
use crate::mapfile::MapFileTable;
use crate::output::CodeOutputTable;

pub mod gameboy;

/// ROM bank number; `UNDEFINED_BANK` marks modules without a bank
/// assignment.
pub type Bank = i32;

pub const UNDEFINED_BANK: Bank = -1;

/// Mutable pieces of the link a target may touch while it consumes its
/// command-line options.
pub struct TargetCli<'a> {
    pub stem: &'a str,
    pub arguments: &'a [String],
    pub handled: &'a mut [bool],
    pub outputs: &'a mut CodeOutputTable,
    pub maps: &'a mut MapFileTable,
    pub tables: &'a mut StringTables,
    pub diag: &'a mut Diagnostics,
}

/// Description of the target processor: endianness, name case policy,
/// bank detection, trampoline generation and the target half of the
/// command-line surface.
pub trait Target {
    fn is_big_endian(&self) -> bool;

    fn is_case_sensitive(&self) -> bool;

    /// ROM bank encoded in a segment name, 0 when none.
    fn bank_from_segment_name(&self, _segment_name: &str) -> Bank {
        0
    }

    /// Byte of the emitted image, for the listing updater.
    fn code_byte(&self, _bank: Bank, _address: Address) -> u8 {
        0xFF
    }

    /// Indented option help appended to the generic usage banner.
    fn usage_info(&self) -> String {
        String::new()
    }

    fn handle_command_line(&mut self, _cli: &mut TargetCli<'_>) -> Result<(), LinkError> {
        Ok(())
    }

    /// Present iff the target supports banked code.
    fn banking(&self) -> Option<&dyn BankingConfiguration> {
        None
    }
}

/// Banking half of a target description.
pub trait BankingConfiguration {
    /// Area collecting banked code before per-bank distribution.
    fn generic_banked_area_name(&self) -> &str;

    /// Area holding the trampoline table.
    fn nonbanked_area_name(&self) -> &str;

    fn banked_area_name(&self, bank: Bank) -> String;

    /// Label of the bank-switch routine for `bank`.
    fn jump_label(&self, bank: Bank) -> String;

    /// Surrogate symbol name standing in for an interbank call target.
    fn surrogate_name(&self, symbol: &str) -> String;

    fn is_valid_call_target(&self, module: &str, segment: &str, symbol: &str) -> bool;

    /// Bytes one trampoline occupies in the non-banked area.
    fn trampoline_size(&self) -> u8;

    /// `T`/`R` line pair of one trampoline, in object-file text.
    fn trampoline_code(
        &self,
        start_address: Address,
        area_index: u16,
        target_symbol_index: u16,
        jump_symbol_index: u16,
    ) -> String;
}

/// Resolves a platform name to its target description.
#[must_use]
pub fn select(platform_name: &str) -> Option<Box<dyn Target>> {
    match platform_name {
        "gbz80" | "gameboy" => Some(Box::new(gameboy::GameboyTarget::new())),
        _ => None,
    }
}
