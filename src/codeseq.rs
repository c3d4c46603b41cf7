use bitflags::bitflags;

use crate::area::{Address, AreaStore, SegmentId};
use crate::error::{Diagnostics, LinkError};
use crate::mapfile::MapFileTable;
use crate::module::{ModuleId, ModuleStore};
use crate::symbol::{SymbolId, SymbolTable};
use crate::target::{Bank, Target};

/// Maximum length of a single code sequence to be relocated.
pub const MAX_SEQUENCE_LENGTH: usize = 256;

bitflags! {
    /// External encoding of a relocation record's mode byte. The decode /
    /// encode pair is stable for every byte value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RelocationKind: u8 {
        /// Keep the most significant byte of a half-word byte relocation.
        const MSB_USED       = 0x80;
        const PAGE           = 0x40;
        const ZERO_PAGE      = 0x20;
        const SIGNED         = 0x10;
        const SLOT_WIDTH_TWO = 0x08;
        const PC_RELATIVE    = 0x04;
        /// Value indexes a symbol, else a segment.
        const SYMBOL         = 0x02;
        /// Elements are bytes, else words.
        const BYTES          = 0x01;
    }
}

impl RelocationKind {
    #[must_use]
    pub fn from_encoding(byte: u8) -> Self {
        Self::from_bits_retain(byte)
    }

    #[must_use]
    pub fn to_encoding(self) -> u8 {
        self.bits()
    }
}

/// A contiguous block of code bytes placed at an offset within a segment.
#[derive(Debug, Clone, Default)]
pub struct CodeSequence {
    pub segment: Option<SegmentId>,
    pub rom_bank: Bank,
    pub offset_address: u32,
    pub bytes: Vec<u8>,
}

/// A single relocation: mode byte, index into the code bytes, and a
/// symbol/segment index operand.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub kind: RelocationKind,
    pub index: u8,
    pub value: u16,
}

#[derive(Debug, Clone, Default)]
pub struct RelocationList {
    pub segment: Option<SegmentId>,
    pub list: Vec<Relocation>,
}

/// Frozen-graph view the relocator works against in pass 2.
pub struct RelocContext<'a> {
    pub areas: &'a AreaStore,
    pub modules: &'a ModuleStore,
    pub symbols: &'a SymbolTable,
    pub module: ModuleId,
    pub target: &'a dyn Target,
    pub diag: &'a mut Diagnostics,
    pub maps: &'a mut MapFileTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocError {
    UnsignedByte,
    PcRelativeByte,
    PageZero,
    Page,
}

impl RelocError {
    fn message(self) -> &'static str {
        match self {
            Self::UnsignedByte => "Unsigned Byte error",
            Self::PcRelativeByte => "Byte PCR relocation error",
            Self::PageZero => "Page0 relocation error",
            Self::Page => "Page Mode relocation error",
        }
    }
}

struct ErrorRecord {
    kind: RelocationKind,
    symbol: Option<SymbolId>,
    segment: Option<SegmentId>,
    code_address: Address,
    value: u16,
}

fn least_significant_byte(value: u16) -> u8 {
    (value & 0xFF) as u8
}

fn most_significant_byte(value: u16) -> u8 {
    (value >> 8) as u8
}

fn make_word(bytes: &[u8], big_endian: bool) -> u16 {
    if big_endian {
        u16::from(bytes[0]) << 8 | u16::from(bytes[1])
    } else {
        u16::from(bytes[1]) << 8 | u16::from(bytes[0])
    }
}

/// Adds `value` into the two-byte slot, wrapping modulo 2^16.
fn add_word_to_word(value: u16, slot: &mut [u8], big_endian: bool) -> u16 {
    let result = value.wrapping_add(make_word(slot, big_endian));
    let lsb = least_significant_byte(result);
    let msb = most_significant_byte(result);
    if big_endian {
        slot[0] = msb;
        slot[1] = lsb;
    } else {
        slot[0] = lsb;
        slot[1] = msb;
    }
    result
}

/// Writes `value` into the low half of a word slot and clears the other
/// byte.
fn set_word_slot_to_byte(value: u8, slot: &mut [u8], big_endian: bool) {
    if big_endian {
        slot[0] = 0;
        slot[1] = value;
    } else {
        slot[0] = value;
        slot[1] = 0;
    }
}

/// Marks the low or high byte of a two-byte slot as insignificant so the
/// relaxation pass drops it.
fn reset_byte_flag(flags: &mut [bool], low_byte: bool, big_endian: bool) {
    let mut index = usize::from(!low_byte);
    if big_endian {
        index = 1 - index;
    }
    flags[index] = false;
}

#[allow(clippy::too_many_arguments)]
fn process_one_relocation(
    ctx: &mut RelocContext<'_>,
    base_address: Address,
    offset_by_relaxation: &mut u16,
    relocation: Relocation,
    bytes: &mut [u8],
    significant: &mut [bool],
) -> Result<Option<(RelocError, ErrorRecord)>, LinkError> {
    let kind = relocation.kind;
    let big_endian = ctx.target.is_big_endian();
    let index = usize::from(relocation.index);

    let mut referenced_symbol = None;
    let mut referenced_segment = None;

    // resolve the referenced symbol or segment
    let target_address: Address = if kind.contains(RelocationKind::SYMBOL) {
        match ctx.modules.symbol_by_index(ctx.module, usize::from(relocation.value)) {
            Some(symbol) => {
                referenced_symbol = Some(symbol);
                ctx.symbols.absolute_address(symbol, ctx.areas)
            }
            None => {
                ctx.diag.warning("R symbol error");
                return Ok(None);
            }
        }
    } else {
        // skip the implicit absolute segment at position 0
        match ctx
            .modules
            .segment_by_index(ctx.module, usize::from(relocation.value) + 1)
        {
            Some(segment) => {
                referenced_segment = Some(segment);
                ctx.areas.segment(segment).start_address
            }
            None => {
                ctx.diag.warning("R area error");
                return Ok(None);
            }
        }
    };

    let slot_width = if kind.contains(RelocationKind::SLOT_WIDTH_TWO) {
        2
    } else {
        1
    };
    if index + slot_width > bytes.len() {
        ctx.diag.warning("R index error");
        return Ok(None);
    }

    let mut relocated = target_address;

    if kind.contains(RelocationKind::PC_RELATIVE) {
        // TODO: compute the real current-instruction address; emitted
        // images currently rely on the zero base
        let current_address: Address = 0;
        relocated = relocated.wrapping_sub(
            current_address.wrapping_add((index as u16).wrapping_sub(*offset_by_relaxation)),
        );
        relocated = relocated.wrapping_sub(if kind.contains(RelocationKind::BYTES) {
            1
        } else {
            2
        });
    }

    if kind.contains(RelocationKind::PAGE) || kind.contains(RelocationKind::ZERO_PAGE) {
        return Err(LinkError::UnsupportedPagedRelocation);
    }

    // full-width arithmetic result, kept unmasked for the range checks
    let full_value: u16;

    if kind.contains(RelocationKind::BYTES) {
        if slot_width == 1 {
            full_value = u16::from(bytes[index]).wrapping_add(relocated);
            bytes[index] = least_significant_byte(full_value);
        } else {
            let slot = &mut bytes[index..index + 2];
            full_value = add_word_to_word(relocated, slot, big_endian);
            let flags = &mut significant[index..index + 2];
            if kind.contains(RelocationKind::MSB_USED) {
                reset_byte_flag(flags, true, big_endian);
            } else {
                reset_byte_flag(flags, false, big_endian);
            }
            *offset_by_relaxation += 1;
        }
    } else {
        let slot = &mut bytes[index..index + 2];
        full_value = add_word_to_word(relocated, slot, big_endian);
        if slot_width == 2 {
            // the assembler flags this combination as an error but it is
            // processed anyway
            let byte_value = if kind.contains(RelocationKind::MSB_USED) {
                most_significant_byte(full_value)
            } else {
                least_significant_byte(full_value)
            };
            set_word_slot_to_byte(byte_value, slot, big_endian);
        }
    }

    // range diagnostics on the unmasked result; half-word byte
    // relocations keep one byte of the word and are not range-checked
    let msb_is_nonzero = most_significant_byte(full_value) != 0;
    let error = if kind.contains(RelocationKind::PC_RELATIVE) && kind.contains(RelocationKind::BYTES)
    {
        let range = full_value & 0xFF80;
        (range != 0xFF80 && range != 0).then_some(RelocError::PcRelativeByte)
    } else if !kind.contains(RelocationKind::SIGNED)
        && kind.contains(RelocationKind::BYTES)
        && slot_width == 1
        && msb_is_nonzero
    {
        Some(RelocError::UnsignedByte)
    } else {
        None
    };

    Ok(error.map(|error| {
        (
            error,
            ErrorRecord {
                kind,
                symbol: referenced_symbol,
                segment: referenced_segment,
                code_address: base_address
                    .wrapping_add((index as u16).wrapping_sub(*offset_by_relaxation))
                    .wrapping_sub(1),
                value: relocation.value,
            },
        )
    }))
}

fn site_line(ctx: &RelocContext<'_>, module: ModuleId, segment: SegmentId, offset: Address) -> String {
    let module = ctx.modules.get(module);
    format!(
        "{} / {} / {} / {:X}\n",
        module.file_name,
        module.name,
        ctx.areas.segment_area_name(segment),
        offset
    )
}

fn report_relocation_error(
    ctx: &mut RelocContext<'_>,
    current_segment: Option<SegmentId>,
    error: RelocError,
    record: &ErrorRecord,
) {
    let mut message = String::from(error.message());
    if kind_references_symbol(record) {
        if let Some(symbol) = record.symbol {
            message.push_str(" for symbol ");
            message.push_str(&ctx.symbols.get(symbol).name);
        }
    }
    message.push('\n');
    message.push_str("         file / module / area / offset\n");

    message.push_str("  Refby  ");
    if let Some(segment) = current_segment {
        message.push_str(&site_line(ctx, ctx.module, segment, record.code_address));
    }

    let (defining_segment, offset) = if let Some(symbol) = record.symbol {
        (
            ctx.symbols.get(symbol).segment,
            ctx.symbols.absolute_address(symbol, ctx.areas),
        )
    } else {
        (record.segment, record.value)
    };
    if let Some(segment) = defining_segment {
        message.push_str("  Defin  ");
        let module = ctx.areas.segment(segment).module;
        message.push_str(&site_line(ctx, module, segment, offset));
    }

    ctx.diag.warning(&message);
    ctx.maps.write_error_message(&message);
}

fn kind_references_symbol(record: &ErrorRecord) -> bool {
    record.kind.contains(RelocationKind::SYMBOL)
}

/// Applies `relocations` to `sequence`, rewrites its bytes in place,
/// resolves its final address and bank, and drops bytes freed by operand
/// relaxation.
pub fn relocate(
    sequence: &mut CodeSequence,
    area_mode: u16,
    relocations: &RelocationList,
    ctx: &mut RelocContext<'_>,
) -> Result<(), LinkError> {
    if area_mode != 0 {
        return Err(LinkError::BadAreaMode(area_mode));
    }
    let Some(segment) = relocations.segment else {
        return Err(LinkError::BadSegmentInRelocation);
    };

    let segment_address = ctx.areas.segment(segment).start_address;
    let segment_name = ctx.areas.segment_area_name(segment).to_string();

    sequence.offset_address = sequence
        .offset_address
        .wrapping_add(u32::from(segment_address));
    sequence.rom_bank = ctx.target.bank_from_segment_name(&segment_name);

    let mut significant = vec![true; sequence.bytes.len()];
    let mut offset_by_relaxation: u16 = 0;
    let base_address = sequence.offset_address as Address;

    for &relocation in &relocations.list {
        let error = process_one_relocation(
            ctx,
            base_address,
            &mut offset_by_relaxation,
            relocation,
            &mut sequence.bytes,
            &mut significant,
        )?;
        if let Some((error, record)) = error {
            report_relocation_error(ctx, Some(segment), error, &record);
        }
    }

    // operand relaxation: drop all insignificant bytes
    let mut kept = 0;
    for index in 0..sequence.bytes.len() {
        if significant[index] {
            sequence.bytes[kept] = sequence.bytes[index];
            kept += 1;
        }
    }
    sequence.bytes.truncate(kept);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip_is_stable_for_every_byte() {
        for byte in 0..=255u8 {
            assert_eq!(RelocationKind::from_encoding(byte).to_encoding(), byte);
        }
    }

    #[test]
    fn word_add_respects_endianness() {
        let mut little = [0x34, 0x12];
        assert_eq!(add_word_to_word(0x0001, &mut little, false), 0x1235);
        assert_eq!(little, [0x35, 0x12]);

        let mut big = [0x12, 0x34];
        assert_eq!(add_word_to_word(0x0001, &mut big, true), 0x1235);
        assert_eq!(big, [0x12, 0x35]);
    }

    #[test]
    fn word_add_wraps_modulo_two_to_sixteen() {
        let mut slot = [0xFF, 0xFF];
        assert_eq!(add_word_to_word(0x0002, &mut slot, false), 0x0001);
        assert_eq!(slot, [0x01, 0x00]);
    }

    #[test]
    fn byte_flag_reset_follows_endianness() {
        let mut flags = [true, true];
        reset_byte_flag(&mut flags, true, false);
        assert_eq!(flags, [false, true]);

        let mut flags = [true, true];
        reset_byte_flag(&mut flags, true, true);
        assert_eq!(flags, [true, false]);
    }

    #[test]
    fn word_element_half_slot_collapses_without_msb_flag() {
        use crate::area::{AreaAttributes, AreaStore};
        use crate::mapfile::MapFileTable;
        use crate::module::ModuleStore;
        use crate::symbol::SymbolTable;
        use crate::target::gameboy::GameboyTarget;

        let mut areas = AreaStore::new();
        let mut modules = ModuleStore::new();
        let symbols = SymbolTable::new(true);
        let mut diag = Diagnostics::new();
        let mut maps = MapFileTable::new();
        let target = GameboyTarget::new();

        let module = modules.make("m.o", 1, 0);
        modules.add_segment(module, areas.make_absolute_segment(module, &mut diag));
        let code = areas.make_segment("CODE", 0x10, AreaAttributes::empty(), module, &mut diag);
        modules.add_segment(module, code);
        areas.set_base_address("CODE", 0x0123);
        areas.link_areas(&mut diag);

        // kind 0x08: word elements, two-byte slot, area reference, MSB
        // flag clear; the slot keeps the low byte and clears the other
        let mut sequence = CodeSequence {
            segment: Some(code),
            rom_bank: 0,
            offset_address: 0,
            bytes: vec![0xAA, 0x00, 0x00],
        };
        let relocations = RelocationList {
            segment: Some(code),
            list: vec![Relocation {
                kind: RelocationKind::from_encoding(0x08),
                index: 1,
                value: 0,
            }],
        };
        let mut ctx = RelocContext {
            areas: &areas,
            modules: &modules,
            symbols: &symbols,
            module,
            target: &target,
            diag: &mut diag,
            maps: &mut maps,
        };
        relocate(&mut sequence, 0, &relocations, &mut ctx).unwrap();

        assert_eq!(sequence.bytes, vec![0xAA, 0x23, 0x00]);
        assert_eq!(sequence.offset_address, 0x0123);
    }
}
