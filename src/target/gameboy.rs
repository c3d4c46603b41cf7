use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use num_enum::TryFromPrimitive;

use crate::area::Address;
use crate::codeseq::CodeSequence;
use crate::error::{Diagnostics, LinkError};
use crate::mapfile::{MapEncoder, MapView, sorted_area_symbols};
use crate::output::{CodeEncoder, OutputEvent};
use crate::target::{Bank, BankingConfiguration, Target, TargetCli, UNDEFINED_BANK};

/// Size of one ROM bank.
const BANK_SIZE: u32 = 0x4000;
/// Address where overlayed ROM banks start.
const BANK_START_ADDRESS: u32 = 0x4000;
/// Last address in ROM.
const MAX_ROM_ADDRESS: u32 = 0x7FFF;

/// Fill value of unused cartridge bytes; `FF` puts less stress on an
/// EPROM or flash part.
const DEFAULT_CARTRIDGE_VALUE: u8 = 0xFF;

const MAX_TITLE_LENGTH: usize = 16;

const TITLE_ADDRESS: u32 = 0x0134;
const CARTRIDGE_TYPE_ADDRESS: u32 = 0x0147;
const ROM_SIZE_ADDRESS: u32 = 0x0148;
const RAM_SIZE_ADDRESS: u32 = 0x0149;
const HEADER_CHECKSUM_ADDRESS: u32 = 0x014D;
const GLOBAL_CHECKSUM_ADDRESS: u32 = 0x014E;

const CODE_AREA_PREFIX: &str = "_CODE";
const GENERIC_BANKED_AREA_NAME: &str = "_CODE_0";
const LENGTH_SYMBOL_PREFIX: &str = "l__";
const CODE_AREA_SYMBOL_PREFIX: &str = "s__CODE_";

const TRAMPOLINE_SIZE: u8 = 6;

/// Valid ROM bank counts of a cartridge header.
#[derive(Debug, Clone, Copy, TryFromPrimitive)]
#[repr(u16)]
enum RomBankCount {
    Banks2 = 2,
    Banks4 = 4,
    Banks8 = 8,
    Banks16 = 16,
    Banks32 = 32,
    Banks64 = 64,
    Banks128 = 128,
    Banks256 = 256,
    Banks512 = 512,
}

impl RomBankCount {
    fn code(self) -> u8 {
        match self {
            Self::Banks2 => 0,
            Self::Banks4 => 1,
            Self::Banks8 => 2,
            Self::Banks16 => 3,
            Self::Banks32 => 4,
            Self::Banks64 => 5,
            Self::Banks128 => 6,
            Self::Banks256 => 7,
            Self::Banks512 => 8,
        }
    }
}

/// Valid RAM bank counts of a cartridge header.
#[derive(Debug, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
enum RamBankCount {
    Banks0 = 0,
    Banks1 = 1,
    Banks4 = 4,
    Banks16 = 16,
}

impl RamBankCount {
    fn code(self) -> u8 {
        match self {
            Self::Banks0 => 0,
            Self::Banks1 => 2,
            Self::Banks4 => 3,
            Self::Banks16 => 4,
        }
    }
}

fn rom_count_code(count: u16) -> Option<u8> {
    RomBankCount::try_from(count).ok().map(RomBankCount::code)
}

fn ram_count_code(count: u8) -> Option<u8> {
    RamBankCount::try_from(count).ok().map(RamBankCount::code)
}

/// Cartridge image and header configuration, shared between the target
/// description and the raw-image encoder.
#[derive(Debug)]
struct CartridgeState {
    title: String,
    rom_bank_count: u16,
    ram_bank_count: u8,
    cartridge_type: u8,
    patches: Vec<(u16, u8)>,
    banks: Vec<Vec<u8>>,
}

impl CartridgeState {
    fn new() -> Self {
        Self {
            title: String::new(),
            rom_bank_count: 2,
            ram_bank_count: 0,
            cartridge_type: 0,
            patches: Vec::new(),
            banks: Vec::new(),
        }
    }

    fn cartridge_size(&self) -> u32 {
        u32::from(self.rom_bank_count) * BANK_SIZE
    }

    fn allocate(&mut self) {
        self.banks = (0..self.rom_bank_count)
            .map(|_| vec![DEFAULT_CARTRIDGE_VALUE; BANK_SIZE as usize])
            .collect();
    }

    fn byte(&self, address: u32) -> u8 {
        self.banks[(address / BANK_SIZE) as usize][(address % BANK_SIZE) as usize]
    }

    fn set_byte(&mut self, address: u32, value: u8) {
        self.banks[(address / BANK_SIZE) as usize][(address % BANK_SIZE) as usize] = value;
    }

    /// ASCII title as stored in the header: the trailing path component,
    /// upper-cased, cut at the extension dot.
    fn normalized_title(&self) -> Vec<u8> {
        let bytes = self.title.as_bytes();
        let mut start = bytes.len();
        while start > 0 {
            let ch = bytes[start - 1];
            if !ch.is_ascii_alphanumeric() && ch != b'.' {
                break;
            }
            start -= 1;
        }
        bytes[start..]
            .iter()
            .take_while(|&&ch| ch != b'.')
            .take(MAX_TITLE_LENGTH)
            .map(u8::to_ascii_uppercase)
            .collect()
    }

    /// Patches the cartridge header and both checksums.
    fn finalize(&mut self, diag: &mut Diagnostics) {
        let title = self.normalized_title();
        for (index, position) in (TITLE_ADDRESS..TITLE_ADDRESS + MAX_TITLE_LENGTH as u32).enumerate()
        {
            self.set_byte(position, title.get(index).copied().unwrap_or(0));
        }

        self.set_byte(CARTRIDGE_TYPE_ADDRESS, self.cartridge_type);

        let rom_code = rom_count_code(self.rom_bank_count).unwrap_or_else(|| {
            diag.warning(&format!(
                "unsupported number of ROM banks [{}]",
                self.rom_bank_count
            ));
            0xFF
        });
        self.set_byte(ROM_SIZE_ADDRESS, rom_code);

        let ram_code = ram_count_code(self.ram_bank_count).unwrap_or_else(|| {
            diag.warning(&format!(
                "unsupported number of RAM banks [{}]",
                self.ram_bank_count
            ));
            0xFF
        });
        self.set_byte(RAM_SIZE_ADDRESS, ram_code);

        let patches = self.patches.clone();
        for (address, value) in patches {
            self.set_byte(u32::from(address), value);
        }

        // header checksum over 0x0134..0x014C
        let mut checksum: u16 = 0;
        for position in TITLE_ADDRESS..HEADER_CHECKSUM_ADDRESS {
            checksum = checksum.wrapping_add(u16::from(self.byte(position)));
        }
        self.set_byte(
            HEADER_CHECKSUM_ADDRESS,
            0xE7u8.wrapping_sub((checksum & 0xFF) as u8),
        );

        // 16-bit global checksum over the whole image, excluding itself
        self.set_byte(GLOBAL_CHECKSUM_ADDRESS, 0);
        self.set_byte(GLOBAL_CHECKSUM_ADDRESS + 1, 0);
        let mut checksum: u16 = 0;
        for bank in &self.banks {
            for &byte in bank {
                checksum = checksum.wrapping_add(u16::from(byte));
            }
        }
        self.set_byte(GLOBAL_CHECKSUM_ADDRESS, (checksum >> 8) as u8);
        self.set_byte(GLOBAL_CHECKSUM_ADDRESS + 1, (checksum & 0xFF) as u8);
    }

    fn place_sequence(
        &mut self,
        sequence: &CodeSequence,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        if sequence.bytes.is_empty() {
            return Ok(());
        }

        let address = sequence.offset_address;
        let bank = sequence.rom_bank;
        if address > MAX_ROM_ADDRESS {
            return Err(LinkError::AddressOverflow {
                address,
                limit: MAX_ROM_ADDRESS,
            });
        }
        if bank >= Bank::from(self.rom_bank_count) {
            return Err(LinkError::BankOverflow {
                bank,
                last: Bank::from(self.rom_bank_count) - 1,
            });
        }
        if bank > 0 && address < BANK_START_ADDRESS {
            return Err(LinkError::AddressUnderflow {
                address,
                limit: BANK_START_ADDRESS,
            });
        }
        if self.rom_bank_count == 2 && bank > 0 {
            return Err(LinkError::NoBankSwitching);
        }

        let mut linear = address;
        if bank > 1 {
            linear += (bank as u32 - 1) * BANK_SIZE;
        }
        for &value in &sequence.bytes {
            if linear >= self.cartridge_size() {
                return Err(LinkError::CartridgeOverflow {
                    address: linear,
                    size: self.cartridge_size(),
                });
            }
            let previous = self.byte(linear);
            self.set_byte(linear, value);
            if previous != DEFAULT_CARTRIDGE_VALUE {
                diag.warning(&format!(
                    "possibly wrote twice at addr {linear:x} ({previous:02X}->{value:02X})"
                ));
            }
            linear += 1;
        }
        Ok(())
    }
}

/// Little-endian hex byte pair of a word, for synthesized object text.
fn address_bytes(value: u16) -> String {
    format!("{:02X} {:02X}", value & 0xFF, value >> 8)
}

/// Bank encoded after the last underscore of an area or auto-symbol name
/// (at most two decimal digits).
fn bank_from_name(name: &str) -> Bank {
    let Some(position) = name.rfind('_') else {
        return 0;
    };
    let digits: String = name[position + 1..].chars().take(2).collect();
    digits.parse().unwrap_or(0)
}

/// Target description for the Gameboy's LR35902.
pub struct GameboyTarget {
    state: Rc<RefCell<CartridgeState>>,
}

impl GameboyTarget {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(CartridgeState::new())),
        }
    }

    fn parse_auto_radix(text: &str) -> Option<i64> {
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16).ok()
        } else if text.len() > 1 && text.starts_with('0') {
            i64::from_str_radix(&text[1..], 8).ok()
        } else {
            text.parse().ok()
        }
    }

    fn handle_y_option(&mut self, argument: &str, cli: &mut TargetCli<'_>) -> Result<(), LinkError> {
        let option_char = argument
            .as_bytes()
            .get(2)
            .copied()
            .unwrap_or(0)
            .to_ascii_uppercase();
        let value_text = argument.get(3..).unwrap_or("");
        let mut state = self.state.borrow_mut();

        match option_char {
            b'J' => {
                drop(state);
                cli.maps.register(
                    ".sym",
                    Box::new(NoGmbMapEncoder::default()),
                    cli.diag,
                )?;
            }
            b'O' => {
                let value = value_text.parse::<u16>().unwrap_or(0);
                if rom_count_code(value).is_none() {
                    cli.diag
                        .warning(&format!("unsupported number of ROM banks [{value}]"));
                }
                state.rom_bank_count = value;
            }
            b'A' => {
                let value = value_text.parse::<u8>().unwrap_or(0);
                if ram_count_code(value).is_none() {
                    cli.diag
                        .warning(&format!("unsupported number of RAM banks [{value}]"));
                }
                state.ram_bank_count = value;
            }
            b'T' => {
                state.cartridge_type = value_text.parse::<u8>().unwrap_or(0);
            }
            b'N' => {
                let name = value_text
                    .strip_prefix("=\"")
                    .and_then(|rest| rest.split('"').next())
                    .ok_or_else(|| LinkError::BadTargetOption(argument.to_string()))?;
                state.title = name.chars().take(MAX_TITLE_LENGTH).collect();
            }
            b'P' => {
                let (address_text, value_part) = value_text
                    .split_once('=')
                    .ok_or_else(|| LinkError::BadTargetOption(argument.to_string()))?;
                let address = Self::parse_auto_radix(address_text)
                    .ok_or_else(|| LinkError::BadTargetOption(argument.to_string()))?;
                let value = Self::parse_auto_radix(value_part)
                    .ok_or_else(|| LinkError::BadTargetOption(argument.to_string()))?;
                state.patches.push((address as u16, value as u8));
            }
            _ => return Err(LinkError::BadTargetOption(argument.to_string())),
        }
        Ok(())
    }
}

impl Default for GameboyTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl Target for GameboyTarget {
    fn is_big_endian(&self) -> bool {
        false
    }

    fn is_case_sensitive(&self) -> bool {
        true
    }

    fn bank_from_segment_name(&self, segment_name: &str) -> Bank {
        // banked segments carry a trailing underscore and digit
        let Some(position) = segment_name.rfind('_') else {
            return 0;
        };
        match segment_name[position + 1..].chars().next() {
            Some(digit) if digit.is_ascii_digit() => Bank::from(digit as u8 - b'0'),
            _ => 0,
        }
    }

    fn code_byte(&self, bank: Bank, address: Address) -> u8 {
        let state = self.state.borrow();
        let Ok(bank) = usize::try_from(bank) else {
            return DEFAULT_CARTRIDGE_VALUE;
        };
        match state.banks.get(bank) {
            Some(data) => data[usize::from(address) % BANK_SIZE as usize],
            None => DEFAULT_CARTRIDGE_VALUE,
        }
    }

    fn usage_info(&self) -> String {
        concat!(
            "Platform Gameboy:\n",
            "  -yj  no$gmb symbol file generated as file[SYM]\n",
            "  -yo  Number of ROM banks (default: 2)\n",
            "  -ya  Number of RAM banks (default: 0)\n",
            "  -yt  MBC type (default: no MBC)\n",
            "  -yn  Name of program (default: name of output file)\n",
            "  -yp# Patch one byte in the output GB file (# is: addr=byte)\n",
            "  -z   Gameboy image as file[GB]\n",
        )
        .to_string()
    }

    fn handle_command_line(&mut self, cli: &mut TargetCli<'_>) -> Result<(), LinkError> {
        cli.tables
            .base_address_list
            .push("_CODE=0x0200".to_string());
        cli.tables
            .base_address_list
            .push("_DATA=0xC0A0".to_string());
        // the OAM transfer routine must start at a multiple of 0x100
        for global in [
            ".OAM=0xC000",
            ".STACK=0xE000",
            ".refresh_OAM=0xFF80",
            ".init=0x0000",
        ] {
            cli.tables.global_def_list.push(global.to_string());
        }

        for index in 0..cli.arguments.len() {
            let argument = cli.arguments[index].clone();
            let first = argument.chars().next().unwrap_or(' ');

            if self.state.borrow().title.is_empty() && (first.is_ascii_alphanumeric() || first == '_')
            {
                // the first link file name doubles as the default title
                self.state.borrow_mut().title =
                    argument.chars().take(MAX_TITLE_LENGTH - 1).collect();
                continue;
            }
            if cli.handled[index] || first != '-' {
                continue;
            }

            match argument
                .as_bytes()
                .get(1)
                .copied()
                .unwrap_or(0)
                .to_ascii_uppercase()
            {
                b'Z' => {
                    cli.handled[index] = true;
                    let path = format!("{}.gb", cli.stem);
                    cli.outputs.create_file(
                        &path,
                        Box::new(GameboyImageEncoder {
                            state: Rc::clone(&self.state),
                        }),
                        cli.diag,
                    )?;
                }
                b'Y' => {
                    cli.handled[index] = true;
                    self.handle_y_option(&argument, cli)?;
                }
                _ => {}
            }
        }

        let mut state = self.state.borrow_mut();
        state.allocate();
        for bank in 1..state.rom_bank_count {
            cli.tables
                .base_address_list
                .push(format!("_CODE_{bank}=0x4000"));
        }
        for bank in 0..state.ram_bank_count {
            cli.tables
                .base_address_list
                .push(format!("_DATA_{bank}=0xA000"));
        }
        Ok(())
    }

    fn banking(&self) -> Option<&dyn BankingConfiguration> {
        Some(self)
    }
}

impl BankingConfiguration for GameboyTarget {
    fn generic_banked_area_name(&self) -> &str {
        GENERIC_BANKED_AREA_NAME
    }

    fn nonbanked_area_name(&self) -> &str {
        CODE_AREA_PREFIX
    }

    fn banked_area_name(&self, bank: Bank) -> String {
        if bank == UNDEFINED_BANK {
            CODE_AREA_PREFIX.to_string()
        } else {
            format!("{CODE_AREA_PREFIX}_{bank:X}")
        }
    }

    fn jump_label(&self, bank: Bank) -> String {
        format!("Banking__switchTo{bank:X}")
    }

    fn surrogate_name(&self, symbol: &str) -> String {
        format!("_BC{symbol}")
    }

    fn is_valid_call_target(&self, _module: &str, segment: &str, _symbol: &str) -> bool {
        segment.starts_with(CODE_AREA_PREFIX)
    }

    fn trampoline_size(&self) -> u8 {
        TRAMPOLINE_SIZE
    }

    /// A call to routine `XYZ` in bank 23 becomes
    /// `BC_XYZ: LD BC,#XYZ` / `JP Banking__switchTo23`.
    fn trampoline_code(
        &self,
        start_address: Address,
        area_index: u16,
        target_symbol_index: u16,
        jump_symbol_index: u16,
    ) -> String {
        let mut text = String::new();
        text.push_str("T ");
        text.push_str(&address_bytes(start_address));
        text.push_str(" 01 00 00 C3 00 00\n");

        text.push_str("R ");
        text.push_str(&address_bytes(0));
        text.push(' ');
        text.push_str(&address_bytes(area_index));
        // LD BC operand at T-line index 3, JP operand at index 6
        text.push_str(" 02 03 ");
        text.push_str(&address_bytes(target_symbol_index));
        text.push_str(" 02 06 ");
        text.push_str(&address_bytes(jump_symbol_index));
        text.push('\n');
        text
    }
}

/// Raw banked cartridge image (`.gb`).
struct GameboyImageEncoder {
    state: Rc<RefCell<CartridgeState>>,
}

impl CodeEncoder for GameboyImageEncoder {
    fn emit(
        &mut self,
        out: &mut dyn Write,
        event: OutputEvent<'_>,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        match event {
            OutputEvent::Begin => Ok(()),
            OutputEvent::Code(sequence) => self.state.borrow_mut().place_sequence(sequence, diag),
            OutputEvent::End => {
                let mut state = self.state.borrow_mut();
                state.finalize(diag);
                for bank in &state.banks {
                    out.write_all(bank)?;
                }
                Ok(())
            }
        }
    }
}

/// no$gmb symbol file (`.sym`): `bank:address name` lines grouped by
/// area, banked addresses masked into the switchable window.
#[derive(Debug, Default)]
pub struct NoGmbMapEncoder;

impl MapEncoder for NoGmbMapEncoder {
    fn generate(&mut self, out: &mut dyn Write, view: &MapView<'_>) -> Result<(), LinkError> {
        writeln!(out, "; no$gmb format .sym file")?;
        writeln!(out, "; Generated automagically by ASxxxx linker")?;

        for area_id in view.areas.area_ids() {
            let area_name = view.areas.area(area_id).name.clone();
            writeln!(out, "; Area: {area_name}")?;

            let current_bank = if area_name.starts_with(CODE_AREA_PREFIX) {
                bank_from_name(&area_name)
            } else {
                0
            };

            for symbol_id in sorted_area_symbols(view.areas, view.symbols, area_id) {
                let name = view.symbols.get(symbol_id).name.clone();
                if name.starts_with(LENGTH_SYMBOL_PREFIX) {
                    continue;
                }
                let bank = if name.starts_with(CODE_AREA_SYMBOL_PREFIX) {
                    bank_from_name(&name)
                } else {
                    current_bank
                };
                let mut address = view.symbols.absolute_address(symbol_id, view.areas);
                if current_bank > 0 {
                    address &= 0x7FFF;
                }
                writeln!(out, "{bank:02X}:{address:04X} {name}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_count_codes() {
        assert_eq!(rom_count_code(2), Some(0));
        assert_eq!(rom_count_code(32), Some(4));
        assert_eq!(rom_count_code(512), Some(8));
        assert_eq!(rom_count_code(3), None);
        assert_eq!(ram_count_code(0), Some(0));
        assert_eq!(ram_count_code(1), Some(2));
        assert_eq!(ram_count_code(16), Some(4));
        assert_eq!(ram_count_code(2), None);
    }

    #[test]
    fn segment_name_bank_detection() {
        let target = GameboyTarget::new();
        assert_eq!(target.bank_from_segment_name("_CODE_3"), 3);
        assert_eq!(target.bank_from_segment_name("_CODE"), 0);
        assert_eq!(target.bank_from_segment_name("_DATA_0"), 0);
        assert_eq!(target.bank_from_segment_name("PLAIN"), 0);
    }

    #[test]
    fn trampoline_object_text() {
        let target = GameboyTarget::new();
        let text = target.trampoline_code(6, 0, 2, 0);
        assert_eq!(
            text,
            "T 06 00 01 00 00 C3 00 00\nR 00 00 00 00 02 03 02 00 02 06 00 00\n"
        );
    }

    #[test]
    fn title_normalization() {
        let mut state = CartridgeState::new();
        state.title = "demos/game.o".to_string();
        assert_eq!(state.normalized_title(), b"GAME".to_vec());

        state.title = "averylongcartridgename".to_string();
        assert_eq!(state.normalized_title().len(), MAX_TITLE_LENGTH);
    }

    #[test]
    fn header_checksum_formula() {
        let mut state = CartridgeState::new();
        state.title = "T".to_string();
        state.allocate();
        let mut diag = Diagnostics::new();
        state.finalize(&mut diag);

        let mut sum: u16 = 0;
        for address in TITLE_ADDRESS..HEADER_CHECKSUM_ADDRESS {
            sum = sum.wrapping_add(u16::from(state.byte(address)));
        }
        assert_eq!(
            state.byte(HEADER_CHECKSUM_ADDRESS),
            0xE7u8.wrapping_sub((sum & 0xFF) as u8)
        );
        // ROM and RAM size codes for the default 2/0 configuration
        assert_eq!(state.byte(ROM_SIZE_ADDRESS), 0);
        assert_eq!(state.byte(RAM_SIZE_ADDRESS), 0);
    }

    #[test]
    fn global_checksum_excludes_itself() {
        let mut state = CartridgeState::new();
        state.allocate();
        let mut diag = Diagnostics::new();
        state.finalize(&mut diag);

        let stored = u16::from(state.byte(GLOBAL_CHECKSUM_ADDRESS)) << 8
            | u16::from(state.byte(GLOBAL_CHECKSUM_ADDRESS + 1));
        state.set_byte(GLOBAL_CHECKSUM_ADDRESS, 0);
        state.set_byte(GLOBAL_CHECKSUM_ADDRESS + 1, 0);
        let mut sum: u16 = 0;
        for bank in &state.banks {
            for &byte in bank {
                sum = sum.wrapping_add(u16::from(byte));
            }
        }
        assert_eq!(stored, sum);
    }

    #[test]
    fn sequence_placement_checks() {
        let mut state = CartridgeState::new();
        state.rom_bank_count = 4;
        state.allocate();
        let mut diag = Diagnostics::new();

        let sequence = CodeSequence {
            segment: None,
            rom_bank: 2,
            offset_address: 0x4000,
            bytes: vec![0xAA, 0xBB],
        };
        state.place_sequence(&sequence, &mut diag).unwrap();
        assert_eq!(state.byte(0x8000), 0xAA);
        assert_eq!(state.byte(0x8001), 0xBB);

        let bad_bank = CodeSequence {
            rom_bank: 9,
            ..sequence.clone()
        };
        assert!(matches!(
            state.place_sequence(&bad_bank, &mut diag),
            Err(LinkError::BankOverflow { .. })
        ));

        let underflow = CodeSequence {
            offset_address: 0x2000,
            ..sequence.clone()
        };
        assert!(matches!(
            state.place_sequence(&underflow, &mut diag),
            Err(LinkError::AddressUnderflow { .. })
        ));

        let overflow = CodeSequence {
            rom_bank: 0,
            offset_address: 0x9000,
            bytes: vec![0x00],
            segment: None,
        };
        assert!(matches!(
            state.place_sequence(&overflow, &mut diag),
            Err(LinkError::AddressOverflow { .. })
        ));
    }
}
