use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};

use log::{debug, trace};
use num_enum::TryFromPrimitive;

use crate::banking;
use crate::codeseq::{self, CodeSequence, Relocation, RelocationKind, RelocationList, RelocContext};
use crate::error::{Diagnostics, LinkError};
use crate::link::Link;
use crate::scanner::{self, CharSource, Scanner, Token, TokenKind};
use crate::symbol;

/// Character separating a file name from an embedded byte offset
/// (`archive.lib@1234`).
pub const OFFSET_SEPARATOR: char = '@';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

/// Per-file parse options; reset to the defaults at every file boundary.
#[derive(Debug, Clone, Copy)]
pub struct ParserOptions {
    pub default_base: u32,
    pub endianness: Option<Endianness>,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            default_base: 10,
            endianness: None,
        }
    }
}

/// First character of a line's leading identifier selects the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandLetter {
    RadixHex = b'X',
    RadixDecimal = b'D',
    RadixOctal = b'Q',
    Header = b'H',
    ModuleName = b'M',
    Area = b'A',
    Symbol = b'S',
    Text = b'T',
    Relocation = b'R',
    Paging = b'P',
    CompilerOptions = b'O',
}

/// Strips a trailing `@<decimal>` offset from a file name.
#[must_use]
pub fn split_offset(name: &str) -> (&str, u64) {
    if let Some(position) = name.rfind(OFFSET_SEPARATOR) {
        if position > 0 {
            let digits = &name[position + 1..];
            if !digits.is_empty() && digits.bytes().all(|ch| ch.is_ascii_digit()) {
                return (&name[..position], digits.parse().unwrap_or(0));
            }
        }
    }
    (name, 0)
}

/// Evaluates a numeric literal: a `0`-introduced radix prefix
/// (`@`/`o`/`q` octal, `x`/`h` hex) wins, otherwise `default_base` is in
/// force. Parses the longest valid digit prefix and fails only when no
/// digit is consumed at all.
#[must_use]
pub fn evaluate_number(text: &str, default_base: u32) -> Option<i64> {
    let bytes = text.as_bytes();
    let (digits, base) = if bytes.len() >= 2 && bytes[0] == b'0' {
        match bytes[1].to_ascii_uppercase() {
            b'@' | b'O' | b'Q' => (&text[2..], 8),
            b'X' | b'H' => (&text[2..], 16),
            _ => (text, default_base),
        }
    } else {
        (text, default_base)
    };

    let mut value: i64 = 0;
    let mut digit_count = 0;
    for ch in digits.chars() {
        let Some(digit) = ch.to_digit(base) else {
            break;
        };
        value = value
            .wrapping_mul(i64::from(base))
            .wrapping_add(i64::from(digit));
        digit_count += 1;
    }
    (digit_count > 0).then_some(value)
}

/// Parses a `name=value` line; values default to base 16.
#[must_use]
pub fn parse_value_map_line(line: &str) -> Option<(String, i64)> {
    let tokens = scanner::tokenize_line(line).ok()?;
    match tokens.as_slice() {
        [name, equals, value]
            if name.is_identifier()
                && equals.kind == TokenKind::Operator
                && equals.operator == Some(scanner::Operator::Assign)
                && value.is_number() =>
        {
            Some((name.text.clone(), evaluate_number(&value.text, 16)?))
        }
        _ => None,
    }
}

/// Applies every `name=value` line in `lines` through `apply`, warning on
/// malformed lines.
pub fn set_mapping_from_list(
    lines: &[String],
    diag: &mut Diagnostics,
    mut apply: impl FnMut(&str, i64),
) {
    for line in lines {
        match parse_value_map_line(line) {
            Some((name, value)) => apply(&name, value),
            None => diag.warning(&format!("bad definition: {line}")),
        }
    }
}

/// Character source walking an ordered list of input files, transparently
/// advancing across file boundaries. Names may address in-memory virtual
/// files or carry an `@offset` suffix.
pub struct FileSequence {
    names: Vec<String>,
    virtual_files: HashMap<String, String>,
    next_index: usize,
    input: Option<Box<dyn BufRead>>,
    current_name: String,
    current_line: String,
    column: usize,
    need_line: bool,
    line_index: u32,
    boundary_pending: bool,
}

impl FileSequence {
    #[must_use]
    pub fn new(names: Vec<String>, virtual_files: HashMap<String, String>) -> Self {
        Self {
            names,
            virtual_files,
            next_index: 0,
            input: None,
            current_name: String::new(),
            current_line: String::new(),
            column: 0,
            need_line: true,
            line_index: 0,
            boundary_pending: false,
        }
    }

    #[must_use]
    pub fn current_name(&self) -> &str {
        &self.current_name
    }

    #[must_use]
    pub fn current_line(&self) -> &str {
        &self.current_line
    }

    #[must_use]
    pub fn line_index(&self) -> u32 {
        self.line_index
    }

    #[must_use]
    pub fn column(&self) -> usize {
        self.column
    }

    /// True once after each file boundary; the parser resets its options.
    pub fn take_boundary(&mut self) -> bool {
        std::mem::take(&mut self.boundary_pending)
    }

    fn open_next(&mut self) -> Result<(), LinkError> {
        let name = self.names[self.next_index].clone();
        self.next_index += 1;

        let reader: Box<dyn BufRead> = if let Some(contents) = self.virtual_files.get(&name) {
            Box::new(std::io::Cursor::new(contents.clone().into_bytes()))
        } else {
            let (path, offset) = split_offset(&name);
            let mut file = File::open(path).map_err(|source| LinkError::FileOpen {
                path: name.clone(),
                source,
            })?;
            if offset > 0 {
                file.seek(SeekFrom::Start(offset))?;
            }
            Box::new(BufReader::new(file))
        };

        debug!("reading link input {name}");
        self.input = Some(reader);
        self.current_name = name;
        self.current_line.clear();
        self.column = 0;
        self.need_line = true;
        self.line_index = 0;
        self.boundary_pending = true;
        Ok(())
    }
}

impl CharSource for FileSequence {
    fn next_char(&mut self) -> Result<Option<u8>, LinkError> {
        loop {
            if let Some(input) = self.input.as_mut() {
                if !self.need_line {
                    let bytes = self.current_line.as_bytes();
                    if self.column < bytes.len() {
                        let ch = bytes[self.column];
                        self.column += 1;
                        return Ok(Some(ch));
                    }
                    if self.column == bytes.len() {
                        self.column += 1;
                        return Ok(Some(b'\n'));
                    }
                    self.need_line = true;
                }
                let mut line = String::new();
                if input.read_line(&mut line)? == 0 {
                    self.input = None;
                    continue;
                }
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                self.current_line = line;
                self.column = 0;
                self.need_line = false;
                self.line_index += 1;
            } else if self.next_index < self.names.len() {
                self.open_next()?;
            } else {
                return Ok(None);
            }
        }
    }
}

/// One pass of the parser over a list of object files.
struct ParseRun<'a> {
    link: &'a mut Link,
    first_pass: bool,
    scanner: Scanner<FileSequence>,
    options: ParserOptions,
    staged: CodeSequence,
}

/// Parses `files` and populates (pass 1) or relocates and emits (pass 2)
/// the link graph.
pub fn parse_object_files(
    link: &mut Link,
    first_pass: bool,
    files: &[String],
) -> Result<(), LinkError> {
    let defaults = link.parser_defaults;
    let sequence = FileSequence::new(files.to_vec(), link.virtual_files.clone());
    let mut run = ParseRun {
        link,
        first_pass,
        scanner: Scanner::new(sequence),
        options: defaults,
        staged: CodeSequence::default(),
    };
    run.run()
}

pub fn parse_object_file(link: &mut Link, first_pass: bool, file: &str) -> Result<(), LinkError> {
    parse_object_files(link, first_pass, &[file.to_string()])
}

impl ParseRun<'_> {
    fn run(&mut self) -> Result<(), LinkError> {
        loop {
            let token = self.scanner.next_token()?;
            if self.scanner.source_mut().take_boundary() {
                self.options = self.link.parser_defaults;
            }

            match token.kind {
                TokenKind::StreamEnd => return Ok(()),
                TokenKind::Newline => continue,
                TokenKind::Comment => {
                    if self.first_pass {
                        let line = self.scanner.source().current_line().to_string();
                        self.link.maps.write_special_comment(&line);
                    }
                    self.skip_to_newline()?;
                }
                TokenKind::Identifier | TokenKind::IdOrNumber if !token.text.is_empty() => {
                    let letter = token.text.as_bytes()[0];
                    match CommandLetter::try_from(letter) {
                        Ok(CommandLetter::RadixHex)
                        | Ok(CommandLetter::RadixDecimal)
                        | Ok(CommandLetter::RadixOctal) => self.handle_radix(&token.text)?,
                        Ok(CommandLetter::Header) => self.handle_header()?,
                        Ok(CommandLetter::ModuleName) => self.handle_module()?,
                        Ok(CommandLetter::Area) => self.handle_area()?,
                        Ok(CommandLetter::Symbol) => self.handle_symbol()?,
                        Ok(CommandLetter::Text) => self.handle_text()?,
                        Ok(CommandLetter::Relocation) => self.handle_relocation(false)?,
                        Ok(CommandLetter::Paging) => self.handle_relocation(true)?,
                        Ok(CommandLetter::CompilerOptions) => self.handle_compiler_options()?,
                        Err(_) => {
                            self.warn_here("bad command");
                            self.skip_to_newline()?;
                        }
                    }
                }
                _ => {
                    self.warn_here("bad command");
                    self.skip_to_newline()?;
                }
            }
        }
    }

    fn make_word(&self, part_a: u8, part_b: u8) -> u16 {
        let big_endian = match self.options.endianness {
            Some(Endianness::Big) => true,
            Some(Endianness::Little) => false,
            None => self.link.target.is_big_endian(),
        };
        if big_endian {
            u16::from(part_a) << 8 | u16::from(part_b)
        } else {
            u16::from(part_b) << 8 | u16::from(part_a)
        }
    }

    fn evaluate(&mut self, text: &str) -> i64 {
        match evaluate_number(text, self.options.default_base) {
            Some(value) => value,
            None => {
                self.warn_here("number expected");
                0
            }
        }
    }

    /// Writes the current input position to stderr, splitting the line at
    /// the error column.
    fn mark_error(&mut self) {
        let source = self.scanner.source();
        let line = source.current_line();
        let split = source.column().min(line.len());
        let lead_in = format!(
            "{}({}): {}",
            source.current_name(),
            source.line_index(),
            &line[..split]
        );
        eprintln!("{lead_in}");
        eprintln!("{}{}", " ".repeat(lead_in.len()), &line[split..]);
    }

    fn warn_here(&mut self, message: &str) {
        self.link.diag.warning(message);
        self.mark_error();
    }

    fn skip_to_newline(&mut self) -> Result<(), LinkError> {
        loop {
            let token = self.scanner.next_token()?;
            if matches!(token.kind, TokenKind::Newline | TokenKind::StreamEnd) {
                return Ok(());
            }
        }
    }

    /// Reads the next token and verifies it with `accept`; on mismatch,
    /// warns and skips the rest of the line.
    fn expect(
        &mut self,
        accept: fn(&Token) -> bool,
        what: &str,
    ) -> Result<Option<Token>, LinkError> {
        let token = self.scanner.next_token()?;
        if accept(&token) {
            Ok(Some(token))
        } else {
            self.warn_here(&format!("unexpected token kind, {what} expected"));
            if token.kind != TokenKind::Newline {
                self.skip_to_newline()?;
            }
            Ok(None)
        }
    }

    fn expect_identifier(&mut self) -> Result<Option<Token>, LinkError> {
        self.expect(Token::is_identifier, "identifier")
    }

    fn expect_number(&mut self) -> Result<Option<Token>, LinkError> {
        self.expect(Token::is_number, "number")
    }

    fn expect_newline(&mut self) -> Result<bool, LinkError> {
        Ok(self
            .expect(|token| token.kind == TokenKind::Newline, "newline")?
            .is_some())
    }

    /// `X`/`D`/`Q` select the default radix; an optional `H`/`L` second
    /// character overrides the endianness of the file.
    fn handle_radix(&mut self, command: &str) -> Result<(), LinkError> {
        if !self.expect_newline()? {
            return Ok(());
        }
        let bytes = command.as_bytes();
        self.options.default_base = match bytes[0] {
            b'X' => 16,
            b'D' => 10,
            _ => 8,
        };
        if bytes.len() > 1 {
            match bytes[1] {
                b'H' => self.options.endianness = Some(Endianness::Big),
                b'L' => self.options.endianness = Some(Endianness::Little),
                _ => {}
            }
        }
        trace!(
            "radix {} endianness {:?}",
            self.options.default_base, self.options.endianness
        );
        Ok(())
    }

    /// `H <n> areas <m> global symbols`
    fn handle_header(&mut self) -> Result<(), LinkError> {
        if !self.first_pass {
            let file_name = self.scanner.source().current_name().to_string();
            if !self.link.modules.set_current_by_file_name(&file_name) {
                self.warn_here("unknown module for file");
                self.skip_to_newline()?;
                return Ok(());
            }
        }

        let Some(segment_count) = self.expect_number()? else {
            return Ok(());
        };
        if self.expect_identifier()?.is_none() {
            return Ok(());
        }
        let Some(symbol_count) = self.expect_number()? else {
            return Ok(());
        };
        if self.expect_identifier()?.is_none() || self.expect_identifier()?.is_none() {
            return Ok(());
        }
        if !self.expect_newline()? {
            return Ok(());
        }

        if self.first_pass {
            let segment_count = self.evaluate(&segment_count.text) as u16;
            let symbol_count = self.evaluate(&symbol_count.text) as u16;
            let file_name = self.scanner.source().current_name().to_string();
            let module = self
                .link
                .modules
                .make(&file_name, segment_count, symbol_count);
            self.link.modules.add_segment(
                module,
                self.link
                    .areas
                    .make_absolute_segment(module, &mut self.link.diag),
            );
        }
        Ok(())
    }

    /// `M <name>`
    fn handle_module(&mut self) -> Result<(), LinkError> {
        let Some(name) = self.expect_identifier()? else {
            return Ok(());
        };
        if !self.expect_newline()? {
            return Ok(());
        }
        if self.first_pass {
            self.link.modules.set_name(&name.text);
        } else if !self.link.modules.set_current_by_name(&name.text) {
            self.warn_here(&format!("unknown module {}", name.text));
        }
        Ok(())
    }

    /// `A <name> size <n> flags <f>`
    fn handle_area(&mut self) -> Result<(), LinkError> {
        let Some(name) = self.expect_identifier()? else {
            return Ok(());
        };
        if self.expect_identifier()?.is_none() {
            return Ok(());
        }
        let Some(size) = self.expect_number()? else {
            return Ok(());
        };
        if self.expect_identifier()?.is_none() {
            return Ok(());
        }
        let Some(flags) = self.expect_number()? else {
            return Ok(());
        };
        if !self.expect_newline()? {
            return Ok(());
        }

        let module = self.link.modules.current().ok_or(LinkError::NoModuleHeader)?;
        if self.first_pass {
            let total_size = self.evaluate(&size.text) as u16;
            let encoding = self.evaluate(&flags.text) as u8;
            let attributes = crate::area::AreaAttributes::from_encoding(encoding);
            let segment = self.link.areas.make_segment(
                &name.text,
                total_size,
                attributes,
                module,
                &mut self.link.diag,
            );
            self.link.modules.add_segment(module, segment);
        } else {
            let area_name = banking::adapt_area_name(
                self.link.target.as_ref(),
                &self.link.banking,
                &self.link.modules,
                module,
                &name.text,
            );
            match self
                .link
                .modules
                .segment_by_name(module, &self.link.areas, &area_name)
            {
                Some(segment) => self.link.areas.current_segment = Some(segment),
                None => self.warn_here(&format!("unknown segment {area_name}")),
            }
        }
        Ok(())
    }

    /// `S <name> Def<addr>` or `S <name> Ref<addr>`
    fn handle_symbol(&mut self) -> Result<(), LinkError> {
        let Some(name) = self.expect_identifier()? else {
            return Ok(());
        };
        let Some(flags) = self.expect_identifier()? else {
            return Ok(());
        };

        if self.first_pass {
            let kind_char = flags.text.as_bytes().first().copied().unwrap_or(0);
            if (kind_char != b'D' && kind_char != b'R') || flags.text.len() < 4 {
                self.warn_here("bad symbol flags");
                self.skip_to_newline()?;
                return Ok(());
            }
            let address = self.evaluate(&flags.text[3..]) as u16;
            if !self.expect_newline()? {
                return Ok(());
            }
            symbol::make_symbol(
                &mut self.link.symbols,
                &mut self.link.areas,
                &mut self.link.modules,
                &mut self.link.diag,
                &name.text,
                kind_char == b'D',
                address,
            );
        } else if !self.expect_newline()? {
            return Ok(());
        }
        Ok(())
    }

    /// `T <addr lo> <addr hi> <byte>…`
    fn handle_text(&mut self) -> Result<(), LinkError> {
        let Some(part_a) = self.expect_number()? else {
            return Ok(());
        };
        let Some(part_b) = self.expect_number()? else {
            return Ok(());
        };
        let address_a = self.evaluate(&part_a.text) as u8;
        let address_b = self.evaluate(&part_b.text) as u8;

        if !self.first_pass {
            self.staged.bytes.clear();
        }

        loop {
            let token = self.scanner.next_token()?;
            match token.kind {
                TokenKind::Newline => {
                    if !self.first_pass {
                        self.staged.segment = self.link.areas.current_segment;
                        self.staged.offset_address =
                            u32::from(self.make_word(address_a, address_b));
                        // stored for the subsequent relocation line
                    }
                    return Ok(());
                }
                _ if token.is_number() => {
                    if !self.first_pass {
                        if self.staged.bytes.len() == codeseq::MAX_SEQUENCE_LENGTH {
                            self.warn_here("line too long; remainder skipped");
                            self.skip_to_newline()?;
                            return Ok(());
                        }
                        let byte = self.evaluate(&token.text) as u8;
                        self.staged.bytes.push(byte);
                    }
                }
                _ => {
                    self.warn_here("unexpected token kind, number expected");
                    if token.kind != TokenKind::StreamEnd {
                        self.skip_to_newline()?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// `R 00 00 <idx lo> <idx hi> {mode,index,lo,hi}…`; a `P` line shares
    /// the grammar but is reserved and parsed without effect.
    fn handle_relocation(&mut self, is_paging: bool) -> Result<(), LinkError> {
        let mut words = [0u16; 2];
        for word in &mut words {
            let Some(part_a) = self.expect_number()? else {
                return Ok(());
            };
            let Some(part_b) = self.expect_number()? else {
                return Ok(());
            };
            let part_a = self.evaluate(&part_a.text) as u8;
            let part_b = self.evaluate(&part_b.text) as u8;
            *word = self.make_word(part_a, part_b);
        }
        let [area_mode, area_index] = words;

        let mut relocations = RelocationList::default();
        if !self.first_pass {
            let module = self.link.modules.current().ok_or(LinkError::NoModuleHeader)?;
            // skip the implicit absolute segment at position 0
            relocations.segment = self
                .link
                .modules
                .segment_by_index(module, usize::from(area_index) + 1);
        }

        loop {
            let token = self.scanner.next_token()?;
            match token.kind {
                TokenKind::Newline => break,
                _ if token.is_number() => {
                    let kind_byte = self.evaluate(&token.text) as u8;
                    let Some(index) = self.expect_number()? else {
                        return Ok(());
                    };
                    let Some(value_a) = self.expect_number()? else {
                        return Ok(());
                    };
                    let Some(value_b) = self.expect_number()? else {
                        return Ok(());
                    };
                    if !self.first_pass {
                        let index = self.evaluate(&index.text) as u8;
                        let value_a = self.evaluate(&value_a.text) as u8;
                        let value_b = self.evaluate(&value_b.text) as u8;
                        relocations.list.push(Relocation {
                            kind: RelocationKind::from_encoding(kind_byte),
                            // the T line starts with two address bytes that
                            // are not part of the emitted code
                            index: index.wrapping_sub(2),
                            value: self.make_word(value_a, value_b),
                        });
                    }
                }
                _ => {
                    self.warn_here("unexpected token kind, number expected");
                    if token.kind != TokenKind::StreamEnd {
                        self.skip_to_newline()?;
                    }
                    return Ok(());
                }
            }
        }

        if self.first_pass || is_paging {
            return Ok(());
        }

        let module = self.link.modules.current().ok_or(LinkError::NoModuleHeader)?;
        let mut sequence = std::mem::take(&mut self.staged);
        {
            let Link {
                areas,
                modules,
                symbols,
                target,
                diag,
                maps,
                ..
            } = &mut *self.link;
            let mut ctx = RelocContext {
                areas,
                modules,
                symbols,
                module,
                target: target.as_ref(),
                diag,
                maps,
            };
            codeseq::relocate(&mut sequence, area_mode, &relocations, &mut ctx)?;
        }
        self.link
            .outputs
            .write_sequence(&sequence, &mut self.link.diag)?;
        self.staged = sequence;
        Ok(())
    }

    /// `O <compiler options>`: the first line seen is kept; later differing
    /// lines warn with both module names.
    fn handle_compiler_options(&mut self) -> Result<(), LinkError> {
        let mut line = String::new();
        loop {
            let token = self.scanner.next_token()?;
            match token.kind {
                TokenKind::Newline => break,
                TokenKind::StreamEnd => return Ok(()),
                _ => {
                    if self.first_pass {
                        line.push(' ');
                        line.push_str(&token.text);
                    }
                }
            }
        }

        if self.first_pass {
            let module_name = self
                .link
                .modules
                .current()
                .map(|id| self.link.modules.get(id).name.clone())
                .unwrap_or_default();
            match &self.link.compiler_options {
                None => self.link.compiler_options = Some((module_name, line)),
                Some((first_module, first_line)) => {
                    if *first_line != line {
                        let message = format!(
                            "conflicting compiler options:\n   \"{first_line}\" in module \"{first_module}\" and\n   \"{line}\" in module \"{module_name}\".",
                        );
                        self.warn_here(&message);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Lightweight scan of one object file returning only the names of the
/// symbols it defines; used by the library resolver to build its index.
pub fn collect_symbol_definitions(
    path: &str,
    diag: &mut Diagnostics,
) -> Result<Vec<String>, LinkError> {
    let sequence = FileSequence::new(vec![path.to_string()], HashMap::new());
    let mut scanner = Scanner::new(sequence);
    let mut names = Vec::new();

    fn skip_line(
        scanner: &mut Scanner<FileSequence>,
    ) -> Result<(), LinkError> {
        loop {
            let token = scanner.next_token()?;
            if matches!(token.kind, TokenKind::Newline | TokenKind::StreamEnd) {
                return Ok(());
            }
        }
    }

    loop {
        let token = scanner.next_token()?;
        match token.kind {
            TokenKind::StreamEnd => return Ok(names),
            TokenKind::Newline => continue,
            TokenKind::Comment => skip_line(&mut scanner)?,
            TokenKind::Identifier | TokenKind::IdOrNumber if !token.text.is_empty() => {
                match token.text.as_bytes()[0] {
                    b'X' | b'D' | b'Q' | b'H' | b'M' | b'A' | b'R' | b'P' | b'O' => {
                        skip_line(&mut scanner)?;
                    }
                    // code follows; every definition has been seen
                    b'T' => return Ok(names),
                    b'S' => {
                        let name = scanner.next_token()?;
                        let flags = scanner.next_token()?;
                        if name.is_identifier()
                            && flags.is_identifier()
                            && flags.text.len() >= 4
                            && flags.text.starts_with('D')
                        {
                            names.push(name.text);
                        } else if !name.is_identifier() || !flags.is_identifier() {
                            diag.warning("bad command");
                        }
                        skip_line(&mut scanner)?;
                    }
                    _ => {
                        diag.warning("bad command");
                        skip_line(&mut scanner)?;
                    }
                }
            }
            _ => {
                diag.warning("bad command");
                skip_line(&mut scanner)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_evaluation_honors_radix_prefix() {
        assert_eq!(evaluate_number("1F", 16), Some(0x1F));
        assert_eq!(evaluate_number("17", 8), Some(0o17));
        assert_eq!(evaluate_number("0X2A", 10), Some(42));
        assert_eq!(evaluate_number("0Q17", 10), Some(0o17));
        assert_eq!(evaluate_number("0H1C", 10), Some(0x1C));
        assert_eq!(evaluate_number("zz", 16), None);
    }

    #[test]
    fn number_evaluation_takes_longest_digit_prefix() {
        // `b` and `d` select a radix while scanning but not while
        // evaluating; evaluation stops at the first invalid digit
        assert_eq!(evaluate_number("0B101", 16), Some(0x0B101));
        assert_eq!(evaluate_number("1F", 10), Some(1));
        assert_eq!(evaluate_number("0", 10), Some(0));
    }

    #[test]
    fn value_map_lines() {
        assert_eq!(
            parse_value_map_line("_CODE=0x0200"),
            Some(("_CODE".to_string(), 0x200))
        );
        assert_eq!(
            parse_value_map_line(".STACK=E000"),
            Some((".STACK".to_string(), 0xE000))
        );
        assert_eq!(parse_value_map_line("nonsense"), None);
        assert_eq!(parse_value_map_line("a=b=c"), None);
    }

    #[test]
    fn offset_suffix_is_split() {
        assert_eq!(split_offset("lib.lib@1234"), ("lib.lib", 1234));
        assert_eq!(split_offset("plain.o"), ("plain.o", 0));
        assert_eq!(split_offset("odd@name@77"), ("odd@name", 77));
        assert_eq!(split_offset("not@anoffset"), ("not@anoffset", 0));
    }
}
