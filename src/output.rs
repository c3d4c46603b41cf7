use std::fs::File;
use std::io::{BufWriter, Write};

use crate::codeseq::CodeSequence;
use crate::error::{Diagnostics, LinkError};

/// At most this many code output streams may be open simultaneously.
pub const MAX_STREAM_COUNT: usize = 10;

/// Lifecycle events an encoder sees: once `Begin`, zero or more `Code`,
/// once `End`.
pub enum OutputEvent<'a> {
    Begin,
    Code(&'a CodeSequence),
    End,
}

/// An executable-format encoder fed by the code-output fan-out.
pub trait CodeEncoder {
    fn emit(
        &mut self,
        out: &mut dyn Write,
        event: OutputEvent<'_>,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError>;
}

struct CodeStream {
    file_name: String,
    out: Box<dyn Write>,
    encoder: Box<dyn CodeEncoder>,
}

/// Registry of concurrently open code output streams.
#[derive(Default)]
pub struct CodeOutputTable {
    streams: Vec<CodeStream>,
}

impl CodeOutputTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream over an arbitrary sink and emits its `Begin`
    /// event.
    pub fn create(
        &mut self,
        file_name: &str,
        out: Box<dyn Write>,
        encoder: Box<dyn CodeEncoder>,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        if self.streams.len() >= MAX_STREAM_COUNT {
            return Err(LinkError::TooManyCodeOutputs);
        }
        let mut stream = CodeStream {
            file_name: file_name.to_string(),
            out,
            encoder,
        };
        stream.encoder.emit(&mut stream.out, OutputEvent::Begin, diag)?;
        self.streams.push(stream);
        Ok(())
    }

    /// Registers a stream writing to `path`.
    pub fn create_file(
        &mut self,
        path: &str,
        encoder: Box<dyn CodeEncoder>,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        let file = File::create(path).map_err(|source| LinkError::FileOpen {
            path: path.to_string(),
            source,
        })?;
        self.create(path, Box::new(BufWriter::new(file)), encoder, diag)
    }

    /// Feeds one relocated code sequence to every open stream.
    pub fn write_sequence(
        &mut self,
        sequence: &CodeSequence,
        diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        for stream in &mut self.streams {
            stream
                .encoder
                .emit(&mut stream.out, OutputEvent::Code(sequence), diag)?;
        }
        Ok(())
    }

    /// Emits `End` on every stream and closes it.
    pub fn close_all(&mut self, diag: &mut Diagnostics) -> Result<(), LinkError> {
        for stream in &mut self.streams {
            stream.encoder.emit(&mut stream.out, OutputEvent::End, diag)?;
            stream.out.flush()?;
        }
        self.streams.clear();
        Ok(())
    }

    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        self.streams
            .iter()
            .map(|stream| stream.file_name.clone())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Sum over the bytes of an address value.
fn address_checksum(mut value: u32) -> u8 {
    let mut sum: u8 = 0;
    while value > 0 {
        sum = sum.wrapping_add((value & 0xFF) as u8);
        value >>= 8;
    }
    sum
}

/// Intel HEX: `:LL AAAA 00 DD… CC` with the two's-complement checksum,
/// terminated by `:00000001FF`.
#[derive(Debug, Default)]
pub struct IhxEncoder;

impl CodeEncoder for IhxEncoder {
    fn emit(
        &mut self,
        out: &mut dyn Write,
        event: OutputEvent<'_>,
        _diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        match event {
            OutputEvent::Begin => {}
            OutputEvent::Code(sequence) => {
                let address = sequence.offset_address & 0xFFFF;
                write!(out, ":{:02X}{:04X}00", sequence.bytes.len(), address)?;
                for &byte in &sequence.bytes {
                    write!(out, "{byte:02X}")?;
                }
                let mut checksum = sequence.bytes.len() as u8;
                checksum = checksum.wrapping_add(address_checksum(address));
                for &byte in &sequence.bytes {
                    checksum = checksum.wrapping_add(byte);
                }
                writeln!(out, "{:02X}", checksum.wrapping_neg())?;
            }
            OutputEvent::End => writeln!(out, ":00000001FF")?,
        }
        Ok(())
    }
}

/// Motorola S19: `S1 LL+3 AAAA DD… CC` with the one's-complement
/// checksum, terminated by `S9030000FC`.
#[derive(Debug, Default)]
pub struct S19Encoder;

impl CodeEncoder for S19Encoder {
    fn emit(
        &mut self,
        out: &mut dyn Write,
        event: OutputEvent<'_>,
        _diag: &mut Diagnostics,
    ) -> Result<(), LinkError> {
        match event {
            OutputEvent::Begin => {}
            OutputEvent::Code(sequence) => {
                let address = sequence.offset_address & 0xFFFF;
                write!(out, "S1{:02X}{:04X}", sequence.bytes.len() + 3, address)?;
                for &byte in &sequence.bytes {
                    write!(out, "{byte:02X}")?;
                }
                let mut checksum = (sequence.bytes.len() as u8).wrapping_add(3);
                checksum = checksum.wrapping_add(address_checksum(address));
                for &byte in &sequence.bytes {
                    checksum = checksum.wrapping_add(byte);
                }
                writeln!(out, "{:02X}", !checksum)?;
            }
            OutputEvent::End => writeln!(out, "S9030000FC")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(address: u32, bytes: &[u8]) -> CodeSequence {
        CodeSequence {
            segment: None,
            rom_bank: 0,
            offset_address: address,
            bytes: bytes.to_vec(),
        }
    }

    fn encode(encoder: &mut dyn CodeEncoder, sequences: &[CodeSequence]) -> String {
        let mut out = Vec::new();
        let mut diag = Diagnostics::new();
        encoder.emit(&mut out, OutputEvent::Begin, &mut diag).unwrap();
        for sequence in sequences {
            encoder
                .emit(&mut out, OutputEvent::Code(sequence), &mut diag)
                .unwrap();
        }
        encoder.emit(&mut out, OutputEvent::End, &mut diag).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn record_bytes(digits: &str) -> Vec<u8> {
        (0..digits.len() / 2)
            .map(|i| u8::from_str_radix(&digits[2 * i..2 * i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn ihx_hello_record() {
        let text = encode(
            &mut IhxEncoder,
            &[sequence(0x0000, &[0x3E, 0x42, 0xC9])],
        );
        assert_eq!(text, ":030000003E42C9B4\n:00000001FF\n");
    }

    #[test]
    fn ihx_checksum_invariant() {
        for (address, data) in [
            (0x0000u32, vec![0x3E, 0x42, 0xC9]),
            (0x0150, vec![0x00, 0xFF, 0x80, 0x7F]),
            (0xFFF0, vec![0xAA]),
        ] {
            let text = encode(&mut IhxEncoder, &[sequence(address, &data)]);
            let record = text.lines().next().unwrap();
            let sum: u8 = record_bytes(&record[1..])
                .iter()
                .fold(0u8, |sum, &byte| sum.wrapping_add(byte));
            assert_eq!(sum, 0, "record {record}");
        }
    }

    #[test]
    fn s19_checksum_invariant() {
        for (address, data) in [
            (0x0000u32, vec![0x3E, 0x42, 0xC9]),
            (0x0150, vec![0x00, 0xFF, 0x80, 0x7F]),
        ] {
            let text = encode(&mut S19Encoder, &[sequence(address, &data)]);
            let record = text.lines().next().unwrap();
            assert!(record.starts_with("S1"));
            let sum: u8 = record_bytes(&record[2..])
                .iter()
                .fold(0u8, |sum, &byte| sum.wrapping_add(byte));
            assert_eq!(sum, 0xFF, "record {record}");
        }
    }

    #[test]
    fn s19_terminator() {
        let text = encode(&mut S19Encoder, &[]);
        assert_eq!(text, "S9030000FC\n");
    }

    #[test]
    fn stream_capacity_is_bounded() {
        let mut table = CodeOutputTable::new();
        let mut diag = Diagnostics::new();
        for i in 0..MAX_STREAM_COUNT {
            table
                .create(&format!("out{i}"), Box::new(Vec::new()), Box::new(IhxEncoder), &mut diag)
                .unwrap();
        }
        assert!(matches!(
            table.create("overflow", Box::new(Vec::new()), Box::new(IhxEncoder), &mut diag),
            Err(LinkError::TooManyCodeOutputs)
        ));
    }
}
