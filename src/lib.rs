//! Retargetable two-pass linker for small embedded processors
//!
//! The linker consumes textual relocatable object files, resolves symbols
//! against object libraries, lays out areas and segments at absolute
//! addresses, relocates the encoded instruction streams, optionally
//! rewrites cross-bank calls through trampolines, and fans the result out
//! to Intel HEX, Motorola S19, raw cartridge image and map-file encoders.
//! The concrete processor lives behind the [`target::Target`] seam; the
//! built-in description covers the Gameboy's LR35902.

/// Area and segment store, and the layout algorithm
pub mod area;
/// Cross-bank call rewriting
pub mod banking;
/// Code sequences, relocation records and the relocator
pub mod codeseq;
/// Diagnostics and fatal link failures
pub mod error;
/// Object library resolution
pub mod library;
/// The link context and the two-pass driver
pub mod link;
/// Assembler listing rewriting (`.lst` to `.rst`)
pub mod listing;
/// Map-file fan-out and the standard map format
pub mod mapfile;
/// Module store
pub mod module;
/// NoICE debug map format
pub mod noice;
/// Command-line surface
pub mod options;
/// Code-output fan-out and the hex-record encoders
pub mod output;
/// Object-file parser
pub mod parser;
/// Character-stream tokenizer
pub mod scanner;
/// Symbol table
pub mod symbol;
/// Target descriptions
pub mod target;

pub use self::error::{Diagnostics, LinkError};
pub use self::link::{Link, run};
