use std::{error, fmt, io};

/// Unrecoverable link failures. Warnings and plain errors go through
/// [`Diagnostics`] and let the link continue; a `LinkError` aborts the run
/// and becomes exit code 1 in the driver.
#[derive(Debug)]
pub enum LinkError {
    FileOpen { path: String, source: io::Error },
    Io(io::Error),
    PushbackOverflow,
    NoModuleHeader,
    BadAreaMode(u16),
    BadSegmentInRelocation,
    UnsupportedPagedRelocation,
    TooManyCodeOutputs,
    TooManyMapFiles,
    BadLibraryLine { path: String, line: String },
    BadStubPrecondition(&'static str),
    BankOverflow { bank: i32, last: i32 },
    AddressOverflow { address: u32, limit: u32 },
    AddressUnderflow { address: u32, limit: u32 },
    CartridgeOverflow { address: u32, size: u32 },
    NoBankSwitching,
    BadTargetOption(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileOpen { path, source } => {
                write!(f, "could not open file {path}: {source}")
            }
            Self::Io(err) => write!(f, "i/o failure: {err}"),
            Self::PushbackOverflow => f.write_str("scanner pushback stack is full"),
            Self::NoModuleHeader => f.write_str("no module header defined"),
            Self::BadAreaMode(mode) => write!(f, "bad area mode {mode:#06x} in R line"),
            Self::BadSegmentInRelocation => f.write_str("bad segment in R line"),
            Self::UnsupportedPagedRelocation => {
                f.write_str("paged addressing not yet supported")
            }
            Self::TooManyCodeOutputs => {
                f.write_str("too many code output streams open simultaneously")
            }
            Self::TooManyMapFiles => f.write_str("too many map files open simultaneously"),
            Self::BadLibraryLine { path, line } => {
                write!(f, "bad line in library file {path}: {line}")
            }
            Self::BadStubPrecondition(what) => write!(f, "banking stub: {what}"),
            Self::BankOverflow { bank, last } => {
                write!(f, "bank overflow (bank {bank:x} > last bank {last:x})")
            }
            Self::AddressOverflow { address, limit } => {
                write!(f, "address overflow (addr {address:x} > {limit:x})")
            }
            Self::AddressUnderflow { address, limit } => {
                write!(f, "address underflow (addr {address:x} < {limit:x})")
            }
            Self::CartridgeOverflow { address, size } => {
                write!(f, "cartridge size overflow (addr {address:x} >= {size:x})")
            }
            Self::NoBankSwitching => {
                f.write_str("no bank switching possible when using only two ROM banks")
            }
            Self::BadTargetOption(option) => write!(f, "invalid option {option}"),
        }
    }
}

impl error::Error for LinkError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::FileOpen { source, .. } => Some(source),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Sink for non-fatal diagnostics.
///
/// Messages carry one of two criticalities: a warning lets the link finish
/// with exit code 0, an error lets it finish but forces a nonzero exit.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warning_count: u32,
    error_count: u32,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warning(&mut self, message: &str) {
        self.warning_count += 1;
        eprintln!("ASLINK Warning: {message}");
    }

    pub fn error(&mut self, message: &str) {
        self.error_count += 1;
        eprintln!("ASLINK Error: {message}");
    }

    #[must_use]
    pub fn warning_count(&self) -> u32 {
        self.warning_count
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }
}
