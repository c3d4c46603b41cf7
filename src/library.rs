use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use indexmap::IndexMap;
use log::debug;

use crate::error::{Diagnostics, LinkError};
use crate::link::Link;
use crate::parser;

const LIBRARY_EXTENSION: &str = ".lib";
const OBJECT_EXTENSION: &str = ".o";

const LIB_START: &str = "<SDCCLIB>";
const INDEX_START: &str = "<INDEX>";
const INDEX_END: &str = "</INDEX>";
const MODULE_START: &str = "<MODULE>";
const MODULE_END: &str = "</MODULE>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    NotLoaded,
    Marked,
    Loaded,
}

/// One library file, or one object member of a composite library. A
/// nonzero `offset` addresses a member embedded in its parent archive.
#[derive(Debug)]
pub struct LibraryRecord {
    pub path: String,
    pub directory: String,
    pub offset: u64,
    pub is_object_file: bool,
    pub status: LoadStatus,
    pub symbols: Vec<String>,
}

impl LibraryRecord {
    /// Input name used to parse this record, applying the `@offset`
    /// convention for embedded members.
    #[must_use]
    pub fn input_name(&self) -> String {
        if self.offset > 0 {
            format!("{}@{}", self.path, self.offset)
        } else {
            self.path.clone()
        }
    }
}

/// Ordered library list with a symbol-name → libraries multimap.
#[derive(Debug, Default)]
pub struct LibraryStore {
    libraries: Vec<LibraryRecord>,
    search_paths: Vec<String>,
    symbol_index: IndexMap<String, Vec<usize>>,
    index_is_built: bool,
}

impl LibraryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_directory(&mut self, path: &str) {
        self.search_paths.push(path.to_string());
    }

    fn directory_of(path: &str) -> String {
        match path.rfind('/') {
            Some(position) => path[..=position].to_string(),
            None => String::new(),
        }
    }

    fn add_file(
        &mut self,
        directory: &str,
        relative_path: &str,
        offset: u64,
        is_object_file: bool,
    ) -> Option<usize> {
        let mut full_path = directory.to_string();
        if !full_path.is_empty() && !full_path.ends_with('/') {
            full_path.push('/');
        }
        full_path.push_str(relative_path);

        if !Path::new(&full_path).is_file() {
            return None;
        }
        if let Some(index) = self
            .libraries
            .iter()
            .position(|library| library.path == full_path && library.offset == offset)
        {
            return Some(index);
        }
        self.libraries.push(LibraryRecord {
            directory: Self::directory_of(&full_path),
            path: full_path,
            offset,
            is_object_file,
            status: LoadStatus::NotLoaded,
            symbols: Vec::new(),
        });
        Some(self.libraries.len() - 1)
    }

    /// Registers a library given on the command line; tried directly and
    /// through every search path. Returns whether any file was found.
    pub fn add_file_path_name(&mut self, path: &str) -> bool {
        let mut name = path.to_string();
        if !name.ends_with(LIBRARY_EXTENSION) {
            name.push_str(LIBRARY_EXTENSION);
        }

        let mut found = self.add_file("", &name, 0, false).is_some();
        for index in 0..self.search_paths.len() {
            let directory = self.search_paths[index].clone();
            found |= self.add_file(&directory, &name, 0, false).is_some();
        }
        found
    }

    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        self.libraries
            .iter()
            .map(|library| library.path.clone())
            .collect()
    }

    #[must_use]
    pub fn loaded_input_names(&self) -> Vec<String> {
        self.libraries
            .iter()
            .filter(|library| library.status == LoadStatus::Loaded)
            .map(LibraryRecord::input_name)
            .collect()
    }

    fn add_symbols_to_index(&mut self, library: usize, symbols: Vec<String>) {
        for symbol in &symbols {
            self.symbol_index
                .entry(symbol.clone())
                .or_default()
                .push(library);
        }
        self.libraries[library].symbols.extend(symbols);
    }

    /// Reads every registered `.lib` file and fills the symbol multimap.
    /// A plain library lists object files by name; an SDCCLIB archive
    /// carries an `<INDEX>` of `<MODULE>` entries with byte offsets.
    fn build_index(&mut self, link_diag: &mut Diagnostics) -> Result<(), LinkError> {
        #[derive(PartialEq)]
        enum State {
            AtFileSpecification,
            InSdccLib,
            AfterIndexStart,
            InIndex,
            AfterModuleStart,
            InModule,
        }

        for library in 0..self.libraries.len() {
            if self.libraries[library].is_object_file {
                continue;
            }
            let path = self.libraries[library].path.clone();
            let directory = self.libraries[library].directory.clone();
            let file = fs::File::open(&path).map_err(|source| LinkError::FileOpen {
                path: path.clone(),
                source,
            })?;

            let mut state = State::AtFileSpecification;
            let mut index_size: u64 = 0;
            let mut embedded: Option<usize> = None;
            let mut embedded_symbols: Vec<String> = Vec::new();

            for line in BufReader::new(file).lines() {
                let line = line?;
                let line = line.trim_end_matches(['\r', '\n']);
                let bad_line = || LinkError::BadLibraryLine {
                    path: path.clone(),
                    line: line.to_string(),
                };

                match state {
                    State::AtFileSpecification => {
                        if line == LIB_START {
                            state = State::InSdccLib;
                        } else {
                            let mut object_name = line.to_string();
                            if !object_name.ends_with(OBJECT_EXTENSION) {
                                object_name.push_str(OBJECT_EXTENSION);
                            }
                            match self.add_file(&directory, &object_name, 0, true) {
                                Some(member) => {
                                    let member_path = self.libraries[member].path.clone();
                                    let symbols =
                                        parser::collect_symbol_definitions(&member_path, link_diag)?;
                                    self.add_symbols_to_index(member, symbols);
                                }
                                None => link_diag.warning(&format!(
                                    "object file {object_name} in library {path} not found"
                                )),
                            }
                        }
                    }
                    State::InSdccLib => {
                        if line == INDEX_START {
                            state = State::AfterIndexStart;
                        } else {
                            return Err(bad_line());
                        }
                    }
                    State::AfterIndexStart => {
                        index_size = line.trim().parse().map_err(|_| bad_line())?;
                        state = State::InIndex;
                    }
                    State::InIndex => {
                        if line == MODULE_START {
                            state = State::AfterModuleStart;
                        } else if line == INDEX_END {
                            break;
                        } else {
                            return Err(bad_line());
                        }
                    }
                    State::AfterModuleStart => {
                        let (_module_name, offset_text) =
                            line.split_once(' ').ok_or_else(|| bad_line())?;
                        let module_offset: u64 =
                            offset_text.trim().parse().map_err(|_| bad_line())?;
                        // an embedded member shares the archive path and
                        // carries its byte offset
                        embedded = Some(
                            self.add_file("", &path, index_size + module_offset, true)
                                .ok_or_else(|| bad_line())?,
                        );
                        embedded_symbols.clear();
                        state = State::InModule;
                    }
                    State::InModule => {
                        if line == MODULE_END {
                            if let Some(member) = embedded.take() {
                                self.add_symbols_to_index(
                                    member,
                                    std::mem::take(&mut embedded_symbols),
                                );
                            }
                            state = State::InIndex;
                        } else {
                            embedded_symbols.push(line.to_string());
                        }
                    }
                }
            }
        }
        self.index_is_built = true;
        Ok(())
    }

    /// Marks the first library defining `symbol_name`; warns when several
    /// libraries define it. Returns whether a library was newly marked.
    fn find_symbol(&mut self, symbol_name: &str, diag: &mut Diagnostics) -> bool {
        let Some(candidates) = self.symbol_index.get(symbol_name) else {
            return false;
        };
        if candidates.len() > 1 {
            let mut places = String::new();
            for &candidate in candidates {
                places.push_str("\n  ");
                places.push_str(&self.libraries[candidate].directory);
            }
            diag.warning(&format!(
                "definition of public symbol '{symbol_name}' found more than once in{places}"
            ));
        }
        let first = candidates[0];
        if self.libraries[first].status == LoadStatus::NotLoaded {
            self.libraries[first].status = LoadStatus::Marked;
            return true;
        }
        false
    }
}

/// Iterated closure: marks and loads libraries until no unloaded library
/// defines a currently undefined symbol.
pub fn resolve_undefined_symbols(link: &mut Link) -> Result<(), LinkError> {
    if !link.libraries.index_is_built {
        let Link {
            libraries, diag, ..
        } = link;
        libraries.build_index(diag)?;
    }

    loop {
        let mut changed = false;
        for id in link.symbols.undefined() {
            let name = link.symbols.get(id).name.clone();
            changed |= link.libraries.find_symbol(&name, &mut link.diag);
        }
        if !changed {
            return Ok(());
        }

        let marked: Vec<String> = link
            .libraries
            .libraries
            .iter()
            .filter(|library| library.status == LoadStatus::Marked)
            .map(LibraryRecord::input_name)
            .collect();
        for input in &marked {
            debug!("loading library member {input}");
            parser::parse_object_files(link, true, std::slice::from_ref(input))?;
        }
        for library in &mut link.libraries.libraries {
            if library.status == LoadStatus::Marked {
                library.status = LoadStatus::Loaded;
            }
        }
    }
}

/// Pass 2 for every loaded library member: re-parses them so their code
/// sequences reach the output fan-out.
pub fn add_code_sequences(link: &mut Link) -> Result<(), LinkError> {
    let inputs = link.libraries.loaded_input_names();
    if inputs.is_empty() {
        return Ok(());
    }
    parser::parse_object_files(link, false, &inputs)
}
