use std::collections::HashMap;
use std::io::Write;

use log::{debug, info};

use crate::area::AreaStore;
use crate::banking::{self, BankingState};
use crate::error::{Diagnostics, LinkError};
use crate::library::{self, LibraryStore};
use crate::listing;
use crate::mapfile::{MapFileTable, MapView};
use crate::module::ModuleStore;
use crate::options;
use crate::parser::{self, ParserOptions};
use crate::symbol::SymbolTable;
use crate::target::{self, Target};

/// Option bundle collected from the command line.
#[derive(Debug, Default)]
pub struct LinkOptions {
    pub link_files: Vec<String>,
    /// Output-file stem, taken from the first link-file argument.
    pub stem: String,
    pub radix: u32,
    pub ihx: bool,
    pub s19: bool,
    pub update_listings: bool,
    pub echo_link_files: bool,
}

/// The user's `name=value` override lists, printed verbatim into map
/// files and applied around layout.
#[derive(Debug, Default)]
pub struct StringTables {
    pub base_address_list: Vec<String>,
    pub global_def_list: Vec<String>,
}

/// The whole link: every store, the output fan-outs, the target
/// description and the option bundle, threaded through the two passes.
pub struct Link {
    pub options: LinkOptions,
    pub parser_defaults: ParserOptions,
    pub diag: Diagnostics,
    pub areas: AreaStore,
    pub modules: ModuleStore,
    pub symbols: SymbolTable,
    pub libraries: LibraryStore,
    pub banking: BankingState,
    pub outputs: crate::output::CodeOutputTable,
    pub maps: MapFileTable,
    pub tables: StringTables,
    pub target: Box<dyn Target>,
    /// In-memory input files, addressed by name like real ones.
    pub virtual_files: HashMap<String, String>,
    /// First compiler-options line seen, with its module name.
    pub compiler_options: Option<(String, String)>,
}

impl Link {
    #[must_use]
    pub fn new(target: Box<dyn Target>) -> Self {
        let case_sensitive = target.is_case_sensitive();
        Self {
            options: LinkOptions {
                radix: 10,
                echo_link_files: true,
                ..LinkOptions::default()
            },
            parser_defaults: ParserOptions::default(),
            diag: Diagnostics::new(),
            areas: AreaStore::new(),
            modules: ModuleStore::new(),
            symbols: SymbolTable::new(case_sensitive),
            libraries: LibraryStore::new(),
            banking: BankingState::new(),
            outputs: crate::output::CodeOutputTable::new(),
            maps: MapFileTable::new(),
            tables: StringTables::default(),
            target,
            virtual_files: HashMap::new(),
            compiler_options: None,
        }
    }

    /// Applies the collected `-b` lines to area base addresses.
    pub fn apply_base_addresses(&mut self) {
        let Link {
            areas, diag, tables, ..
        } = self;
        parser::set_mapping_from_list(&tables.base_address_list, diag, |name, value| {
            areas.set_base_address(name, value as u16);
        });
    }

    /// Applies the collected `-g` lines to symbol values.
    pub fn apply_global_definitions(&mut self) {
        let Link {
            symbols,
            diag,
            tables,
            ..
        } = self;
        let mut deferred = Vec::new();
        parser::set_mapping_from_list(&tables.global_def_list, diag, |name, value| {
            deferred.push((name.to_string(), value as u16));
        });
        for (name, value) in deferred {
            symbols.set_address_for_name(&name, value, diag);
        }
    }

    /// Assigns area and segment addresses and defines the `s_`/`l_`
    /// auto-symbols.
    pub fn link_areas(&mut self) {
        let auto_symbols = self.areas.link_areas(&mut self.diag);
        for (area_name, start_address, total_size) in auto_symbols {
            self.symbols
                .define_absolute(&format!("s_{area_name}"), start_address, &mut self.diag);
            self.symbols
                .define_absolute(&format!("l_{area_name}"), total_size, &mut self.diag);
        }
    }

    /// Reports undefined symbols with their referencing modules.
    pub fn check_undefined_symbols(&self, out: &mut dyn Write) -> Result<(), LinkError> {
        self.symbols.check_undefined(out, &self.modules)?;
        Ok(())
    }

    /// Emits the linking data through every registered map format.
    pub fn write_map_data(&mut self) -> Result<(), LinkError> {
        let Link {
            areas,
            modules,
            symbols,
            libraries,
            tables,
            options,
            maps,
            ..
        } = self;
        maps.write_linking_data(&MapView {
            areas,
            modules,
            symbols,
            libraries,
            tables,
            link_files: &options.link_files,
            base: options.radix,
        })
    }

    /// The full two-pass link: after option processing, pass 1 builds the
    /// graph, libraries and banking complete it, layout freezes the
    /// addresses, pass 2 relocates and emits.
    pub fn run(&mut self) -> Result<(), LinkError> {
        self.maps.open_all(&self.options.stem)?;

        info!("pass 1: building the object graph");
        let inputs = self.options.link_files.clone();
        parser::parse_object_files(self, true, &inputs)?;

        library::resolve_undefined_symbols(self)?;
        if banking::resolve_interbank_references(self)? {
            // the stub may pull in a banking runtime library
            library::resolve_undefined_symbols(self)?;
        }

        self.apply_base_addresses();
        self.link_areas();
        self.apply_global_definitions();

        self.check_undefined_symbols(&mut std::io::stderr())?;
        self.write_map_data()?;

        info!("pass 2: relocating and emitting code");
        let inputs = self.options.link_files.clone();
        parser::parse_object_files(self, false, &inputs)?;
        library::add_code_sequences(self)?;

        let Link { outputs, diag, .. } = self;
        outputs.close_all(diag)?;
        self.maps.close_all()?;

        if self.options.update_listings {
            listing::update(self)?;
        }
        debug!(
            "link finished with {} warnings",
            self.diag.warning_count()
        );
        Ok(())
    }
}

/// Command-line entry point: collects options, runs the link and maps the
/// outcome to an exit code.
pub fn run(arguments: &[String]) -> Result<i32, LinkError> {
    let target = target::select("gbz80").expect("built-in target");
    let mut link = Link::new(target);

    let mut echo = link.options.echo_link_files;
    let collected = options::collect_options(arguments, &mut echo)?;
    link.options.echo_link_files = echo;
    options::process_options(&mut link, &collected)?;
    link.run()?;

    Ok(i32::from(link.diag.has_errors()))
}
