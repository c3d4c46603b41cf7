use std::io::{self, Write};

use bitflags::bitflags;
use indexmap::IndexMap;

use crate::area::{Address, AreaStore, SegmentId};
use crate::error::Diagnostics;
use crate::module::ModuleStore;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u8 {
        const DEFINED    = 0x01;
        const REFERENCED = 0x02;
        const SURROGATE  = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub usize);

/// A globally visible name, optionally defined at an offset within a
/// segment.
#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub flags: SymbolFlags,
    pub segment: Option<SegmentId>,
    pub address: Address,
}

impl Symbol {
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.flags.contains(SymbolFlags::DEFINED)
    }

    #[must_use]
    pub fn is_surrogate(&self) -> bool {
        self.flags.contains(SymbolFlags::SURROGATE)
    }
}

/// Name-indexed symbol arena. Names are canonicalized to upper case when
/// the target is case-insensitive.
#[derive(Debug)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: IndexMap<String, SymbolId>,
    case_sensitive: bool,
}

impl SymbolTable {
    #[must_use]
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            symbols: Vec::new(),
            by_name: IndexMap::new(),
            case_sensitive,
        }
    }

    fn canonical(&self, name: &str) -> String {
        if self.case_sensitive {
            name.to_string()
        } else {
            name.to_uppercase()
        }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(&self.canonical(name)).copied()
    }

    /// Looks up or creates an empty record for `name`.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        let key = self.canonical(name);
        if let Some(&id) = self.by_name.get(&key) {
            return id;
        }
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol {
            name: key.clone(),
            flags: SymbolFlags::empty(),
            segment: None,
            address: 0,
        });
        self.by_name.insert(key, id);
        id
    }

    #[must_use]
    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = SymbolId> + use<> {
        (0..self.symbols.len()).map(SymbolId)
    }

    /// Absolute address: segment base plus the in-segment offset, or the
    /// bare offset for segment-less symbols.
    #[must_use]
    pub fn absolute_address(&self, id: SymbolId, areas: &AreaStore) -> Address {
        let symbol = &self.symbols[id.0];
        match symbol.segment {
            Some(segment) => areas
                .segment(segment)
                .start_address
                .wrapping_add(symbol.address),
            None => symbol.address,
        }
    }

    /// Defines a segment-less symbol with an already absolute value
    /// (the per-area `s_`/`l_` auto-symbols, `-g` overrides from layout).
    pub fn define_absolute(&mut self, name: &str, value: Address, diag: &mut Diagnostics) {
        let id = self.intern(name);
        let symbol = &mut self.symbols[id.0];
        if symbol.is_defined() {
            diag.warning(&format!("Multiple definition of symbol {name}"));
        }
        symbol.address = value;
        symbol.segment = None;
        symbol.flags |= SymbolFlags::DEFINED;
    }

    /// Applies a `-g` style override. The symbol must already exist.
    pub fn set_address_for_name(&mut self, name: &str, address: Address, diag: &mut Diagnostics) {
        match self.lookup(name) {
            None => diag.warning(&format!(
                "Predefined symbol {name} has never been referenced"
            )),
            Some(id) => {
                let symbol = &mut self.symbols[id.0];
                if symbol.is_defined() {
                    diag.warning(&format!(
                        "Predefined symbol {name} has already been defined elsewhere"
                    ));
                    symbol.segment = None;
                }
                symbol.address = address;
                symbol.flags |= SymbolFlags::DEFINED;
            }
        }
    }

    /// All records that are referenced but not defined.
    #[must_use]
    pub fn undefined(&self) -> Vec<SymbolId> {
        self.ids()
            .filter(|&id| !self.symbols[id.0].is_defined())
            .collect()
    }

    /// Reports every module referencing an undefined symbol to `out`.
    pub fn check_undefined(
        &self,
        out: &mut dyn Write,
        modules: &ModuleStore,
    ) -> io::Result<()> {
        for id in self.undefined() {
            for module_id in modules.ids() {
                let module = modules.get(module_id);
                if module.symbols.contains(&id) {
                    writeln!(
                        out,
                        "Undefined Global {} referenced by module {}",
                        self.symbols[id.0].name, module.name
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Processes one `S` line: creates or updates the symbol, attaches a
/// definition to the current segment and records the reference in the
/// current module.
pub fn make_symbol(
    symbols: &mut SymbolTable,
    areas: &mut AreaStore,
    modules: &mut ModuleStore,
    diag: &mut Diagnostics,
    name: &str,
    is_definition: bool,
    address: Address,
) -> SymbolId {
    let id = symbols.intern(name);

    if is_definition {
        if symbols.get(id).is_defined() {
            diag.warning(&format!("Multiple definition of symbol {name}"));
        }
        let segment = areas.current_segment;
        {
            let symbol = symbols.get_mut(id);
            symbol.address = address;
            symbol.segment = segment;
            symbol.flags |= SymbolFlags::DEFINED;
        }
        if let Some(segment) = segment {
            areas.add_symbol_to_segment(segment, id);
        }
    } else {
        if address != 0 {
            diag.warning(&format!(
                "Non-zero address field in symbol reference {name}"
            ));
        }
        symbols.get_mut(id).flags |= SymbolFlags::REFERENCED;
    }

    if let Some(module) = modules.current() {
        modules.add_symbol(module, id);
    }
    id
}

/// Splits a defined symbol for banking. Afterwards the original name
/// resolves to an undefined, referenced surrogate (the record every prior
/// reference already points at), while `surrogate_name` is a new record
/// carrying the original definition. The defining module and segment are
/// rewritten to the new record. Returns the definition record.
pub fn split_symbol(
    symbols: &mut SymbolTable,
    areas: &mut AreaStore,
    modules: &mut ModuleStore,
    original: SymbolId,
    surrogate_name: &str,
) -> Option<SymbolId> {
    let (segment, address, flags) = {
        let symbol = symbols.get(original);
        if !symbol.is_defined() || symbol.is_surrogate() {
            return None;
        }
        (symbol.segment, symbol.address, symbol.flags)
    };

    let definition = symbols.intern(surrogate_name);
    {
        let record = symbols.get_mut(definition);
        record.flags = flags - SymbolFlags::REFERENCED;
        record.segment = segment;
        record.address = address;
    }
    {
        let record = symbols.get_mut(original);
        record.flags = SymbolFlags::REFERENCED | SymbolFlags::SURROGATE;
        record.segment = None;
        record.address = 0;
    }

    if let Some(segment) = segment {
        let defining_module = areas.segment(segment).module;
        modules.replace_symbol(defining_module, original, definition);
        areas.replace_segment_symbol(segment, original, definition);
    }
    Some(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::AreaAttributes;

    fn stores() -> (SymbolTable, AreaStore, ModuleStore, Diagnostics) {
        (
            SymbolTable::new(true),
            AreaStore::new(),
            ModuleStore::new(),
            Diagnostics::new(),
        )
    }

    #[test]
    fn case_policy_folds_names() {
        let mut insensitive = SymbolTable::new(false);
        let id = insensitive.intern("main");
        assert_eq!(insensitive.lookup("MAIN"), Some(id));

        let mut sensitive = SymbolTable::new(true);
        let id = sensitive.intern("main");
        assert_eq!(sensitive.lookup("MAIN"), None);
        assert_eq!(sensitive.lookup("main"), Some(id));
    }

    #[test]
    fn definition_then_reference() {
        let (mut symbols, mut areas, mut modules, mut diag) = stores();
        let module = modules.make("a.o", 1, 1);
        let segment =
            areas.make_segment("CODE", 0x10, AreaAttributes::empty(), module, &mut diag);
        let id = make_symbol(
            &mut symbols, &mut areas, &mut modules, &mut diag, "proc", true, 4,
        );
        assert!(symbols.get(id).is_defined());
        assert_eq!(symbols.get(id).segment, Some(segment));
        assert!(areas.segment(segment).symbols.contains(&id));

        make_symbol(
            &mut symbols, &mut areas, &mut modules, &mut diag, "proc", false, 0,
        );
        assert!(symbols.get(id).flags.contains(SymbolFlags::REFERENCED));
        assert_eq!(diag.warning_count(), 0);
    }

    #[test]
    fn duplicate_definition_warns() {
        let (mut symbols, mut areas, mut modules, mut diag) = stores();
        let module = modules.make("a.o", 1, 1);
        areas.make_segment("CODE", 0x10, AreaAttributes::empty(), module, &mut diag);
        make_symbol(
            &mut symbols, &mut areas, &mut modules, &mut diag, "proc", true, 0,
        );
        make_symbol(
            &mut symbols, &mut areas, &mut modules, &mut diag, "proc", true, 2,
        );
        assert_eq!(diag.warning_count(), 1);
    }

    #[test]
    fn nonzero_reference_address_warns() {
        let (mut symbols, mut areas, mut modules, mut diag) = stores();
        modules.make("a.o", 0, 1);
        make_symbol(
            &mut symbols, &mut areas, &mut modules, &mut diag, "ext", false, 7,
        );
        assert_eq!(diag.warning_count(), 1);
    }

    #[test]
    fn split_preserves_referential_identity() {
        let (mut symbols, mut areas, mut modules, mut diag) = stores();
        let defining = modules.make("a.o", 1, 1);
        let segment =
            areas.make_segment("CODE", 0x10, AreaAttributes::empty(), defining, &mut diag);
        let original = make_symbol(
            &mut symbols, &mut areas, &mut modules, &mut diag, "proc", true, 4,
        );

        let referencing = modules.make("b.o", 0, 1);
        make_symbol(
            &mut symbols, &mut areas, &mut modules, &mut diag, "proc", false, 0,
        );

        let definition =
            split_symbol(&mut symbols, &mut areas, &mut modules, original, "_BCproc").unwrap();

        // the original name resolves to the undefined surrogate
        let surrogate = symbols.lookup("proc").unwrap();
        assert_eq!(surrogate, original);
        let record = symbols.get(surrogate);
        assert!(!record.is_defined());
        assert!(record.is_surrogate());
        assert!(record.flags.contains(SymbolFlags::REFERENCED));

        // the definition is reachable via the surrogate name
        assert_eq!(symbols.lookup("_BCproc"), Some(definition));
        let record = symbols.get(definition);
        assert!(record.is_defined());
        assert!(!record.flags.contains(SymbolFlags::REFERENCED));
        assert_eq!(record.segment, Some(segment));
        assert_eq!(record.address, 4);

        // referencing module still points at the surrogate record
        assert!(modules.get(referencing).symbols.contains(&original));
        // defining module and segment now carry the definition record
        assert!(modules.get(defining).symbols.contains(&definition));
        assert!(areas.segment(segment).symbols.contains(&definition));

        // splitting a surrogate is rejected
        assert!(split_symbol(&mut symbols, &mut areas, &mut modules, original, "_BC2").is_none());
    }

    #[test]
    fn absolute_address_adds_segment_base() {
        let (mut symbols, mut areas, mut modules, mut diag) = stores();
        let module = modules.make("a.o", 1, 1);
        areas.make_segment("CODE", 0x20, AreaAttributes::empty(), module, &mut diag);
        let id = make_symbol(
            &mut symbols, &mut areas, &mut modules, &mut diag, "entry", true, 0x0F,
        );
        areas.set_base_address("CODE", 0x0100);
        areas.link_areas(&mut diag);
        assert_eq!(symbols.absolute_address(id, &areas), 0x010F);
    }
}
