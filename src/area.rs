use bitflags::bitflags;
use indexmap::IndexMap;

use crate::error::Diagnostics;
use crate::module::ModuleId;
use crate::symbol::SymbolId;

/// Target addresses are 16 bit.
pub type Address = u16;

/// Name of the predefined absolute area.
pub const ABSOLUTE_AREA_NAME: &str = ".ABS.";

bitflags! {
    /// Layout policy of an area. Only `OVERLAYED`, `ABSOLUTE` and `PAGED`
    /// are decodable from the `flags` byte of an `A` line; the space flags
    /// feed the memory-page prefix of debug map formats and are never set
    /// by this object dialect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AreaAttributes: u8 {
        const NONLOADABLE            = 0x01;
        const OVERLAYED              = 0x04;
        const ABSOLUTE               = 0x08;
        const PAGED                  = 0x10;
        const IN_CODE_SPACE          = 0x20;
        const IN_EXTERNAL_DATA_SPACE = 0x40;
        const IN_BIT_SPACE           = 0x80;
    }
}

impl AreaAttributes {
    /// Decodes the `flags` byte of an `A` line.
    #[must_use]
    pub fn from_encoding(encoding: u8) -> Self {
        let mut attributes = AreaAttributes::empty();
        if encoding & 0x04 != 0 {
            attributes |= AreaAttributes::OVERLAYED;
        }
        if encoding & 0x08 != 0 {
            attributes |= AreaAttributes::ABSOLUTE;
        }
        if encoding & 0x10 != 0 {
            attributes |= AreaAttributes::PAGED;
        }
        attributes
    }

    /// Memory page used by paged-address map formats (NoICE).
    #[must_use]
    pub fn memory_page(self) -> u8 {
        let mut page = 0x00;
        if self.contains(AreaAttributes::IN_CODE_SPACE) {
            page = 0x0C;
        }
        if self.contains(AreaAttributes::IN_EXTERNAL_DATA_SPACE) {
            page = 0x0D;
        }
        if self.contains(AreaAttributes::IN_BIT_SPACE) {
            page = 0x0B;
        }
        page
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AreaId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(pub usize);

/// A named grouping of code or data sharing one layout policy.
#[derive(Debug)]
pub struct Area {
    pub name: String,
    pub attributes: AreaAttributes,
    pub start_address: Address,
    pub total_size: Address,
    pub segments: Vec<SegmentId>,
    /// Set by a `-b` override; layout leaves such addresses alone.
    pub address_is_fixed: bool,
}

/// One module's contribution to an area.
#[derive(Debug)]
pub struct Segment {
    pub area: AreaId,
    pub module: ModuleId,
    pub start_address: Address,
    pub total_size: Address,
    pub symbols: Vec<SymbolId>,
}

/// Owns all areas and all segments of the link.
#[derive(Debug)]
pub struct AreaStore {
    areas: Vec<Area>,
    by_name: IndexMap<String, AreaId>,
    segments: Vec<Segment>,
    pub current_segment: Option<SegmentId>,
    absolute_area: AreaId,
}

impl AreaStore {
    #[must_use]
    pub fn new() -> Self {
        let mut store = Self {
            areas: Vec::new(),
            by_name: IndexMap::new(),
            segments: Vec::new(),
            current_segment: None,
            absolute_area: AreaId(0),
        };
        store.absolute_area = store.insert_area(
            ABSOLUTE_AREA_NAME,
            AreaAttributes::ABSOLUTE | AreaAttributes::OVERLAYED,
        );
        store
    }

    fn insert_area(&mut self, name: &str, attributes: AreaAttributes) -> AreaId {
        let id = AreaId(self.areas.len());
        self.areas.push(Area {
            name: name.to_string(),
            attributes,
            start_address: 0,
            total_size: 0,
            segments: Vec::new(),
            address_is_fixed: false,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Looks up or creates the area `name`. A second creation with other
    /// attributes keeps the first set and warns.
    pub fn make_area(
        &mut self,
        name: &str,
        attributes: AreaAttributes,
        diag: &mut Diagnostics,
    ) -> AreaId {
        if let Some(&id) = self.by_name.get(name) {
            if self.areas[id.0].attributes != attributes {
                diag.warning(&format!("Conflicting flags in area {name}"));
            }
            id
        } else {
            self.insert_area(name, attributes)
        }
    }

    /// Appends a segment of `module` to the area `name` and makes it the
    /// current segment.
    pub fn make_segment(
        &mut self,
        name: &str,
        total_size: Address,
        attributes: AreaAttributes,
        module: ModuleId,
        diag: &mut Diagnostics,
    ) -> SegmentId {
        let area = self.make_area(name, attributes, diag);
        let id = SegmentId(self.segments.len());
        self.segments.push(Segment {
            area,
            module,
            start_address: 0,
            total_size,
            symbols: Vec::new(),
        });
        self.areas[area.0].segments.push(id);
        self.current_segment = Some(id);
        id
    }

    /// The implicit `.ABS.` segment every module starts with.
    pub fn make_absolute_segment(&mut self, module: ModuleId, diag: &mut Diagnostics) -> SegmentId {
        let attributes = self.areas[self.absolute_area.0].attributes;
        self.make_segment(ABSOLUTE_AREA_NAME, 0, attributes, module, diag)
    }

    #[must_use]
    pub fn absolute_area(&self) -> AreaId {
        self.absolute_area
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<AreaId> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn area(&self, id: AreaId) -> &Area {
        &self.areas[id.0]
    }

    pub fn area_mut(&mut self, id: AreaId) -> &mut Area {
        &mut self.areas[id.0]
    }

    #[must_use]
    pub fn segment(&self, id: SegmentId) -> &Segment {
        &self.segments[id.0]
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> &mut Segment {
        &mut self.segments[id.0]
    }

    #[must_use]
    pub fn segment_area_name(&self, id: SegmentId) -> &str {
        &self.areas[self.segments[id.0].area.0].name
    }

    pub fn area_ids(&self) -> impl Iterator<Item = AreaId> + use<> {
        (0..self.areas.len()).map(AreaId)
    }

    pub fn add_symbol_to_segment(&mut self, segment: SegmentId, symbol: SymbolId) {
        self.segments[segment.0].symbols.push(symbol);
    }

    pub fn replace_segment_symbol(
        &mut self,
        segment: SegmentId,
        old_symbol: SymbolId,
        new_symbol: SymbolId,
    ) {
        if let Some(slot) = self.segments[segment.0]
            .symbols
            .iter_mut()
            .find(|slot| **slot == old_symbol)
        {
            *slot = new_symbol;
        }
    }

    /// Moves `segment` into `area` (banking relocation).
    pub fn set_segment_area(&mut self, segment: SegmentId, area: AreaId) {
        self.areas[area.0].segments.push(segment);
        self.segments[segment.0].area = area;
    }

    pub fn clear_area_segments(&mut self, area: AreaId) {
        self.areas[area.0].segments.clear();
    }

    /// Applies a `-b` style base-address override by area name.
    pub fn set_base_address(&mut self, name: &str, address: Address) {
        if let Some(&id) = self.by_name.get(name) {
            let area = &mut self.areas[id.0];
            area.start_address = address;
            area.address_is_fixed = true;
        }
    }

    /// Resolves the segment addresses of one area and reports paging
    /// boundary and length violations.
    pub fn layout_segments(&mut self, id: AreaId, diag: &mut Diagnostics) {
        let has_overlayed = self.areas[id.0]
            .attributes
            .contains(AreaAttributes::OVERLAYED);
        let has_paged = self.areas[id.0].attributes.contains(AreaAttributes::PAGED);
        let mut address = self.areas[id.0].start_address;
        let mut size: Address = 0;

        if has_paged && address & 0xFF != 0 {
            diag.warning(&format!("Paged Area {} Boundary Error", self.areas[id.0].name));
        }

        let segments = self.areas[id.0].segments.clone();
        for segment_id in segments {
            let segment = &mut self.segments[segment_id.0];
            segment.start_address = address;
            if !has_overlayed {
                address = address.wrapping_add(segment.total_size);
                size = size.wrapping_add(segment.total_size);
            } else if segment.total_size > size {
                size = segment.total_size;
            }
        }

        self.areas[id.0].total_size = size;

        if has_paged && size > 256 {
            diag.warning(&format!("Paged Area {} Length Error", self.areas[id.0].name));
        }
    }

    /// Two-pass base-address assignment over all areas in declaration
    /// order. Returns the `(name, start, size)` triples used to define the
    /// `s_`/`l_` auto-symbols of every non-absolute-store area.
    pub fn link_areas(&mut self, diag: &mut Diagnostics) -> Vec<(String, Address, Address)> {
        let mut running: Address = 0;
        let mut auto_symbols = Vec::new();

        for id in self.area_ids().collect::<Vec<_>>() {
            let is_absolute = self.areas[id.0]
                .attributes
                .contains(AreaAttributes::ABSOLUTE);
            if !is_absolute && !self.areas[id.0].address_is_fixed {
                self.areas[id.0].start_address = running;
            }
            self.layout_segments(id, diag);
            if !is_absolute {
                running = self.areas[id.0]
                    .start_address
                    .wrapping_add(self.areas[id.0].total_size);
            }

            let area = &self.areas[id.0];
            if area.name != ABSOLUTE_AREA_NAME {
                auto_symbols.push((area.name.clone(), area.start_address, area.total_size));
            }
        }
        auto_symbols
    }
}

impl Default for AreaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleId;

    fn module() -> ModuleId {
        ModuleId(0)
    }

    #[test]
    fn absolute_area_exists_up_front() {
        let store = AreaStore::new();
        let id = store.lookup(ABSOLUTE_AREA_NAME).unwrap();
        assert_eq!(id, store.absolute_area());
        assert_eq!(
            store.area(id).attributes,
            AreaAttributes::ABSOLUTE | AreaAttributes::OVERLAYED
        );
    }

    #[test]
    fn attribute_merge_keeps_first_set() {
        let mut store = AreaStore::new();
        let mut diag = Diagnostics::new();
        let first = store.make_area("CODE", AreaAttributes::empty(), &mut diag);
        assert_eq!(diag.warning_count(), 0);
        let second = store.make_area("CODE", AreaAttributes::PAGED, &mut diag);
        assert_eq!(first, second);
        assert_eq!(diag.warning_count(), 1);
        assert_eq!(store.area(first).attributes, AreaAttributes::empty());
    }

    #[test]
    fn concatenated_layout() {
        let mut store = AreaStore::new();
        let mut diag = Diagnostics::new();
        store.make_segment("CODE", 0x10, AreaAttributes::empty(), module(), &mut diag);
        let s2 = store.make_segment("CODE", 0x20, AreaAttributes::empty(), module(), &mut diag);
        store.link_areas(&mut diag);

        let area = store.area(store.lookup("CODE").unwrap());
        assert_eq!(area.start_address, 0x0000);
        assert_eq!(area.total_size, 0x30);
        assert_eq!(store.segment(s2).start_address, 0x10);
    }

    #[test]
    fn overlayed_layout_takes_maximum() {
        let mut store = AreaStore::new();
        let mut diag = Diagnostics::new();
        let s1 = store.make_segment("OVR", 0x10, AreaAttributes::OVERLAYED, module(), &mut diag);
        let s2 = store.make_segment("OVR", 0x08, AreaAttributes::OVERLAYED, module(), &mut diag);
        store.link_areas(&mut diag);

        let area = store.area(store.lookup("OVR").unwrap());
        assert_eq!(area.total_size, 0x10);
        assert_eq!(store.segment(s1).start_address, area.start_address);
        assert_eq!(store.segment(s2).start_address, area.start_address);
    }

    #[test]
    fn relocatable_areas_are_stacked() {
        let mut store = AreaStore::new();
        let mut diag = Diagnostics::new();
        store.make_segment("A1", 0x10, AreaAttributes::empty(), module(), &mut diag);
        store.make_segment("A2", 0x08, AreaAttributes::empty(), module(), &mut diag);
        store.link_areas(&mut diag);
        assert_eq!(store.area(store.lookup("A1").unwrap()).start_address, 0);
        assert_eq!(store.area(store.lookup("A2").unwrap()).start_address, 0x10);
    }

    #[test]
    fn fixed_base_address_is_kept() {
        let mut store = AreaStore::new();
        let mut diag = Diagnostics::new();
        store.make_segment("CODE", 0x10, AreaAttributes::empty(), module(), &mut diag);
        store.set_base_address("CODE", 0x0200);
        store.link_areas(&mut diag);
        assert_eq!(store.area(store.lookup("CODE").unwrap()).start_address, 0x0200);
    }

    #[test]
    fn paged_boundary_and_length_warnings() {
        let mut store = AreaStore::new();
        let mut diag = Diagnostics::new();
        store.make_segment("PAG", 0x140, AreaAttributes::PAGED, module(), &mut diag);
        store.set_base_address("PAG", 0x0180);
        store.link_areas(&mut diag);
        // one boundary error (0x180 & 0xFF != 0), one length error (> 256)
        assert_eq!(diag.warning_count(), 2);
    }

    #[test]
    fn kind_encoding_round_trip() {
        for byte in [0x00u8, 0x04, 0x08, 0x10, 0x14, 0x1C] {
            assert_eq!(
                AreaAttributes::from_encoding(byte).bits() & 0x1C,
                byte & 0x1C
            );
        }
    }
}
