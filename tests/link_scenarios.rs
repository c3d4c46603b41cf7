use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use gblink::banking;
use gblink::library;
use gblink::link::Link;
use gblink::mapfile::StandardMapEncoder;
use gblink::output::IhxEncoder;
use gblink::parser;
use gblink::symbol::SymbolFlags;
use gblink::target::gameboy::GameboyTarget;

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn link_with_inputs(inputs: &[(&str, &str)]) -> Link {
    let mut link = Link::new(Box::new(GameboyTarget::new()));
    for (name, contents) in inputs {
        link.virtual_files
            .insert((*name).to_string(), (*contents).to_string());
        link.options.link_files.push((*name).to_string());
    }
    link
}

fn run_both_passes(link: &mut Link) {
    let files = link.options.link_files.clone();
    parser::parse_object_files(link, true, &files).unwrap();
    link.apply_base_addresses();
    link.link_areas();
    link.apply_global_definitions();
    parser::parse_object_files(link, false, &files).unwrap();
}

#[test]
fn hello_hex() {
    let mut link = link_with_inputs(&[(
        "m1.o",
        "X\n\
         H 1 areas 1 global symbols\n\
         M m1\n\
         A CODE size 3 flags 0\n\
         S _start Def0000\n\
         T 00 00 3E 42 C9\n\
         R 00 00 00 00\n",
    )]);

    let hex = SharedBuffer::default();
    link.outputs
        .create("m1.ihx", Box::new(hex.clone()), Box::new(IhxEncoder), &mut link.diag)
        .unwrap();
    let map = SharedBuffer::default();
    link.maps
        .register_with_sink(".map", Box::new(map.clone()), Box::new(StandardMapEncoder), &mut link.diag)
        .unwrap();

    run_both_passes(&mut link);
    link.write_map_data().unwrap();
    link.outputs.close_all(&mut link.diag).unwrap();
    link.maps.close_all().unwrap();

    assert_eq!(hex.contents(), ":030000003E42C9B4\n:00000001FF\n");

    let s_code = link.symbols.lookup("s_CODE").unwrap();
    let l_code = link.symbols.lookup("l_CODE").unwrap();
    assert_eq!(link.symbols.absolute_address(s_code, &link.areas), 0x0000);
    assert_eq!(link.symbols.absolute_address(l_code, &link.areas), 0x0003);

    let map_text = map.contents();
    assert!(map_text.contains("s_CODE"), "map should list the auto-symbols");
    assert!(map_text.contains("l_CODE"));
    assert!(map_text.contains("CODE"));
}

#[test]
fn two_module_concatenation() {
    let mut link = link_with_inputs(&[
        (
            "a.o",
            "X\n\
             H 1 areas 0 global symbols\n\
             M a\n\
             A CODE size 10 flags 0\n",
        ),
        (
            "b.o",
            "X\n\
             H 1 areas 1 global symbols\n\
             M b\n\
             A CODE size 20 flags 0\n\
             S late Def000F\n",
        ),
    ]);

    let files = link.options.link_files.clone();
    parser::parse_object_files(&mut link, true, &files).unwrap();
    link.link_areas();

    let area = link.areas.area(link.areas.lookup("CODE").unwrap());
    assert_eq!(area.start_address, 0x0000);
    assert_eq!(area.total_size, 0x0030);

    let late = link.symbols.lookup("late").unwrap();
    assert_eq!(link.symbols.absolute_address(late, &link.areas), 0x001F);
}

#[test]
fn paged_boundary_and_length_diagnostics() {
    let mut link = link_with_inputs(&[(
        "p.o",
        "X\n\
         H 1 areas 0 global symbols\n\
         M p\n\
         A PAGED size 140 flags 010\n",
    )]);
    link.tables.base_address_list.push("PAGED=0x0180".to_string());

    let files = link.options.link_files.clone();
    parser::parse_object_files(&mut link, true, &files).unwrap();
    let warnings_before = link.diag.warning_count();
    link.apply_base_addresses();
    link.link_areas();

    // one boundary error and one length error
    assert_eq!(link.diag.warning_count() - warnings_before, 2);
}

#[test]
fn undefined_symbol_diagnostic() {
    let mut link = link_with_inputs(&[(
        "x.o",
        "X\n\
         H 1 areas 1 global symbols\n\
         M x\n\
         S foo Ref0000\n",
    )]);

    let files = link.options.link_files.clone();
    parser::parse_object_files(&mut link, true, &files).unwrap();
    link.link_areas();

    let mut report = Vec::new();
    link.check_undefined_symbols(&mut report).unwrap();
    assert_eq!(
        String::from_utf8(report).unwrap(),
        "Undefined Global foo referenced by module x\n"
    );
}

#[test]
fn radix_reverts_at_file_boundary() {
    // the first file switches to hex; the second file's sizes must parse
    // in the default decimal base again
    let mut link = link_with_inputs(&[
        (
            "hex.o",
            "X\n\
             H 1 areas 0 global symbols\n\
             M hexed\n\
             A CODE size 10 flags 0\n",
        ),
        (
            "dec.o",
            "H 1 areas 0 global symbols\n\
             M decimal\n\
             A CODE size 10 flags 0\n",
        ),
    ]);

    let files = link.options.link_files.clone();
    parser::parse_object_files(&mut link, true, &files).unwrap();
    link.link_areas();

    let area = link.areas.area(link.areas.lookup("CODE").unwrap());
    assert_eq!(area.total_size, 0x10 + 10);
}

#[test]
fn relaxation_collapses_half_word_operands() {
    // two half-word byte relocations against a symbol at 0x0123: the
    // first keeps the low byte, the second the high byte; each two-byte
    // slot collapses to one byte
    let mut link = link_with_inputs(&[(
        "m.o",
        "X\n\
         H 1 areas 1 global symbols\n\
         M m\n\
         A CODE size 200 flags 0\n\
         S tab Def0123\n\
         T 00 00 3E 00 00\n\
         R 00 00 00 00 0B 03 00 00\n\
         T 03 00 21 00 00\n\
         R 00 00 00 00 8B 03 00 00\n",
    )]);

    let hex = SharedBuffer::default();
    link.outputs
        .create("m.ihx", Box::new(hex.clone()), Box::new(IhxEncoder), &mut link.diag)
        .unwrap();

    run_both_passes(&mut link);
    link.outputs.close_all(&mut link.diag).unwrap();

    assert_eq!(
        hex.contents(),
        ":020000003E239D\n:020003002101D9\n:00000001FF\n"
    );
    assert_eq!(link.diag.warning_count(), 0);
}

#[test]
fn interbank_rewrite() {
    let mut link = link_with_inputs(&[
        (
            "m0.o",
            "X\n\
             H 1 areas 1 global symbols\n\
             M m0\n\
             A _CODE_0 size 8 flags 0\n\
             S proc Ref0000\n",
        ),
        (
            "m1.o",
            "X\n\
             H 1 areas 1 global symbols\n\
             M m1\n\
             A _CODE_0 size 10 flags 0\n\
             S proc Def0004\n",
        ),
    ]);
    link.banking.set_module_bank("m0", 0);
    link.banking.set_module_bank("m1", 1);

    let hex = SharedBuffer::default();
    link.outputs
        .create("banked.ihx", Box::new(hex.clone()), Box::new(IhxEncoder), &mut link.diag)
        .unwrap();

    let files = link.options.link_files.clone();
    parser::parse_object_files(&mut link, true, &files).unwrap();
    assert!(banking::resolve_interbank_references(&mut link).unwrap());

    // the original name resolves to the surrogate half
    let surrogate = link.symbols.lookup("proc").unwrap();
    let record = link.symbols.get(surrogate);
    assert!(record.is_surrogate());
    assert!(!record.is_defined());
    assert!(record.flags.contains(SymbolFlags::REFERENCED));

    // the stub defines the trampoline under the original name
    let stub = link.virtual_files.get(banking::STUB_FILE_NAME).unwrap();
    assert_eq!(stub.matches("T ").count(), 1, "one trampoline per call");
    assert_eq!(stub.matches("R ").count(), 1);
    assert!(stub.contains("S Banking__switchTo1 Ref0000"));
    assert!(stub.contains("S _BCproc Ref0000"));
    assert!(stub.contains("S proc Def0000"));
    assert!(stub.contains("A _CODE size 0006 flags 0"));

    link.link_areas();

    // the definition is reachable via the surrogate name and still lives
    // in the banked segment of m1
    let definition = link.symbols.lookup("_BCproc").unwrap();
    assert!(link.symbols.get(definition).is_defined());
    let segment = link.symbols.get(definition).segment.unwrap();
    assert_eq!(link.areas.segment_area_name(segment), "_CODE_1");

    // the surrogate now has a trampoline address in the non-banked area
    let trampoline = link.symbols.get(surrogate);
    assert!(trampoline.is_defined());
    let stub_segment = trampoline.segment.unwrap();
    assert_eq!(link.areas.segment_area_name(stub_segment), "_CODE");

    let files = link.options.link_files.clone();
    parser::parse_object_files(&mut link, false, &files).unwrap();
    link.outputs.close_all(&mut link.diag).unwrap();

    // LD BC,#_BCproc ; JP Banking__switchTo1 with the real address 0x0004
    let text = hex.contents();
    assert!(
        text.contains("010400C30000"),
        "trampoline bytes missing from {text}"
    );
}

#[test]
fn library_closure_loads_referenced_members() {
    let dir = std::env::temp_dir().join(format!("gblink-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let member = dir.join("runtime.o");
    std::fs::write(
        &member,
        "X\n\
         H 1 areas 1 global symbols\n\
         M runtime\n\
         A CODE size 2 flags 0\n\
         S helper Def0000\n",
    )
    .unwrap();
    let library_file = dir.join("runtime.lib");
    std::fs::write(&library_file, "runtime\n").unwrap();

    let mut link = link_with_inputs(&[(
        "app.o",
        "X\n\
         H 1 areas 1 global symbols\n\
         M app\n\
         A CODE size 4 flags 0\n\
         S helper Ref0000\n",
    )]);
    assert!(
        link.libraries
            .add_file_path_name(library_file.to_str().unwrap())
    );

    let files = link.options.link_files.clone();
    parser::parse_object_files(&mut link, true, &files).unwrap();
    assert!(!link.symbols.undefined().is_empty());

    library::resolve_undefined_symbols(&mut link).unwrap();
    assert!(link.symbols.undefined().is_empty());
    assert!(link.modules.set_current_by_name("runtime"));

    std::fs::remove_dir_all(&dir).ok();
}
