//! End-to-end tests that synthesise small relocatable objects and archives, link them, then
//! re-parse the output and assert on its structure. Objects are built byte-by-byte rather than
//! compiled so the suite doesn't depend on a C toolchain being installed.

use anyhow::Context;
use object::Object;
use object::ObjectSection;
use object::ObjectSegment;
use object::ObjectSymbol;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;

type Result<T = (), E = anyhow::Error> = core::result::Result<T, E>;

const PAGE: u64 = 0x1000;

/// bf 01 00 00 00  mov $1, %edi
/// b8 3c 00 00 00  mov $60, %eax
/// 0f 05           syscall
const EXIT_ONE: &[u8] = &[
    0xbf, 0x01, 0x00, 0x00, 0x00, 0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05,
];

// ---------------------------------------------------------------------------
// Object file builder
// ---------------------------------------------------------------------------

const SHT_PROGBITS: u32 = 1;
const SHT_NOBITS: u32 = 8;
const SHT_GROUP: u32 = 17;
const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_MERGE: u64 = 0x10;
const SHF_STRINGS: u64 = 0x20;
const SHN_UNDEF: u16 = 0;
const SHN_ABS: u16 = 0xfff1;
const SHN_COMMON: u16 = 0xfff2;
const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_SECTION: u8 = 3;
const SHF_TLS: u64 = 0x400;
const STT_TLS: u8 = 6;
const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;
const R_X86_64_TPOFF32: u32 = 23;
const R_X86_64_REX_GOTPCRELX: u32 = 42;

struct Sec {
    name: String,
    sh_type: u32,
    flags: u64,
    data: Vec<u8>,
    align: u64,
    entsize: u64,
}

#[derive(Clone)]
enum SymPlace {
    Section(usize),
    Undef,
    #[allow(dead_code)]
    Abs,
    Common,
}

struct Sym {
    name: String,
    info: u8,
    place: SymPlace,
    value: u64,
    size: u64,
}

#[derive(Clone)]
enum RelSym {
    Name(String),
    Section(usize),
}

struct Rela {
    offset: u64,
    sym: RelSym,
    r_type: u32,
    addend: i64,
}

#[derive(Default)]
struct Obj {
    sections: Vec<Sec>,
    locals: Vec<Sym>,
    globals: Vec<Sym>,
    relas: Vec<(usize, Vec<Rela>)>,
    groups: Vec<(String, Vec<usize>)>,
}

impl Obj {
    fn new() -> Obj {
        Obj::default()
    }

    fn add_section(
        &mut self,
        name: &str,
        sh_type: u32,
        flags: u64,
        data: Vec<u8>,
        align: u64,
        entsize: u64,
    ) -> usize {
        self.sections.push(Sec {
            name: name.to_owned(),
            sh_type,
            flags,
            data,
            align,
            entsize,
        });
        self.sections.len() - 1
    }

    fn text(&mut self, data: &[u8]) -> usize {
        self.add_section(
            ".text",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            data.to_vec(),
            16,
            0,
        )
    }

    fn strings(&mut self, name: &str, data: &[u8]) -> usize {
        self.add_section(
            name,
            SHT_PROGBITS,
            SHF_ALLOC | SHF_MERGE | SHF_STRINGS,
            data.to_vec(),
            1,
            1,
        )
    }

    fn global(&mut self, name: &str, bind: u8, typ: u8, place: SymPlace, value: u64, size: u64) {
        self.globals.push(Sym {
            name: name.to_owned(),
            info: (bind << 4) | typ,
            place,
            value,
            size,
        });
    }

    fn func(&mut self, name: &str, section: usize, value: u64) {
        self.global(name, STB_GLOBAL, STT_FUNC, SymPlace::Section(section), value, 0);
    }

    fn weak_func(&mut self, name: &str, section: usize, value: u64) {
        self.global(name, STB_WEAK, STT_FUNC, SymPlace::Section(section), value, 0);
    }

    fn undef(&mut self, name: &str) {
        self.global(name, STB_GLOBAL, 0, SymPlace::Undef, 0, 0);
    }

    fn common(&mut self, name: &str, size: u64, align: u64) {
        self.global(name, STB_GLOBAL, STT_OBJECT, SymPlace::Common, align, size);
    }

    /// Adds a local STT_SECTION symbol for `section` and returns a relocation reference to it.
    fn section_symbol(&mut self, section: usize) -> RelSym {
        self.locals.push(Sym {
            name: String::new(),
            info: STT_SECTION,
            place: SymPlace::Section(section),
            value: 0,
            size: 0,
        });
        RelSym::Section(section)
    }

    fn rela(&mut self, section: usize, offset: u64, sym: RelSym, r_type: u32, addend: i64) {
        if let Some(entry) = self.relas.iter_mut().find(|(s, _)| *s == section) {
            entry.1.push(Rela {
                offset,
                sym,
                r_type,
                addend,
            });
            return;
        }
        self.relas.push((
            section,
            vec![Rela {
                offset,
                sym,
                r_type,
                addend,
            }],
        ));
    }

    fn group(&mut self, signature: &str, members: &[usize]) {
        self.groups.push((signature.to_owned(), members.to_vec()));
    }

    fn build(&self) -> Vec<u8> {
        // Final section index layout:
        //   0: SHT_NULL
        //   1..=U: user sections
        //   then one SHT_GROUP per group
        //   then one SHT_RELA per section with relocations
        //   then .symtab, .strtab, .shstrtab
        let num_user = self.sections.len();
        let first_group = 1 + num_user;
        let first_rela = first_group + self.groups.len();
        let symtab_index = first_rela + self.relas.len();
        let strtab_index = symtab_index + 1;
        let shstrtab_index = strtab_index + 1;
        let num_sections = shstrtab_index + 1;

        // Symbol table: null, locals, globals.
        let mut symtab = Vec::new();
        let mut strtab = vec![0u8];
        let sym_entry = |sym: &Sym, strtab: &mut Vec<u8>| -> Vec<u8> {
            let name_offset = if sym.name.is_empty() {
                0
            } else {
                let offset = strtab.len() as u32;
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
                offset
            };
            let shndx: u16 = match sym.place {
                SymPlace::Section(i) => (1 + i) as u16,
                SymPlace::Undef => SHN_UNDEF,
                SymPlace::Abs => SHN_ABS,
                SymPlace::Common => SHN_COMMON,
            };
            let mut entry = Vec::with_capacity(24);
            entry.extend_from_slice(&name_offset.to_le_bytes());
            entry.push(sym.info);
            entry.push(0);
            entry.extend_from_slice(&shndx.to_le_bytes());
            entry.extend_from_slice(&sym.value.to_le_bytes());
            entry.extend_from_slice(&sym.size.to_le_bytes());
            entry
        };
        symtab.extend_from_slice(&[0u8; 24]);
        for sym in &self.locals {
            let entry = sym_entry(sym, &mut strtab);
            symtab.extend_from_slice(&entry);
        }
        for sym in &self.globals {
            let entry = sym_entry(sym, &mut strtab);
            symtab.extend_from_slice(&entry);
        }
        let first_global_sym = 1 + self.locals.len();
        let sym_index = |rel: &RelSym| -> u64 {
            match rel {
                RelSym::Name(name) => {
                    let position = self
                        .globals
                        .iter()
                        .position(|s| &s.name == name)
                        .expect("relocation against unknown symbol");
                    (first_global_sym + position) as u64
                }
                RelSym::Section(section) => {
                    let position = self
                        .locals
                        .iter()
                        .position(|s| {
                            s.info == STT_SECTION
                                && matches!(s.place, SymPlace::Section(i) if i == *section)
                        })
                        .expect("no section symbol for relocation");
                    (1 + position) as u64
                }
            }
        };

        // Section name table.
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        let add_name = |name: &str, shstrtab: &mut Vec<u8>| -> u32 {
            let offset = shstrtab.len() as u32;
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
            offset
        };
        for sec in &self.sections {
            let offset = add_name(&sec.name, &mut shstrtab);
            name_offsets.push(offset);
        }
        let group_name = add_name(".group", &mut shstrtab);
        let mut rela_names = Vec::new();
        for (section, _) in &self.relas {
            let name = format!(".rela{}", self.sections[*section].name);
            rela_names.push(add_name(&name, &mut shstrtab));
        }
        let symtab_name = add_name(".symtab", &mut shstrtab);
        let strtab_name = add_name(".strtab", &mut shstrtab);
        let shstrtab_name = add_name(".shstrtab", &mut shstrtab);

        // Section contents in file order.
        struct OutSec {
            name_offset: u32,
            sh_type: u32,
            flags: u64,
            data: Vec<u8>,
            align: u64,
            entsize: u64,
            link: u32,
            info: u32,
            nobits_size: u64,
        }
        let mut out_sections = Vec::with_capacity(num_sections);
        out_sections.push(OutSec {
            name_offset: 0,
            sh_type: 0,
            flags: 0,
            data: Vec::new(),
            align: 0,
            entsize: 0,
            link: 0,
            info: 0,
            nobits_size: 0,
        });
        for (i, sec) in self.sections.iter().enumerate() {
            let nobits = sec.sh_type == SHT_NOBITS;
            out_sections.push(OutSec {
                name_offset: name_offsets[i],
                sh_type: sec.sh_type,
                flags: sec.flags,
                data: if nobits { Vec::new() } else { sec.data.clone() },
                align: sec.align,
                entsize: sec.entsize,
                link: 0,
                info: 0,
                nobits_size: if nobits { sec.data.len() as u64 } else { 0 },
            });
        }
        for (signature, members) in &self.groups {
            let mut data = Vec::new();
            data.extend_from_slice(&1u32.to_le_bytes()); // GRP_COMDAT
            for member in members {
                data.extend_from_slice(&((1 + member) as u32).to_le_bytes());
            }
            let signature_index = sym_index(&RelSym::Name(signature.clone())) as u32;
            out_sections.push(OutSec {
                name_offset: group_name,
                sh_type: SHT_GROUP,
                flags: 0,
                data,
                align: 4,
                entsize: 4,
                link: symtab_index as u32,
                info: signature_index,
                nobits_size: 0,
            });
        }
        for (i, (section, relas)) in self.relas.iter().enumerate() {
            let mut data = Vec::new();
            for rela in relas {
                data.extend_from_slice(&rela.offset.to_le_bytes());
                let info = (sym_index(&rela.sym) << 32) | u64::from(rela.r_type);
                data.extend_from_slice(&info.to_le_bytes());
                data.extend_from_slice(&rela.addend.to_le_bytes());
            }
            out_sections.push(OutSec {
                name_offset: rela_names[i],
                sh_type: 4, // SHT_RELA
                flags: 0x40, // SHF_INFO_LINK
                data,
                align: 8,
                entsize: 24,
                link: symtab_index as u32,
                info: (1 + section) as u32,
                nobits_size: 0,
            });
        }
        out_sections.push(OutSec {
            name_offset: symtab_name,
            sh_type: 2, // SHT_SYMTAB
            flags: 0,
            data: symtab,
            align: 8,
            entsize: 24,
            link: strtab_index as u32,
            info: first_global_sym as u32,
            nobits_size: 0,
        });
        out_sections.push(OutSec {
            name_offset: strtab_name,
            sh_type: 3, // SHT_STRTAB
            flags: 0,
            data: strtab,
            align: 1,
            entsize: 0,
            link: 0,
            info: 0,
            nobits_size: 0,
        });
        out_sections.push(OutSec {
            name_offset: shstrtab_name,
            sh_type: 3,
            flags: 0,
            data: shstrtab,
            align: 1,
            entsize: 0,
            link: 0,
            info: 0,
            nobits_size: 0,
        });
        assert_eq!(out_sections.len(), num_sections);

        // Data blobs after the file header, then the section header table.
        let mut bytes = Vec::new();
        bytes.resize(64, 0);
        let mut offsets = Vec::with_capacity(num_sections);
        for sec in &out_sections {
            let align = sec.align.max(1) as usize;
            while bytes.len() % align != 0 {
                bytes.push(0);
            }
            offsets.push(bytes.len() as u64);
            bytes.extend_from_slice(&sec.data);
        }
        while bytes.len() % 8 != 0 {
            bytes.push(0);
        }
        let shoff = bytes.len() as u64;
        for (i, sec) in out_sections.iter().enumerate() {
            let size = if sec.nobits_size > 0 {
                sec.nobits_size
            } else {
                sec.data.len() as u64
            };
            bytes.extend_from_slice(&sec.name_offset.to_le_bytes());
            bytes.extend_from_slice(&sec.sh_type.to_le_bytes());
            bytes.extend_from_slice(&sec.flags.to_le_bytes());
            bytes.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
            bytes.extend_from_slice(&offsets[i].to_le_bytes());
            bytes.extend_from_slice(&size.to_le_bytes());
            bytes.extend_from_slice(&sec.link.to_le_bytes());
            bytes.extend_from_slice(&sec.info.to_le_bytes());
            bytes.extend_from_slice(&sec.align.to_le_bytes());
            bytes.extend_from_slice(&sec.entsize.to_le_bytes());
        }

        // Finally the ELF header.
        let header = &mut bytes[..64];
        header[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        header[4] = 2; // 64 bit
        header[5] = 1; // little endian
        header[6] = 1; // EV_CURRENT
        header[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        header[18..20].copy_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
        header[20..24].copy_from_slice(&1u32.to_le_bytes());
        header[40..48].copy_from_slice(&shoff.to_le_bytes());
        header[52..54].copy_from_slice(&64u16.to_le_bytes()); // ehsize
        header[58..60].copy_from_slice(&64u16.to_le_bytes()); // shentsize
        header[60..62].copy_from_slice(&(num_sections as u16).to_le_bytes());
        header[62..64].copy_from_slice(&(shstrtab_index as u16).to_le_bytes());
        bytes
    }
}

// ---------------------------------------------------------------------------
// Archive builder
// ---------------------------------------------------------------------------

fn archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut bytes = b"!<arch>\n".to_vec();
    for (name, data) in members {
        let ident = format!("{name}/");
        bytes.extend_from_slice(format!("{ident:<16}").as_bytes());
        bytes.extend_from_slice(b"0           ");
        bytes.extend_from_slice(b"0     ");
        bytes.extend_from_slice(b"0     ");
        bytes.extend_from_slice(b"644     ");
        bytes.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        bytes.extend_from_slice(b"`\n");
        bytes.extend_from_slice(data);
        if data.len() % 2 == 1 {
            bytes.push(b'\n');
        }
    }
    bytes
}

// ---------------------------------------------------------------------------
// Test harness
// ---------------------------------------------------------------------------

struct TestDir {
    dir: PathBuf,
}

impl TestDir {
    fn new(name: &str) -> TestDir {
        let dir = std::env::temp_dir().join(format!("bold-test-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        TestDir { dir }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn out(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

fn link(inputs: &[&PathBuf], output: &Path) -> Result {
    link_with_map(inputs, output, None)
}

fn link_with_map(inputs: &[&PathBuf], output: &Path, map: Option<&Path>) -> Result {
    let args = bold::args::Args {
        inputs: inputs
            .iter()
            .map(|p| bold::args::Input::File(p.to_path_buf()))
            .collect(),
        output: output.to_path_buf(),
        print_map: false,
        map_path: map.map(|p| p.to_path_buf()),
        is_static: true,
        num_threads: NonZeroUsize::new(2).unwrap(),
        time_phases: false,
    };
    bold::link(&args)
}

type ElfOut<'data> = object::read::elf::ElfFile64<'data, object::LittleEndian, &'data [u8]>;

fn parse(data: &[u8]) -> Result<ElfOut> {
    ElfOut::parse(data).context("Failed to parse linked output")
}

fn section_named<'data, 'file>(
    elf: &'file ElfOut<'data>,
    name: &str,
) -> object::read::elf::ElfSection64<'data, 'file, object::LittleEndian, &'data [u8]> {
    elf.sections()
        .find(|s| s.name() == Ok(name))
        .unwrap_or_else(|| panic!("output has no section named {name}"))
}

fn symbol_named<'data, 'file>(
    elf: &'file ElfOut<'data>,
    name: &str,
) -> object::read::elf::ElfSymbol64<'data, 'file, object::LittleEndian, &'data [u8]> {
    elf.symbols()
        .find(|s| s.name() == Ok(name))
        .unwrap_or_else(|| panic!("output has no symbol named {name}"))
}

fn start_object() -> Obj {
    let mut obj = Obj::new();
    let text = obj.text(EXIT_ONE);
    obj.func("_start", text, 0);
    obj
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn hello_world() -> Result {
    let t = TestDir::new("hello_world");
    let a = t.write("a.o", &start_object().build());
    let out = t.out("hello");
    link(&[&a], &out)?;

    let data = std::fs::read(&out)?;
    let elf = parse(&data)?;
    let text = section_named(&elf, ".text");
    assert_eq!(text.data()?, EXIT_ONE);
    assert_eq!(elf.entry(), text.address());
    assert_eq!(symbol_named(&elf, "_start").address(), text.address());

    // The text section has to land in an executable load segment whose address and file
    // offset agree modulo the page size.
    let segment = elf
        .segments()
        .find(|s| {
            s.address() <= text.address() && text.address() < s.address() + s.size()
        })
        .expect(".text is not covered by any load segment");
    let object::SegmentFlags::Elf { p_flags } = segment.flags() else {
        unreachable!();
    };
    assert_eq!(p_flags & 1, 1, "text segment is not executable");
    let (file_start, _) = segment.file_range();
    assert_eq!(segment.address() % PAGE, file_start % PAGE);

    // The output has to be marked executable.
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&out)?.permissions().mode();
    assert_eq!(mode & 0o100, 0o100);
    Ok(())
}

#[test]
fn weak_definition_is_overridden() -> Result {
    let t = TestDir::new("weak_override");
    let mut weak = start_object();
    let text = 0;
    weak.weak_func("foo", text, 4);
    let a = t.write("a.o", &weak.build());

    let mut strong = Obj::new();
    let text = strong.text(&[0x90; 8]);
    strong.func("foo", text, 4);
    let b = t.write("b.o", &strong.build());

    let out = t.out("weak");
    link(&[&a, &b], &out)?;

    let data = std::fs::read(&out)?;
    let elf = parse(&data)?;
    let text = section_named(&elf, ".text");
    // a.o's .text is 12 bytes, so b.o's contribution starts at the next 16-byte boundary.
    let expected = text.address() + 16 + 4;
    assert_eq!(symbol_named(&elf, "foo").address(), expected);
    Ok(())
}

#[test]
fn comdat_groups_are_deduplicated() -> Result {
    let body_first = [0x11u8; 8];
    let body_second = [0x22u8; 8];

    let make = |body: &[u8]| {
        let mut obj = Obj::new();
        let section = obj.add_section(
            ".text.inline_f",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            body.to_vec(),
            8,
            0,
        );
        obj.weak_func("inline_f", section, 0);
        obj.group("inline_f", &[section]);
        obj
    };

    let t = TestDir::new("comdat");
    let a = t.write("a.o", &start_object().build());
    let b = t.write("b.o", &make(&body_first).build());
    let c = t.write("c.o", &make(&body_second).build());
    let out = t.out("comdat");
    link(&[&a, &b, &c], &out)?;

    let data = std::fs::read(&out)?;
    let elf = parse(&data)?;
    let section = section_named(&elf, ".text.inline_f");
    // Only the first file's copy survives.
    assert_eq!(section.data()?, &body_first[..]);
    assert_eq!(
        symbol_named(&elf, "inline_f").address(),
        section.address()
    );
    Ok(())
}

#[test]
fn identical_strings_are_merged() -> Result {
    let strings = b"hello\0world\0";

    let make = || {
        let mut obj = Obj::new();
        let data = obj.add_section(
            ".data",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_WRITE,
            vec![0u8; 8],
            8,
            0,
        );
        let str_section = obj.strings(".rodata.str1.1", strings);
        let reference = obj.section_symbol(str_section);
        // A pointer to "world".
        obj.rela(data, 0, reference, R_X86_64_64, 6);
        obj
    };

    let t = TestDir::new("string_merge");
    let a = t.write("a.o", &start_object().build());
    let b = t.write("b.o", &make().build());
    let c = t.write("c.o", &make().build());
    let out = t.out("strings");
    link(&[&a, &b, &c], &out)?;

    let data = std::fs::read(&out)?;
    let elf = parse(&data)?;
    let merged = section_named(&elf, ".rodata.str1.1");
    let content = merged.data()?;
    // Both inputs carried the same two strings; each survives exactly once.
    assert_eq!(content.len(), 12);
    let world_offset = content
        .windows(6)
        .position(|w| w == b"world\0")
        .expect("merged section lost \"world\"") as u64;
    assert!(content.windows(6).any(|w| w == b"hello\0"));

    // Every copy of the pointer relocates to the single merged copy of "world".
    let expected = (merged.address() + world_offset).to_le_bytes();
    let data_section = section_named(&elf, ".data");
    let bytes = data_section.data()?;
    assert_eq!(&bytes[0..8], &expected);
    assert_eq!(&bytes[8..16], &expected);
    Ok(())
}

#[test]
fn archive_members_are_activated_on_demand() -> Result {
    let t = TestDir::new("archive");

    let mut main = start_object();
    let text = 0;
    main.undef("libx_func");
    main.rela(text, 1, RelSym::Name("libx_func".to_owned()), R_X86_64_PLT32, -4);
    let a = t.write("a.o", &main.build());

    let mut needed = Obj::new();
    let text = needed.text(&[0xc3]);
    needed.func("libx_func", text, 0);

    let mut unneeded = Obj::new();
    let text = unneeded.text(&[0xc3]);
    unneeded.func("other_func", text, 0);

    let lib = t.write(
        "libx.a",
        &archive(&[("m.o", &needed.build()), ("n.o", &unneeded.build())]),
    );
    let out = t.out("archive");
    link(&[&a, &lib], &out)?;

    let data = std::fs::read(&out)?;
    let elf = parse(&data)?;
    assert!(elf.symbols().any(|s| s.name() == Ok("libx_func")));
    assert!(
        !elf.symbols().any(|s| s.name() == Ok("other_func")),
        "unreferenced archive member was activated"
    );
    assert!(elf.symbols().any(|s| s.name() == Ok("m.o")));
    assert!(!elf.symbols().any(|s| s.name() == Ok("n.o")));
    Ok(())
}

#[test]
fn common_symbols_merge_into_bss() -> Result {
    let t = TestDir::new("common");
    let a = t.write("a.o", &start_object().build());

    let mut small = Obj::new();
    small.common("buf", 16, 8);
    let b = t.write("b.o", &small.build());

    let mut large = Obj::new();
    large.common("buf", 64, 16);
    let c = t.write("c.o", &large.build());

    let out = t.out("common");
    link(&[&a, &b, &c], &out)?;

    let data = std::fs::read(&out)?;
    let elf = parse(&data)?;
    let buf = symbol_named(&elf, "buf");
    assert_eq!(buf.size(), 64);
    assert_eq!(buf.address() % 16, 0);
    let bss = section_named(&elf, ".bss");
    assert!(bss.address() <= buf.address());
    assert!(buf.address() + buf.size() <= bss.address() + bss.size());
    Ok(())
}

#[test]
fn output_is_deterministic() -> Result {
    let t = TestDir::new("determinism");
    let mut extra = Obj::new();
    let text = extra.text(&[0x90; 32]);
    extra.func("helper", text, 0);
    let strs = extra.strings(".rodata.str1.1", b"alpha\0beta\0gamma\0");
    let reference = extra.section_symbol(strs);
    extra.rela(text, 8, reference, R_X86_64_64, 6);

    let a = t.write("a.o", &start_object().build());
    let b = t.write("b.o", &extra.build());

    let out1 = t.out("out1");
    let out2 = t.out("out2");
    link(&[&a, &b], &out1)?;
    link(&[&a, &b], &out2)?;
    assert_eq!(std::fs::read(&out1)?, std::fs::read(&out2)?);
    Ok(())
}

#[test]
fn undefined_symbol_is_an_error() {
    let t = TestDir::new("undef_error");
    let mut obj = start_object();
    obj.undef("missing_func");
    obj.rela(0, 1, RelSym::Name("missing_func".to_owned()), R_X86_64_PC32, -4);
    let a = t.write("a.o", &obj.build());
    let out = t.out("never");
    let error = link(&[&a], &out).unwrap_err();
    assert!(error.to_string().contains("missing_func"), "{error}");
}

#[test]
fn duplicate_strong_definitions_are_an_error() {
    let t = TestDir::new("dup_error");
    let a = t.write("a.o", &start_object().build());
    let mut dup = Obj::new();
    let text = dup.text(&[0xc3]);
    dup.func("_start", text, 0);
    let b = t.write("b.o", &dup.build());
    let out = t.out("never");
    let error = link(&[&a, &b], &out).unwrap_err();
    assert!(error.to_string().contains("_start"), "{error}");
}

#[test]
fn missing_entry_symbol_is_an_error() {
    let t = TestDir::new("no_entry");
    let mut obj = Obj::new();
    let text = obj.text(&[0xc3]);
    obj.func("not_start", text, 0);
    let a = t.write("a.o", &obj.build());
    let out = t.out("never");
    let error = link(&[&a], &out).unwrap_err();
    assert!(error.to_string().contains("_start"), "{error}");
}

#[test]
fn got_references_are_indirected() -> Result {
    let t = TestDir::new("got");
    let mut obj = start_object();
    let data = obj.add_section(
        ".data",
        SHT_PROGBITS,
        SHF_ALLOC | SHF_WRITE,
        vec![0xaa; 8],
        8,
        0,
    );
    obj.global(
        "value_sym",
        STB_GLOBAL,
        STT_OBJECT,
        SymPlace::Section(data),
        0,
        8,
    );
    obj.rela(
        0,
        2,
        RelSym::Name("value_sym".to_owned()),
        R_X86_64_REX_GOTPCRELX,
        -4,
    );
    let a = t.write("a.o", &obj.build());
    let out = t.out("got");
    link(&[&a], &out)?;

    let bytes = std::fs::read(&out)?;
    let elf = parse(&bytes)?;
    let got = section_named(&elf, ".got");
    let value_addr = symbol_named(&elf, "value_sym").address();
    // One entry, holding the resolved address of the symbol.
    assert_eq!(got.data()?, &value_addr.to_le_bytes()[..]);

    // The instruction field holds the GOT-relative displacement: G + A - P.
    let text = section_named(&elf, ".text");
    let place = text.address() + 2;
    let expected = (got.address() as i64 - 4 - place as i64) as i32;
    assert_eq!(&text.data()?[2..6], &expected.to_le_bytes());
    Ok(())
}

#[test]
fn tls_local_exec_offsets() -> Result {
    let t = TestDir::new("tls");
    let mut obj = start_object();
    let tdata = obj.add_section(
        ".tdata",
        SHT_PROGBITS,
        SHF_ALLOC | SHF_WRITE | SHF_TLS,
        vec![1, 2, 3, 4, 5, 6, 7, 8],
        8,
        0,
    );
    obj.global(
        "tls_var",
        STB_GLOBAL,
        STT_TLS,
        SymPlace::Section(tdata),
        0,
        8,
    );
    obj.rela(0, 2, RelSym::Name("tls_var".to_owned()), R_X86_64_TPOFF32, 0);
    let a = t.write("a.o", &obj.build());
    let out = t.out("tls");
    link(&[&a], &out)?;

    let bytes = std::fs::read(&out)?;
    let elf = parse(&bytes)?;
    let tdata_section = section_named(&elf, ".tdata");
    let tls = raw_program_headers(&bytes)
        .into_iter()
        .find(|p| p.p_type == 7)
        .expect("output has no PT_TLS segment");
    assert_eq!(tls.vaddr, tdata_section.address());
    assert_eq!(tls.memsz, 8);

    // Local-exec: the variable sits 8 bytes below the thread pointer.
    let text = section_named(&elf, ".text");
    assert_eq!(&text.data()?[2..6], &(-8i32).to_le_bytes());
    Ok(())
}

struct RawPhdr {
    p_type: u32,
    vaddr: u64,
    memsz: u64,
}

/// `object`'s segment iterator only yields PT_LOAD, so for anything else we read the program
/// header table straight out of the file.
fn raw_program_headers(data: &[u8]) -> Vec<RawPhdr> {
    let phoff = u64::from_le_bytes(data[32..40].try_into().unwrap()) as usize;
    let phnum = u16::from_le_bytes(data[56..58].try_into().unwrap()) as usize;
    (0..phnum)
        .map(|i| {
            let b = &data[phoff + i * 56..];
            RawPhdr {
                p_type: u32::from_le_bytes(b[0..4].try_into().unwrap()),
                vaddr: u64::from_le_bytes(b[16..24].try_into().unwrap()),
                memsz: u64::from_le_bytes(b[40..48].try_into().unwrap()),
            }
        })
        .collect()
}

#[test]
fn map_file_reports_layout() -> Result {
    let t = TestDir::new("map");
    let mut extra = Obj::new();
    let text = extra.text(&[0x90; 8]);
    extra.func("helper", text, 0);
    let strings = extra.strings(".rodata.str1.1", b"alpha\0");
    let reference = extra.section_symbol(strings);
    extra.rela(text, 0, reference, R_X86_64_64, 0);

    let a = t.write("a.o", &start_object().build());
    let b = t.write("b.o", &extra.build());
    let out = t.out("map-out");
    let map_path = t.out("output.map");
    link_with_map(&[&a, &b], &out, Some(map_path.as_path()))?;

    let report = std::fs::read_to_string(&map_path)?;
    let data = std::fs::read(&out)?;
    let elf = parse(&data)?;
    let text_section = section_named(&elf, ".text");

    // Header row, then the .text chunk at its final address with both files' contributions
    // and the symbols they define.
    let header = report.lines().next().unwrap_or_default();
    assert!(header.contains("VMA") && header.contains("Symbol"), "{report}");
    assert!(report.contains(&format!("{:x} ", text_section.address())), "{report}");
    assert!(report.contains("a.o:(.text)"), "{report}");
    assert!(report.contains("b.o:(.text)"), "{report}");
    assert!(report.contains("_start"), "{report}");
    assert!(report.contains("helper"), "{report}");

    // Merged pieces are attributed to the input section whose copy won; the identity string
    // in .comment comes from the linker itself.
    assert!(report.contains("b.o:(.rodata.str1.1)"), "{report}");
    assert!(report.contains("<linker>"), "{report}");
    Ok(())
}

#[test]
fn comment_carries_linker_identity() -> Result {
    let t = TestDir::new("comment");
    let a = t.write("a.o", &start_object().build());
    let out = t.out("comment");
    link(&[&a], &out)?;

    let data = std::fs::read(&out)?;
    let elf = parse(&data)?;
    let comment = section_named(&elf, ".comment");
    let content = comment.data()?;
    let needle = b"Linker: bold ";
    assert!(
        content.windows(needle.len()).any(|w| w == needle),
        ".comment doesn't mention the linker"
    );
    Ok(())
}
