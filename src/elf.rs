use crate::error::Result;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;
use object::LittleEndian;
use object::ObjectSymbol;

/// Our starting address in memory. We can start memory addresses wherever we like, even from 0.
/// We pick 400k because it's the same as what ld does and because picking a distinctive non-zero
/// value makes it more obvious what's happening if we mix up file and memory offsets.
pub(crate) const IMAGE_BASE: u64 = 0x400_000;

pub(crate) const PAGE_SIZE: u64 = 0x1000;

pub(crate) type File<'data> = object::read::elf::ElfFile64<'data, LittleEndian, &'data [u8]>;
pub(crate) type Symbol<'data, 'file> =
    object::read::elf::ElfSymbol64<'data, 'file, LittleEndian, &'data [u8]>;

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct FileHeader {
    pub(crate) magic: [u8; 4],
    pub(crate) class: u8,
    pub(crate) data: u8,
    pub(crate) ei_version: u8,
    pub(crate) os_abi: u8,
    pub(crate) abi_version: u8,
    pub(crate) padding: [u8; 7],
    pub(crate) ty: u16,
    pub(crate) machine: u16,
    pub(crate) e_version: u32,
    pub(crate) entry_point: u64,
    pub(crate) program_header_offset: u64,
    pub(crate) section_header_offset: u64,
    pub(crate) flags: u32,
    pub(crate) ehsize: u16,
    pub(crate) program_header_entry_size: u16,
    pub(crate) program_header_num: u16,
    pub(crate) section_header_entry_size: u16,
    pub(crate) section_header_num: u16,
    pub(crate) section_names_index: u16,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct ProgramHeader {
    pub(crate) segment_type: u32,
    pub(crate) flags: u32,
    pub(crate) offset: u64,
    pub(crate) virtual_addr: u64,
    pub(crate) physical_addr: u64,
    pub(crate) file_size: u64,
    pub(crate) mem_size: u64,
    pub(crate) alignment: u64,
}

#[derive(Zeroable, Pod, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct SectionHeader {
    pub(crate) name: u32,
    pub(crate) ty: u32,
    pub(crate) flags: u64,
    pub(crate) address: u64,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) link: u32,
    pub(crate) info: u32,
    pub(crate) alignment: u64,
    pub(crate) entsize: u64,
}

#[derive(Zeroable, Pod, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct SymtabEntry {
    pub(crate) name: u32,
    pub(crate) info: u8,
    pub(crate) other: u8,
    pub(crate) shndx: u16,
    pub(crate) value: u64,
    pub(crate) size: u64,
}

#[derive(Zeroable, Pod, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct Rela {
    pub(crate) address: u64,
    pub(crate) info: u64,
    pub(crate) addend: u64,
}

/// Offset in the file where we store the program headers. We always store these straight after
/// the file header.
pub(crate) const PHEADER_OFFSET: u64 = FILE_HEADER_SIZE as u64;

/// These sizes are from the spec (for 64 bit ELF).
pub(crate) const FILE_HEADER_SIZE: u16 = 0x40;
pub(crate) const PROGRAM_HEADER_SIZE: u16 = 0x38;
pub(crate) const SECTION_HEADER_SIZE: u16 = 0x40;

pub(crate) const GOT_ENTRY_SIZE: u64 = 0x8;
pub(crate) const PLT_ENTRY_SIZE: u64 = PLT_ENTRY_TEMPLATE.len() as u64;
pub(crate) const RELA_ENTRY_SIZE: u64 = 0x18;
pub(crate) const SYMTAB_ENTRY_SIZE: u64 = 0x18;

/// An indirect jump through a .got.plt slot. The displacement gets patched in at offset 2. The
/// trailing two bytes pad the entry out to its 8-byte slot.
pub(crate) const PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0x0, 0x0, 0x0, 0x0, // jmp *{relative GOT.PLT address}(%rip)
    0x66, 0x90, // xchg %ax,%ax
];

const _ASSERTS: () = {
    assert!(FILE_HEADER_SIZE as usize == std::mem::size_of::<FileHeader>());
    assert!(PROGRAM_HEADER_SIZE as usize == std::mem::size_of::<ProgramHeader>());
    assert!(SECTION_HEADER_SIZE as usize == std::mem::size_of::<SectionHeader>());
    assert!(SYMTAB_ENTRY_SIZE as usize == std::mem::size_of::<SymtabEntry>());
    assert!(RELA_ENTRY_SIZE as usize == std::mem::size_of::<Rela>());
};

pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelocationKind {
    Absolute,
    Relative,
    GotRelative,
    PltRelative,
    GotTpOff,
    TpOff,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RelocationKindInfo {
    pub(crate) kind: RelocationKind,
    pub(crate) byte_size: usize,
}

impl RelocationKindInfo {
    pub(crate) fn from_raw(r_type: u32) -> Result<Self> {
        let (kind, size) = match r_type {
            object::elf::R_X86_64_64 => (RelocationKind::Absolute, 8),
            object::elf::R_X86_64_32 | object::elf::R_X86_64_32S => (RelocationKind::Absolute, 4),
            object::elf::R_X86_64_16 => (RelocationKind::Absolute, 2),
            object::elf::R_X86_64_8 => (RelocationKind::Absolute, 1),
            object::elf::R_X86_64_PC64 => (RelocationKind::Relative, 8),
            object::elf::R_X86_64_PC32 => (RelocationKind::Relative, 4),
            object::elf::R_X86_64_PC16 => (RelocationKind::Relative, 2),
            object::elf::R_X86_64_PC8 => (RelocationKind::Relative, 1),
            object::elf::R_X86_64_PLT32 => (RelocationKind::PltRelative, 4),
            object::elf::R_X86_64_GOTPCREL
            | object::elf::R_X86_64_GOTPCRELX
            | object::elf::R_X86_64_REX_GOTPCRELX => (RelocationKind::GotRelative, 4),
            object::elf::R_X86_64_GOTTPOFF => (RelocationKind::GotTpOff, 4),
            object::elf::R_X86_64_TPOFF32 => (RelocationKind::TpOff, 4),
            _ => bail!("Unsupported relocation type {r_type}"),
        };
        Ok(Self {
            kind,
            byte_size: size,
        })
    }
}

pub(crate) fn rel_type(rel: &object::Relocation) -> Result<u32> {
    match rel.flags() {
        object::RelocationFlags::Elf { r_type } => Ok(r_type),
        other => bail!("Unsupported relocation flags {other:?}"),
    }
}

pub(crate) fn st_type(st_info: u8) -> u8 {
    st_info & 0xf
}

pub(crate) fn symbol_info(sym: &Symbol) -> (u8, u8) {
    let object::SymbolFlags::Elf { st_info, st_other } = sym.flags() else {
        unreachable!();
    };
    (st_info, st_other)
}

pub(crate) fn raw_file_header(data: &[u8]) -> Result<&object::elf::FileHeader64<LittleEndian>> {
    const LEN: usize = std::mem::size_of::<object::elf::FileHeader64<LittleEndian>>();
    if data.len() < LEN {
        bail!("File is too short to contain an ELF header");
    }
    object::from_bytes(&data[..LEN])
        .map(|(header, _)| header)
        .map_err(|()| anyhow::anyhow!("Invalid ELF header"))
}

/// Returns the raw section header table. We read this directly rather than via the `object`
/// crate's section API because we need fields like sh_entsize and sh_info that the generic API
/// doesn't expose.
pub(crate) fn raw_section_headers<'data>(
    data: &'data [u8],
) -> Result<&'data [object::elf::SectionHeader64<LittleEndian>]> {
    let e = LittleEndian;
    let header = raw_file_header(data)?;
    let offset = header.e_shoff.get(e) as usize;
    let count = header.e_shnum.get(e) as usize;
    if count == 0 && offset != 0 {
        bail!("Extended section numbering is not supported");
    }
    let size = count * SECTION_HEADER_SIZE as usize;
    if data.len() < offset + size {
        bail!("Section header table extends past end of file");
    }
    object::slice_from_bytes(&data[offset..offset + size], count)
        .map(|(headers, _)| headers)
        .map_err(|()| anyhow::anyhow!("Invalid section header table"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(8, 8), 8);
        assert_eq!(align_to(9, 16), 16);
        assert_eq!(align_to(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn test_relocation_decode() {
        let r = RelocationKindInfo::from_raw(object::elf::R_X86_64_64).unwrap();
        assert_eq!(r.byte_size, 8);
        assert_eq!(r.kind, RelocationKind::Absolute);
        let r = RelocationKindInfo::from_raw(object::elf::R_X86_64_PC32).unwrap();
        assert_eq!(r.byte_size, 4);
        assert_eq!(r.kind, RelocationKind::Relative);
        let r = RelocationKindInfo::from_raw(object::elf::R_X86_64_REX_GOTPCRELX).unwrap();
        assert_eq!(r.kind, RelocationKind::GotRelative);
        assert!(RelocationKindInfo::from_raw(object::elf::R_X86_64_TLSGD).is_err());
    }
}
