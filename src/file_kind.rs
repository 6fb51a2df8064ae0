//! Code for identifying what sort of file we're dealing with based on the bytes of the file.

use crate::elf;
use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) enum FileKind {
    ElfObject,
    Archive,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(b"!<arch>\n") {
            return Ok(FileKind::Archive);
        }
        if !bytes.starts_with(&object::elf::ELFMAG) {
            bail!("Couldn't identify file type");
        }
        let header = elf::raw_file_header(bytes)?;
        if header.e_ident.class != object::elf::ELFCLASS64 {
            bail!("Only 64 bit ELF is supported");
        }
        if header.e_ident.data != object::elf::ELFDATA2LSB {
            bail!("Only little endian is supported");
        }
        match header.e_type.get(LittleEndian) {
            object::elf::ET_REL => Ok(FileKind::ElfObject),
            object::elf::ET_DYN => {
                bail!("Cannot link against a shared object: only static linking is supported")
            }
            t => bail!("Unsupported ELF type {t}"),
        }
    }
}
