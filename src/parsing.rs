//! Parses each input object into the form the rest of the link works with: a slot per section
//! (regular, mergeable or discarded), a slot per symbol (an inline record for locals, an
//! interned ID for globals), and the file's COMDAT groups. Parsing runs in parallel across
//! files; anything that has to be deterministic (interning, COMDAT winners) happens later from
//! the single-threaded phases.

use crate::archive_splitter::InputBytes;
use crate::elf;
use crate::elf::File;
use crate::error::Result;
use crate::hash::hash_bytes;
use crate::input_data::FileId;
use crate::input_data::InputRef;
use crate::layout::OutputSectionId;
use crate::string_merging::MergedSectionId;
use crate::symbol_db::PendingSymbol;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolName;
use anyhow::bail;
use anyhow::Context;
use object::LittleEndian;
use object::Object;
use object::ObjectSection;
use object::ObjectSymbol;
use rayon::prelude::*;
use std::borrow::Cow;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;

pub(crate) struct ObjectFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) file_id: FileId,
    pub(crate) object: Box<File<'data>>,

    /// Whether this file contributes to the output. Command-line objects always do; archive
    /// members only once something references a symbol they define.
    pub(crate) is_alive: AtomicBool,

    /// One slot per section header. Synthetic sections (e.g. `.bss` allocations for common
    /// symbols) get appended after the real ones.
    pub(crate) sections: Vec<SectionSlot<'data>>,

    /// One slot per symbol table entry.
    pub(crate) symbols: Vec<SymbolSlot>,

    pub(crate) first_global: usize,

    pub(crate) comdat_groups: Vec<ComdatGroupRef<'data>>,

    /// Which sections are members of some COMDAT group.
    section_in_comdat: Vec<bool>,

    /// Global symbols waiting to be interned. Drained when the symbol DB is built.
    pub(crate) pending_symbols: Vec<PendingSymbol<'data>>,

    // How many GOT / thread-pointer GOT / PLT slots this file's symbols need. Incremented
    // atomically during relocation scanning, read after the scanning barrier to compute each
    // file's base offsets into those tables.
    pub(crate) num_got: AtomicU32,
    pub(crate) num_gottp: AtomicU32,
    pub(crate) num_plt: AtomicU32,
}

pub(crate) enum SymbolSlot {
    Local(LocalSymbol),
    Global(SymbolId),
}

pub(crate) const SLOT_NONE: u32 = u32::MAX;

pub(crate) struct LocalSymbol {
    /// GOT/PLT demand flags, same bit values as the global symbol flags.
    pub(crate) needs: AtomicU8,
    pub(crate) got_slot: u32,
    pub(crate) gottp_slot: u32,
    pub(crate) plt_slot: u32,
}

pub(crate) enum SectionSlot<'data> {
    /// The section contributes nothing: symtabs, group sections, sections we drop, and COMDAT
    /// losers.
    Discard,
    Regular(Section<'data>),
    Merge(MergeSection<'data>),
}

pub(crate) struct Section<'data> {
    pub(crate) index: object::SectionIndex,
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) alignment: u64,
    pub(crate) size: u64,

    /// Empty for SHT_NOBITS.
    pub(crate) data: &'data [u8],

    // Assigned during layout.
    pub(crate) output_section: Option<OutputSectionId>,
    pub(crate) output_offset: u64,
}

pub(crate) struct MergeSection<'data> {
    pub(crate) index: object::SectionIndex,
    pub(crate) name: &'data [u8],
    pub(crate) sh_flags: u64,
    pub(crate) sh_type: u32,
    pub(crate) entsize: u64,
    pub(crate) alignment: u64,
    pub(crate) section_data: &'data [u8],

    /// Offset within the input section at which each piece starts.
    pub(crate) piece_offsets: Vec<u64>,
    pub(crate) piece_hashes: Vec<u64>,

    /// For each piece, its index within the output merged section. Filled in by the merge
    /// phase, empty before that.
    pub(crate) piece_ids: Vec<u32>,
    pub(crate) merged_id: Option<MergedSectionId>,
}

pub(crate) struct ComdatGroupRef<'data> {
    pub(crate) signature: SymbolName<'data>,

    /// The index of the SHT_GROUP section itself. Used as the deterministic tie-break when two
    /// groups in the same file share a signature.
    pub(crate) group_section: object::SectionIndex,

    pub(crate) members: Vec<object::SectionIndex>,
}

#[tracing::instrument(skip_all, name = "Parse input files")]
pub(crate) fn parse_input_files<'data>(
    inputs: &[InputBytes<'data>],
) -> Result<Vec<ObjectFile<'data>>> {
    inputs
        .par_iter()
        .enumerate()
        .map(|(i, input)| {
            ObjectFile::parse(input, FileId::new(i as u32))
                .with_context(|| format!("Failed to parse {}", input.input))
        })
        .collect()
}

impl<'data> ObjectFile<'data> {
    fn parse(input: &InputBytes<'data>, file_id: FileId) -> Result<ObjectFile<'data>> {
        let data = input.data;
        let object = Box::new(File::parse(data)?);
        let raw_sections = elf::raw_section_headers(data)?;

        let mut file = ObjectFile {
            input: input.input,
            file_id,
            object,
            is_alive: AtomicBool::new(!input.from_archive),
            sections: Vec::with_capacity(raw_sections.len()),
            symbols: Vec::new(),
            first_global: 0,
            comdat_groups: Vec::new(),
            section_in_comdat: vec![false; raw_sections.len()],
            pending_symbols: Vec::new(),
            num_got: AtomicU32::new(0),
            num_gottp: AtomicU32::new(0),
            num_plt: AtomicU32::new(0),
        };
        file.initialize_sections(data, raw_sections)?;
        file.initialize_symbols(input.from_archive)?;
        Ok(file)
    }

    fn initialize_sections(
        &mut self,
        data: &'data [u8],
        raw_sections: &[object::elf::SectionHeader64<LittleEndian>],
    ) -> Result {
        let e = LittleEndian;
        for (index, raw) in raw_sections.iter().enumerate() {
            let index = object::SectionIndex(index);
            let sh_type = raw.sh_type.get(e);
            let sh_flags = raw.sh_flags.get(e);
            let slot = match sh_type {
                object::elf::SHT_NULL
                | object::elf::SHT_SYMTAB
                | object::elf::SHT_STRTAB
                | object::elf::SHT_RELA
                | object::elf::SHT_REL
                | object::elf::SHT_SYMTAB_SHNDX => SectionSlot::Discard,
                object::elf::SHT_GROUP => {
                    self.read_group(data, raw, index)?;
                    SectionSlot::Discard
                }
                _ => {
                    let section = self.object.section_by_index(index)?;
                    let name = section.name_bytes()?;
                    if sh_flags & u64::from(object::elf::SHF_EXCLUDE) != 0
                        || name == b".note.GNU-stack"
                    {
                        SectionSlot::Discard
                    } else if is_merge_candidate(sh_type, sh_flags, raw.sh_entsize.get(e)) {
                        merge_section_slot(&section, raw, index, name)?
                    } else {
                        SectionSlot::Regular(Section {
                            index,
                            name,
                            sh_type,
                            sh_flags,
                            alignment: raw.sh_addralign.get(e).max(1),
                            size: raw.sh_size.get(e),
                            data: section.data()?,
                            output_section: None,
                            output_offset: 0,
                        })
                    }
                }
            };
            self.sections.push(slot);
        }
        Ok(())
    }

    /// Reads a SHT_GROUP section. The section's data is a flags word followed by the section
    /// indices of the group's members; its signature is the name of the symbol that sh_info
    /// points at.
    fn read_group(
        &mut self,
        data: &'data [u8],
        raw: &object::elf::SectionHeader64<LittleEndian>,
        index: object::SectionIndex,
    ) -> Result {
        let e = LittleEndian;
        let offset = raw.sh_offset.get(e) as usize;
        let size = raw.sh_size.get(e) as usize;
        if size < 4 || size % 4 != 0 || data.len() < offset + size {
            bail!("Invalid group section");
        }
        let count = size / 4;
        let words: &[object::U32<LittleEndian>] =
            object::slice_from_bytes(&data[offset..offset + size], count)
                .map(|(words, _)| words)
                .map_err(|()| anyhow::anyhow!("Invalid group section"))?;
        if words[0].get(e) & object::elf::GRP_COMDAT == 0 {
            return Ok(());
        }
        let signature_sym = self
            .object
            .symbol_by_index(object::SymbolIndex(raw.sh_info.get(e) as usize))
            .context("Invalid group signature symbol")?;
        let signature = SymbolName::new(signature_sym.name_bytes()?);
        let members = words[1..]
            .iter()
            .map(|w| object::SectionIndex(w.get(e) as usize))
            .collect::<Vec<_>>();
        for member in &members {
            if member.0 >= self.section_in_comdat.len() {
                bail!("Group member section index out of range");
            }
            self.section_in_comdat[member.0] = true;
        }
        self.comdat_groups.push(ComdatGroupRef {
            signature,
            group_section: index,
            members,
        });
        Ok(())
    }

    fn initialize_symbols(&mut self, from_archive: bool) -> Result {
        for symbol in self.object.symbols() {
            let index = symbol.index().0;
            // Slots are indexed by ELF symbol index; pad in case the iterator skipped any.
            while self.symbols.len() <= index {
                self.symbols.push(SymbolSlot::Local(LocalSymbol::new()));
            }
            let name = symbol.name_bytes()?;
            if symbol.is_local() {
                self.first_global = index + 1;
                continue;
            }
            if name.is_empty() {
                continue;
            }
            let lazy_definition = from_archive && !symbol.is_undefined() && !symbol.is_weak();
            self.pending_symbols.push(PendingSymbol {
                name: SymbolName::new(name),
                sym_index: symbol.index(),
                lazy_definition,
            });
            // A placeholder; the real ID is filled in when the symbol DB is built.
            self.symbols[index] = SymbolSlot::Global(SymbolId::placeholder());
        }
        Ok(())
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn section_in_comdat(&self, index: object::SectionIndex) -> bool {
        self.section_in_comdat.get(index.0).copied().unwrap_or(false)
    }

    /// The name we put in the output symbol table's STT_FILE entry for this object.
    pub(crate) fn symtab_file_name(&self) -> Cow<'data, [u8]> {
        if let Some(entry) = self.input.entry {
            Cow::Borrowed(entry)
        } else {
            Cow::Owned(
                self.input
                    .file
                    .filename
                    .as_os_str()
                    .as_encoded_bytes()
                    .to_vec(),
            )
        }
    }
}

fn is_merge_candidate(sh_type: u32, sh_flags: u64, entsize: u64) -> bool {
    sh_type == object::elf::SHT_PROGBITS
        && sh_flags & u64::from(object::elf::SHF_MERGE) != 0
        && entsize > 0
        && sh_flags & u64::from(object::elf::SHF_WRITE | object::elf::SHF_EXECINSTR) == 0
}

fn merge_section_slot<'data>(
    section: &object::read::elf::ElfSection64<'data, '_, LittleEndian, &'data [u8]>,
    raw: &object::elf::SectionHeader64<LittleEndian>,
    index: object::SectionIndex,
    name: &'data [u8],
) -> Result<SectionSlot<'data>> {
    let e = LittleEndian;
    let section_data = section.data()?;
    let entsize = raw.sh_entsize.get(e);
    let mut piece_offsets = Vec::new();
    let mut piece_hashes = Vec::new();
    if raw.sh_flags.get(e) & u64::from(object::elf::SHF_STRINGS) != 0 {
        // Variable-length entries delimited by null terminators.
        let mut offset = 0;
        let mut remaining = section_data;
        while !remaining.is_empty() {
            let len = memchr::memchr(0, remaining)
                .map(|i| i + 1)
                .with_context(|| {
                    format!(
                        "String in section `{}` is not null-terminated",
                        String::from_utf8_lossy(name)
                    )
                })?;
            let (bytes, rest) = remaining.split_at(len);
            piece_offsets.push(offset);
            piece_hashes.push(hash_bytes(bytes));
            offset += len as u64;
            remaining = rest;
        }
    } else {
        if section_data.len() as u64 % entsize != 0 {
            bail!(
                "Mergeable section `{}` has size {} which is not a multiple of its entry size {}",
                String::from_utf8_lossy(name),
                section_data.len(),
                entsize
            );
        }
        for offset in (0..section_data.len() as u64).step_by(entsize as usize) {
            let bytes = &section_data[offset as usize..(offset + entsize) as usize];
            piece_offsets.push(offset);
            piece_hashes.push(hash_bytes(bytes));
        }
    }
    Ok(SectionSlot::Merge(MergeSection {
        index,
        name,
        sh_flags: raw.sh_flags.get(e),
        sh_type: object::elf::SHT_PROGBITS,
        entsize,
        alignment: raw.sh_addralign.get(e).max(1),
        section_data,
        piece_offsets,
        piece_hashes,
        piece_ids: Vec::new(),
        merged_id: None,
    }))
}

impl<'data> MergeSection<'data> {
    pub(crate) fn num_pieces(&self) -> usize {
        self.piece_offsets.len()
    }

    pub(crate) fn piece_bytes(&self, piece: usize) -> &'data [u8] {
        let start = self.piece_offsets[piece] as usize;
        let end = self
            .piece_offsets
            .get(piece + 1)
            .map(|o| *o as usize)
            .unwrap_or(self.section_data.len());
        &self.section_data[start..end]
    }

    /// Maps a byte offset within the input section to (piece index, offset within the piece).
    pub(crate) fn piece_for_offset(&self, offset: u64) -> Result<(usize, u64)> {
        if self.piece_offsets.is_empty() {
            bail!("Reference into empty mergeable section");
        }
        let piece = match self.piece_offsets.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        Ok((piece, offset - self.piece_offsets[piece]))
    }
}

impl LocalSymbol {
    fn new() -> Self {
        Self {
            needs: AtomicU8::new(0),
            got_slot: SLOT_NONE,
            gottp_slot: SLOT_NONE,
            plt_slot: SLOT_NONE,
        }
    }
}

impl<'data> std::fmt::Display for ObjectFile<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input, f)
    }
}
