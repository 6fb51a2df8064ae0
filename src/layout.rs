//! Decides what goes where in the output file. Inputs are scanned for GOT/PLT demands, every
//! symbol that needs a table slot gets one (files hand out slots from per-file base offsets
//! computed by an exclusive prefix sum, so scanning never contends on a global counter), input
//! sections are bucketed into output sections, and the resulting chunks are laid out into
//! segments with file offsets and virtual addresses.

use crate::elf;
use crate::elf::align_to;
use crate::error::Result;
use crate::input_data::FileId;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::parsing::SymbolSlot;
use crate::parsing::SLOT_NONE;
use crate::string_merging::MergedSectionId;
use crate::string_merging::MergedSections;
use crate::symbol_db::PieceRef;
use crate::symbol_db::ResolvedDb;
use crate::symbol_db::SymbolDef;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolName;
use crate::symbol_db::SyntheticKind;
use crate::symbol_db::NEEDS_GOT;
use crate::symbol_db::NEEDS_GOTTP;
use crate::symbol_db::NEEDS_PLT;
use crate::symbol_db::REFERENCED;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use crossbeam_queue::ArrayQueue;
use object::Object;
use object::ObjectSection;
use object::ObjectSymbol;
use rayon::prelude::*;
use std::borrow::Cow;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct OutputSectionId(u32);

pub(crate) struct OutputSections<'data> {
    pub(crate) sections: Vec<OutputSec<'data>>,
}

pub(crate) struct OutputSec<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) alignment: u64,
    pub(crate) sh_size: u64,

    /// (file, section) pairs in (priority, section index) order; offsets within the output
    /// section were assigned in this order.
    pub(crate) contributors: Vec<(FileId, object::SectionIndex)>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkKind {
    FileHeader,
    ProgramHeaders,
    SectionHeaders,
    OutputSection(OutputSectionId),
    Merged(MergedSectionId),
    Got,
    GotPlt,
    Plt,
    RelaPlt,
    Symtab,
    Strtab,
    Shstrtab,
    /// Only present when emitting something that needs a dynamic loader, which the static
    /// pipeline never does. Retained so the layout walk doesn't need changing when it is.
    #[allow(dead_code)]
    Interp,
}

pub(crate) struct OutputChunk<'data> {
    pub(crate) kind: ChunkKind,
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) entsize: u64,
    pub(crate) alignment: u64,
    pub(crate) sh_size: u64,

    /// Bytes this chunk occupies in the file: equal to sh_size except for SHT_NOBITS.
    pub(crate) file_size: u64,

    pub(crate) sh_offset: u64,
    pub(crate) sh_addr: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,

    /// Output section header index, or `NO_SECTION_INDEX` for the pseudo-chunks (ELF header,
    /// program headers, the section header table itself).
    pub(crate) shndx: u32,
    pub(crate) name_offset: u32,
}

pub(crate) const NO_SECTION_INDEX: u32 = u32::MAX;

/// GOT/PLT slot indices for one global symbol.
#[derive(Clone, Copy)]
pub(crate) struct SlotSet {
    pub(crate) got: u32,
    pub(crate) gottp: u32,
    pub(crate) plt: u32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum SymRef {
    Global(SymbolId),
    Local(FileId, object::SymbolIndex),
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum GotEntry {
    /// The slot holds the resolved address of the symbol.
    Address(SymRef),

    /// The slot holds the symbol's offset from the thread pointer.
    TpOff(SymRef),
}

#[derive(Clone, Copy, Default)]
pub(crate) struct FileSymtabLayout {
    /// Including the leading STT_FILE entry.
    pub(crate) num_locals: u32,
    pub(crate) num_globals: u32,
    pub(crate) local_strings_size: u32,
    pub(crate) global_strings_size: u32,
    pub(crate) local_string_offset: u32,
    pub(crate) global_string_offset: u32,
}

#[derive(Clone, Copy, Default)]
pub(crate) struct EpilogueSymtabLayout {
    pub(crate) num_symbols: u32,
    pub(crate) strings_size: u32,
    pub(crate) string_offset: u32,
}

pub(crate) struct SegmentLayout {
    pub(crate) segment_type: u32,
    pub(crate) flags: u32,
    pub(crate) offset: u64,
    pub(crate) vaddr: u64,
    pub(crate) file_size: u64,
    pub(crate) mem_size: u64,
    pub(crate) alignment: u64,
}

pub(crate) struct Layout<'data> {
    pub(crate) chunks: Vec<OutputChunk<'data>>,
    pub(crate) output_sections: OutputSections<'data>,
    pub(crate) merged: MergedSections<'data>,

    /// Chunk index for each output section / merged section. `usize::MAX` when the section was
    /// empty and got no chunk.
    section_chunk: Vec<usize>,
    merged_chunk: Vec<usize>,

    got_chunk: Option<usize>,
    gotplt_chunk: Option<usize>,
    plt_chunk: Option<usize>,
    pub(crate) symtab_chunk: usize,
    pub(crate) strtab_chunk: usize,

    pub(crate) global_slots: Vec<SlotSet>,
    pub(crate) got_entries: Vec<GotEntry>,
    pub(crate) plt_entries: Vec<SymRef>,

    pub(crate) file_symtabs: Vec<FileSymtabLayout>,
    pub(crate) epilogue_symtab: EpilogueSymtabLayout,

    pub(crate) segments: Vec<SegmentLayout>,
    pub(crate) tls_end: u64,
    pub(crate) entry_address: u64,
    pub(crate) file_size: u64,
    pub(crate) num_section_headers: u32,
    pub(crate) shstrndx: u16,
    pub(crate) shstrtab_content: Vec<u8>,
}

#[tracing::instrument(skip_all, name = "Layout")]
pub(crate) fn compute<'data>(
    files: &mut [ObjectFile<'data>],
    db: &mut ResolvedDb<'data>,
    merged: MergedSections<'data>,
) -> Result<Layout<'data>> {
    let epilogue_counters = scan_relocations(files, db)?;
    let (global_slots, got_entries, plt_entries) =
        assign_table_slots(files, db, &epilogue_counters);
    let output_sections = assign_output_sections(files);
    let (file_symtabs, epilogue_symtab, symtab_totals) = compute_symtab_sizes(files, db)?;

    let mut layout = Layout {
        chunks: Vec::new(),
        section_chunk: vec![usize::MAX; output_sections.sections.len()],
        merged_chunk: vec![usize::MAX; merged.sections.len()],
        output_sections,
        merged,
        got_chunk: None,
        gotplt_chunk: None,
        plt_chunk: None,
        symtab_chunk: 0,
        strtab_chunk: 0,
        global_slots,
        got_entries,
        plt_entries,
        file_symtabs,
        epilogue_symtab,
        segments: Vec::new(),
        tls_end: 0,
        entry_address: 0,
        file_size: 0,
        num_section_headers: 0,
        shstrndx: 0,
        shstrtab_content: Vec::new(),
    };
    layout.build_chunks(symtab_totals);
    layout.assign_addresses(files, db)?;
    Ok(layout)
}

#[derive(Default)]
struct EpilogueCounters {
    num_got: AtomicU32,
    num_gottp: AtomicU32,
    num_plt: AtomicU32,
}

/// Works out which symbols need GOT/PLT table entries based on how they're referenced. Demand
/// flags only ever grow (fetch_or); the first scanner to set a flag bumps the owning file's
/// counter, so each needed slot is counted exactly once.
#[tracing::instrument(skip_all, name = "Scan relocations")]
fn scan_relocations<'data>(
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
) -> Result<EpilogueCounters> {
    let epilogue = EpilogueCounters::default();
    let errors = ArrayQueue::new(1);
    files
        .par_iter()
        .filter(|f| f.is_alive())
        .for_each(|file| {
            let r = scan_file(file, files, db, &epilogue);
            if let Err(error) = r {
                let _ = errors.push(error);
            }
        });
    if let Some(error) = errors.pop() {
        return Err(error);
    }
    Ok(epilogue)
}

fn scan_file<'data>(
    file: &ObjectFile<'data>,
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    epilogue: &EpilogueCounters,
) -> Result {
    for section in file.object.sections() {
        if !matches!(
            file.sections.get(section.index().0),
            Some(SectionSlot::Regular(_))
        ) {
            continue;
        }
        for (_, rel) in section.relocations() {
            scan_relocation(file, files, db, &rel, epilogue).with_context(|| {
                format!(
                    "Failed to scan relocations in section `{}` of {}",
                    String::from_utf8_lossy(section.name_bytes().unwrap_or_default()),
                    file.input
                )
            })?;
        }
    }
    Ok(())
}

fn scan_relocation<'data>(
    file: &ObjectFile<'data>,
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    rel: &object::Relocation,
    epilogue: &EpilogueCounters,
) -> Result {
    let r_type = elf::rel_type(rel)?;
    // Reject relocation types we can't apply before we commit to a layout.
    elf::RelocationKindInfo::from_raw(r_type)?;
    let mut demand = match r_type {
        object::elf::R_X86_64_GOTPCREL
        | object::elf::R_X86_64_GOTPCRELX
        | object::elf::R_X86_64_REX_GOTPCRELX => NEEDS_GOT,
        object::elf::R_X86_64_GOTTPOFF => NEEDS_GOTTP,
        _ => 0,
    };
    let object::RelocationTarget::Symbol(sym_index) = rel.target() else {
        bail!("Unsupported relocation target {:?}", rel.target());
    };
    match &file.symbols[sym_index.0] {
        SymbolSlot::Global(symbol_id) => {
            let def = db.def(*symbol_id);
            // Any reference to an ifunc goes through a canonical PLT entry, since the real
            // address isn't known until its resolver runs at startup.
            if matches!(def, SymbolDef::Defined(d) if d.ifunc) {
                demand |= NEEDS_PLT;
            }
            if demand == 0 {
                return Ok(());
            }
            let previous = db.flags(*symbol_id).fetch_or(demand, Ordering::Relaxed);
            let newly_set = demand & !previous;
            let counters = match def {
                SymbolDef::Defined(d) => {
                    let owner = &files[d.file_id.as_usize()];
                    [&owner.num_got, &owner.num_gottp, &owner.num_plt]
                }
                _ => [&epilogue.num_got, &epilogue.num_gottp, &epilogue.num_plt],
            };
            bump_counters(newly_set, counters);
        }
        SymbolSlot::Local(local) => {
            let symbol = file.object.symbol_by_index(sym_index)?;
            let (st_info, _) = elf::symbol_info(&symbol);
            if elf::st_type(st_info) == object::elf::STT_GNU_IFUNC {
                demand |= NEEDS_PLT;
            }
            if demand == 0 {
                return Ok(());
            }
            let previous = local.needs.fetch_or(demand, Ordering::Relaxed);
            let newly_set = demand & !previous;
            bump_counters(newly_set, [&file.num_got, &file.num_gottp, &file.num_plt]);
        }
    }
    Ok(())
}

fn bump_counters(newly_set: u8, counters: [&AtomicU32; 3]) {
    if newly_set & NEEDS_GOT != 0 {
        counters[0].fetch_add(1, Ordering::Relaxed);
    }
    if newly_set & NEEDS_GOTTP != 0 {
        counters[1].fetch_add(1, Ordering::Relaxed);
    }
    if newly_set & NEEDS_PLT != 0 {
        counters[2].fetch_add(1, Ordering::Relaxed);
    }
}

/// Hands out GOT and PLT slot indices. Files get contiguous ranges in priority order (an
/// exclusive prefix sum over the per-file counters); within a file, slots go to symbols in
/// symbol table order. Symbols nobody owns (undefined weak, linker-defined) come last.
#[tracing::instrument(skip_all, name = "Assign table slots")]
fn assign_table_slots<'data>(
    files: &mut [ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    epilogue: &EpilogueCounters,
) -> (Vec<SlotSet>, Vec<GotEntry>, Vec<SymRef>) {
    let total_got: u32 = files
        .iter()
        .map(|f| f.num_got.load(Ordering::Relaxed) + f.num_gottp.load(Ordering::Relaxed))
        .sum::<u32>()
        + epilogue.num_got.load(Ordering::Relaxed)
        + epilogue.num_gottp.load(Ordering::Relaxed);
    let total_plt: u32 = files
        .iter()
        .map(|f| f.num_plt.load(Ordering::Relaxed))
        .sum::<u32>()
        + epilogue.num_plt.load(Ordering::Relaxed);

    let mut global_slots = vec![SlotSet::default(); db.num_symbols()];
    let mut got_entries = Vec::with_capacity(total_got as usize);
    let mut plt_entries = Vec::with_capacity(total_plt as usize);

    for file in files.iter_mut() {
        let file_id = file.file_id;
        let expected_got = got_entries.len()
            + file.num_got.load(Ordering::Relaxed) as usize
            + file.num_gottp.load(Ordering::Relaxed) as usize;
        let expected_plt = plt_entries.len() + file.num_plt.load(Ordering::Relaxed) as usize;
        for (index, slot) in file.symbols.iter_mut().enumerate() {
            match slot {
                SymbolSlot::Local(local) => {
                    let needs = local.needs.load(Ordering::Relaxed);
                    let reference = SymRef::Local(file_id, object::SymbolIndex(index));
                    if needs & NEEDS_GOT != 0 {
                        local.got_slot = got_entries.len() as u32;
                        got_entries.push(GotEntry::Address(reference));
                    }
                    if needs & NEEDS_GOTTP != 0 {
                        local.gottp_slot = got_entries.len() as u32;
                        got_entries.push(GotEntry::TpOff(reference));
                    }
                    if needs & NEEDS_PLT != 0 {
                        local.plt_slot = plt_entries.len() as u32;
                        plt_entries.push(reference);
                    }
                }
                SymbolSlot::Global(symbol_id) => {
                    let symbol_id = *symbol_id;
                    if !matches!(db.def(symbol_id), SymbolDef::Defined(d)
                        if d.file_id == file_id && d.sym_index.0 == index)
                    {
                        continue;
                    }
                    let needs = db.flags(symbol_id).load(Ordering::Relaxed);
                    let slots = &mut global_slots[symbol_id.as_usize()];
                    let reference = SymRef::Global(symbol_id);
                    if needs & NEEDS_GOT != 0 {
                        slots.got = got_entries.len() as u32;
                        got_entries.push(GotEntry::Address(reference));
                    }
                    if needs & NEEDS_GOTTP != 0 {
                        slots.gottp = got_entries.len() as u32;
                        got_entries.push(GotEntry::TpOff(reference));
                    }
                    if needs & NEEDS_PLT != 0 {
                        slots.plt = plt_entries.len() as u32;
                        plt_entries.push(reference);
                    }
                }
            }
        }
        debug_assert_eq!(got_entries.len(), expected_got);
        debug_assert_eq!(plt_entries.len(), expected_plt);
    }

    // Symbols without an owning file: undefined weak references that still need a table slot.
    for index in 0..db.num_symbols() {
        let symbol_id = SymbolId::from_usize(index);
        if matches!(db.def(symbol_id), SymbolDef::Defined(_)) {
            continue;
        }
        let needs = db.flags(symbol_id).load(Ordering::Relaxed);
        let slots = &mut global_slots[index];
        let reference = SymRef::Global(symbol_id);
        if needs & NEEDS_GOT != 0 && slots.got == SLOT_NONE {
            slots.got = got_entries.len() as u32;
            got_entries.push(GotEntry::Address(reference));
        }
        if needs & NEEDS_GOTTP != 0 && slots.gottp == SLOT_NONE {
            slots.gottp = got_entries.len() as u32;
            got_entries.push(GotEntry::TpOff(reference));
        }
        if needs & NEEDS_PLT != 0 && slots.plt == SLOT_NONE {
            slots.plt = plt_entries.len() as u32;
            plt_entries.push(reference);
        }
    }
    debug_assert_eq!(got_entries.len(), total_got as usize);
    debug_assert_eq!(plt_entries.len(), total_plt as usize);

    (global_slots, got_entries, plt_entries)
}

/// Buckets the live regular input sections into output sections keyed by (name, flags, type)
/// and assigns each input section its offset within the bucket. Runs single-threaded in
/// priority order, which is what makes bucket membership and offsets reproducible.
#[tracing::instrument(skip_all, name = "Assign output sections")]
fn assign_output_sections<'data>(files: &mut [ObjectFile<'data>]) -> OutputSections<'data> {
    const FLAG_KEY_MASK: u64 = (object::elf::SHF_WRITE
        | object::elf::SHF_ALLOC
        | object::elf::SHF_EXECINSTR
        | object::elf::SHF_TLS) as u64;
    let mut sections: Vec<OutputSec<'data>> = Vec::new();
    let mut lookup: ahash::AHashMap<(&'data [u8], u64, u32), OutputSectionId> =
        ahash::AHashMap::new();
    for file in files.iter_mut() {
        if !file.is_alive() {
            continue;
        }
        let file_id = file.file_id;
        for slot in &mut file.sections {
            let SectionSlot::Regular(sec) = slot else {
                continue;
            };
            let key = (sec.name, sec.sh_flags & FLAG_KEY_MASK, sec.sh_type);
            let id = *lookup.entry(key).or_insert_with(|| {
                let id = OutputSectionId(sections.len() as u32);
                sections.push(OutputSec {
                    name: sec.name,
                    sh_type: sec.sh_type,
                    sh_flags: 0,
                    alignment: 1,
                    sh_size: 0,
                    contributors: Vec::new(),
                });
                id
            });
            let output = &mut sections[id.0 as usize];
            output.sh_flags |= sec.sh_flags & !u64::from(object::elf::SHF_GROUP);
            output.alignment = output.alignment.max(sec.alignment);
            let offset = align_to(output.sh_size, sec.alignment);
            output.sh_size = offset + sec.size;
            output.contributors.push((file_id, sec.index));
            sec.output_section = Some(id);
            sec.output_offset = offset;
        }
    }
    OutputSections { sections }
}

const RANK_EHDR: u32 = 0;
const RANK_PHDR: u32 = 1;
const RANK_INTERP: u32 = 5;
const RANK_RO: u32 = 10;
const RANK_RELA_PLT: u32 = 11;
const RANK_TEXT: u32 = 20;
const RANK_PLT: u32 = 21;
const RANK_TDATA: u32 = 30;
const RANK_TBSS: u32 = 31;
const RANK_INIT_ARRAY: u32 = 32;
const RANK_FINI_ARRAY: u32 = 33;
const RANK_PREINIT_ARRAY: u32 = 34;
const RANK_GOT: u32 = 35;
const RANK_GOTPLT: u32 = 40;
const RANK_DATA: u32 = 41;
const RANK_BSS: u32 = 50;
const RANK_NON_ALLOC: u32 = 60;
const RANK_SYMTAB: u32 = 70;
const RANK_STRTAB: u32 = 71;
const RANK_SHSTRTAB: u32 = 72;
const RANK_SHDR: u32 = 80;

fn chunk_rank(chunk: &OutputChunk) -> u32 {
    match chunk.kind {
        ChunkKind::FileHeader => RANK_EHDR,
        ChunkKind::ProgramHeaders => RANK_PHDR,
        ChunkKind::Interp => RANK_INTERP,
        ChunkKind::RelaPlt => RANK_RELA_PLT,
        ChunkKind::Plt => RANK_PLT,
        ChunkKind::Got => RANK_GOT,
        ChunkKind::GotPlt => RANK_GOTPLT,
        ChunkKind::Symtab => RANK_SYMTAB,
        ChunkKind::Strtab => RANK_STRTAB,
        ChunkKind::Shstrtab => RANK_SHSTRTAB,
        ChunkKind::SectionHeaders => RANK_SHDR,
        ChunkKind::OutputSection(_) | ChunkKind::Merged(_) => {
            let flags = chunk.sh_flags;
            if flags & u64::from(object::elf::SHF_ALLOC) == 0 {
                return RANK_NON_ALLOC;
            }
            if flags & u64::from(object::elf::SHF_TLS) != 0 {
                return if chunk.sh_type == object::elf::SHT_NOBITS {
                    RANK_TBSS
                } else {
                    RANK_TDATA
                };
            }
            if flags & u64::from(object::elf::SHF_EXECINSTR) != 0 {
                return RANK_TEXT;
            }
            if flags & u64::from(object::elf::SHF_WRITE) != 0 {
                return match chunk.sh_type {
                    object::elf::SHT_NOBITS => RANK_BSS,
                    object::elf::SHT_INIT_ARRAY => RANK_INIT_ARRAY,
                    object::elf::SHT_FINI_ARRAY => RANK_FINI_ARRAY,
                    object::elf::SHT_PREINIT_ARRAY => RANK_PREINIT_ARRAY,
                    _ => RANK_DATA,
                };
            }
            RANK_RO
        }
    }
}

/// The load segment a rank belongs to, if any.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LoadClass {
    ReadOnly,
    Executable,
    Writable,
}

fn load_class(rank: u32) -> Option<LoadClass> {
    match rank {
        RANK_EHDR..=RANK_RELA_PLT => Some(LoadClass::ReadOnly),
        RANK_TEXT..=RANK_PLT => Some(LoadClass::Executable),
        RANK_TDATA..=RANK_BSS => Some(LoadClass::Writable),
        _ => None,
    }
}

fn is_relro(rank: u32) -> bool {
    (RANK_INIT_ARRAY..=RANK_GOT).contains(&rank)
}

impl<'data> Layout<'data> {
    fn build_chunks(&mut self, symtab_totals: SymtabTotals) {
        let mut chunks = Vec::new();
        chunks.push(OutputChunk::pseudo(
            ChunkKind::FileHeader,
            u64::from(elf::FILE_HEADER_SIZE),
        ));
        // Size is filled in below once we know how many program headers we'll emit.
        chunks.push(OutputChunk::pseudo(ChunkKind::ProgramHeaders, 0));
        for (i, sec) in self.output_sections.sections.iter().enumerate() {
            // Zero-sized output sections still get a chunk (and a header): assemblers routinely
            // emit empty .text/.data sections, and symbols can point into them.
            chunks.push(OutputChunk {
                kind: ChunkKind::OutputSection(OutputSectionId(i as u32)),
                name: sec.name,
                sh_type: sec.sh_type,
                sh_flags: sec.sh_flags,
                entsize: 0,
                alignment: sec.alignment,
                sh_size: sec.sh_size,
                file_size: if sec.sh_type == object::elf::SHT_NOBITS {
                    0
                } else {
                    sec.sh_size
                },
                ..OutputChunk::default()
            });
        }
        for id in self.merged.ids() {
            let sec = self.merged.get(id);
            if sec.sh_size == 0 {
                continue;
            }
            chunks.push(OutputChunk {
                kind: ChunkKind::Merged(id),
                name: sec.name,
                sh_type: sec.sh_type,
                sh_flags: sec.sh_flags,
                entsize: sec.entsize,
                alignment: sec.alignment,
                sh_size: sec.sh_size,
                file_size: sec.sh_size,
                ..OutputChunk::default()
            });
        }
        if !self.got_entries.is_empty() {
            chunks.push(OutputChunk {
                kind: ChunkKind::Got,
                name: b".got",
                sh_type: object::elf::SHT_PROGBITS,
                sh_flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE),
                entsize: elf::GOT_ENTRY_SIZE,
                alignment: 8,
                sh_size: self.got_entries.len() as u64 * elf::GOT_ENTRY_SIZE,
                file_size: self.got_entries.len() as u64 * elf::GOT_ENTRY_SIZE,
                ..OutputChunk::default()
            });
        }
        if !self.plt_entries.is_empty() {
            let plt_size = self.plt_entries.len() as u64;
            chunks.push(OutputChunk {
                kind: ChunkKind::Plt,
                name: b".plt",
                sh_type: object::elf::SHT_PROGBITS,
                sh_flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
                entsize: elf::PLT_ENTRY_SIZE,
                alignment: 8,
                sh_size: plt_size * elf::PLT_ENTRY_SIZE,
                file_size: plt_size * elf::PLT_ENTRY_SIZE,
                ..OutputChunk::default()
            });
            chunks.push(OutputChunk {
                kind: ChunkKind::GotPlt,
                name: b".got.plt",
                sh_type: object::elf::SHT_PROGBITS,
                sh_flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE),
                entsize: elf::GOT_ENTRY_SIZE,
                alignment: 8,
                sh_size: plt_size * elf::GOT_ENTRY_SIZE,
                file_size: plt_size * elf::GOT_ENTRY_SIZE,
                ..OutputChunk::default()
            });
            chunks.push(OutputChunk {
                kind: ChunkKind::RelaPlt,
                name: b".rela.plt",
                sh_type: object::elf::SHT_RELA,
                sh_flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_INFO_LINK),
                entsize: elf::RELA_ENTRY_SIZE,
                alignment: 8,
                sh_size: plt_size * elf::RELA_ENTRY_SIZE,
                file_size: plt_size * elf::RELA_ENTRY_SIZE,
                ..OutputChunk::default()
            });
        }
        chunks.push(OutputChunk {
            kind: ChunkKind::Symtab,
            name: b".symtab",
            sh_type: object::elf::SHT_SYMTAB,
            entsize: elf::SYMTAB_ENTRY_SIZE,
            alignment: 8,
            sh_size: symtab_totals.num_entries * elf::SYMTAB_ENTRY_SIZE,
            file_size: symtab_totals.num_entries * elf::SYMTAB_ENTRY_SIZE,
            sh_info: symtab_totals.first_global as u32,
            ..OutputChunk::default()
        });
        chunks.push(OutputChunk {
            kind: ChunkKind::Strtab,
            name: b".strtab",
            sh_type: object::elf::SHT_STRTAB,
            alignment: 1,
            sh_size: symtab_totals.strings_size,
            file_size: symtab_totals.strings_size,
            ..OutputChunk::default()
        });
        chunks.push(OutputChunk {
            kind: ChunkKind::Shstrtab,
            name: b".shstrtab",
            sh_type: object::elf::SHT_STRTAB,
            alignment: 1,
            ..OutputChunk::default()
        });
        chunks.push(OutputChunk::pseudo(ChunkKind::SectionHeaders, 0));

        let mut order: Vec<usize> = (0..chunks.len()).collect();
        order.sort_by_key(|&i| (chunk_rank(&chunks[i]), i));
        let mut taken: Vec<Option<OutputChunk>> = chunks.into_iter().map(Some).collect();
        self.chunks = order
            .into_iter()
            .map(|i| taken[i].take().unwrap())
            .collect();

        // Section header indices, the name table, and the various cross-references between
        // chunks can only be assigned now that the order is final.
        let mut shstrtab_content = vec![0u8];
        let mut next_index = 1;
        for i in 0..self.chunks.len() {
            let kind = self.chunks[i].kind;
            if matches!(
                kind,
                ChunkKind::FileHeader | ChunkKind::ProgramHeaders | ChunkKind::SectionHeaders
            ) {
                self.chunks[i].shndx = NO_SECTION_INDEX;
            } else {
                self.chunks[i].shndx = next_index;
                next_index += 1;
                self.chunks[i].name_offset = shstrtab_content.len() as u32;
                shstrtab_content.extend_from_slice(self.chunks[i].name);
                shstrtab_content.push(0);
            }
            match kind {
                ChunkKind::OutputSection(id) => self.section_chunk[id.0 as usize] = i,
                ChunkKind::Merged(id) => self.merged_chunk[id.as_usize()] = i,
                ChunkKind::Got => self.got_chunk = Some(i),
                ChunkKind::GotPlt => self.gotplt_chunk = Some(i),
                ChunkKind::Plt => self.plt_chunk = Some(i),
                ChunkKind::Symtab => self.symtab_chunk = i,
                ChunkKind::Strtab => self.strtab_chunk = i,
                _ => {}
            }
        }
        self.num_section_headers = next_index;

        let shstrtab_size = shstrtab_content.len() as u64;
        for chunk in &mut self.chunks {
            match chunk.kind {
                ChunkKind::Shstrtab => {
                    chunk.sh_size = shstrtab_size;
                    chunk.file_size = shstrtab_size;
                }
                ChunkKind::SectionHeaders => {
                    let size = u64::from(elf::SECTION_HEADER_SIZE) * u64::from(self.num_section_headers);
                    chunk.sh_size = size;
                    chunk.file_size = size;
                }
                _ => {}
            }
        }
        self.shstrtab_content = shstrtab_content;
        self.shstrndx = self
            .chunks
            .iter()
            .find(|c| c.kind == ChunkKind::Shstrtab)
            .map(|c| c.shndx as u16)
            .unwrap();

        let symtab_shndx = self.chunks[self.symtab_chunk].shndx;
        let strtab_shndx = self.chunks[self.strtab_chunk].shndx;
        let gotplt_shndx = self.gotplt_chunk.map(|i| self.chunks[i].shndx).unwrap_or(0);
        for chunk in &mut self.chunks {
            match chunk.kind {
                ChunkKind::Symtab => chunk.sh_link = strtab_shndx,
                ChunkKind::RelaPlt => {
                    chunk.sh_link = symtab_shndx;
                    chunk.sh_info = gotplt_shndx;
                }
                _ => {}
            }
        }
    }

    /// Walks the chunks in order, bumping a virtual address cursor and a file offset cursor in
    /// lockstep. Both get page-aligned whenever a new load segment starts, which keeps file
    /// offsets and addresses congruent modulo the page size as the loader requires. NOBITS
    /// chunks consume address space but no file bytes; TLS NOBITS consumes neither (it only
    /// exists inside the TLS template).
    fn assign_addresses(&mut self, files: &[ObjectFile<'data>], db: &mut ResolvedDb) -> Result {
        let phnum = self.count_program_headers();
        for chunk in &mut self.chunks {
            if chunk.kind == ChunkKind::ProgramHeaders {
                let size = u64::from(elf::PROGRAM_HEADER_SIZE) * phnum;
                chunk.sh_size = size;
                chunk.file_size = size;
            }
        }

        let mut file_cursor = 0u64;
        let mut mem_cursor = elf::IMAGE_BASE;
        let mut previous_class = None;
        let mut markers = Markers::default();
        for chunk in &mut self.chunks {
            let rank = chunk_rank(chunk);
            let class = load_class(rank);
            let is_alloc = class.is_some();
            if is_alloc && class != previous_class && previous_class.is_some() {
                file_cursor = align_to(file_cursor, elf::PAGE_SIZE);
                mem_cursor = align_to(mem_cursor, elf::PAGE_SIZE);
            }
            if is_alloc {
                previous_class = class;
            }
            let alignment = chunk.alignment.max(1);
            if chunk.file_size > 0 || !is_alloc {
                file_cursor = align_to(file_cursor, alignment);
            }
            chunk.sh_offset = file_cursor;
            if is_alloc {
                mem_cursor = align_to(mem_cursor, alignment);
                chunk.sh_addr = mem_cursor;
            }
            let is_tls_nobits = chunk.sh_type == object::elf::SHT_NOBITS
                && chunk.sh_flags & u64::from(object::elf::SHF_TLS) != 0;
            file_cursor += chunk.file_size;
            if is_alloc && !is_tls_nobits {
                mem_cursor += chunk.sh_size;
            }
            markers.update(chunk, rank, mem_cursor);
        }
        self.file_size = file_cursor;
        self.segments = build_segments(&self.chunks, phnum);
        self.tls_end = self
            .segments
            .iter()
            .find(|s| s.segment_type == object::elf::PT_TLS)
            .map(|s| align_to(s.vaddr + s.mem_size, s.alignment.max(1)))
            .unwrap_or(0);

        self.resolve_synthetic_symbols(db, &markers);
        self.entry_address = self.lookup_entry(files, db)?;
        Ok(())
    }

    fn count_program_headers(&self) -> u64 {
        let mut ranks: Vec<u32> = self.chunks.iter().map(chunk_rank).collect();
        ranks.dedup();
        let has_exec = ranks.iter().any(|&r| load_class(r) == Some(LoadClass::Executable));
        let has_rw = ranks.iter().any(|&r| load_class(r) == Some(LoadClass::Writable));
        let has_tls = ranks.iter().any(|&r| (RANK_TDATA..=RANK_TBSS).contains(&r));
        let has_relro = ranks.iter().any(|&r| is_relro(r));
        // PHDR + read-only load are always present.
        2 + u64::from(has_exec)
            + u64::from(has_rw)
            + u64::from(has_tls)
            + u64::from(has_relro)
    }

    fn resolve_synthetic_symbols(&self, db: &mut ResolvedDb, markers: &Markers) {
        for def in &mut db.defs {
            let SymbolDef::Synthetic(kind) = *def else {
                continue;
            };
            let value = match kind {
                SyntheticKind::EhdrStart => elf::IMAGE_BASE,
                SyntheticKind::Etext => markers.text_end,
                SyntheticKind::Edata => markers.data_end,
                SyntheticKind::End => markers.alloc_end,
                SyntheticKind::BssStart => markers.bss_start.unwrap_or(markers.data_end),
                SyntheticKind::InitArrayStart => markers.init_array.0,
                SyntheticKind::InitArrayEnd => markers.init_array.1,
                SyntheticKind::FiniArrayStart => markers.fini_array.0,
                SyntheticKind::FiniArrayEnd => markers.fini_array.1,
                SyntheticKind::PreinitArrayStart => markers.preinit_array.0,
                SyntheticKind::PreinitArrayEnd => markers.preinit_array.1,
                SyntheticKind::RelaIpltStart => markers.rela_iplt.0,
                SyntheticKind::RelaIpltEnd => markers.rela_iplt.1,
            };
            *def = SymbolDef::LinkerDefined {
                value,
                shndx: object::elf::SHN_ABS,
            };
        }
    }

    fn lookup_entry(&self, files: &[ObjectFile<'data>], db: &ResolvedDb) -> Result<u64> {
        let symbol_id = db
            .symbol_id(&SymbolName::new(b"_start"))
            .ok_or_else(|| anyhow!("Entry symbol `_start` is not defined"))?;
        if !matches!(db.def(symbol_id), SymbolDef::Defined(_)) {
            bail!("Entry symbol `_start` is not defined");
        }
        self.symbol_address(files, db, symbol_id)
    }

    pub(crate) fn chunk_for_section(&self, id: OutputSectionId) -> &OutputChunk<'data> {
        &self.chunks[self.section_chunk[id.0 as usize]]
    }

    pub(crate) fn chunk_for_merged(&self, id: MergedSectionId) -> &OutputChunk<'data> {
        &self.chunks[self.merged_chunk[id.as_usize()]]
    }

    pub(crate) fn piece_address(&self, piece_ref: &PieceRef) -> u64 {
        let chunk = self.chunk_for_merged(piece_ref.merged);
        let piece = self.merged.get(piece_ref.merged).piece(piece_ref.piece);
        chunk.sh_addr + piece.output_offset + piece_ref.offset
    }

    /// The address of an input section's bytes within the output image. None for discarded
    /// sections; merged sections don't have a single address, so they return None too and the
    /// caller goes through pieces instead.
    pub(crate) fn section_address(
        &self,
        file: &ObjectFile<'data>,
        section_index: object::SectionIndex,
    ) -> Option<u64> {
        match file.sections.get(section_index.0)? {
            SectionSlot::Regular(sec) => {
                let chunk = self.chunk_for_section(sec.output_section?);
                Some(chunk.sh_addr + sec.output_offset)
            }
            _ => None,
        }
    }

    /// Resolves a global symbol to its address in the output image, routing through its piece,
    /// its section, or its raw value as appropriate.
    pub(crate) fn symbol_address(
        &self,
        files: &[ObjectFile<'data>],
        db: &ResolvedDb,
        symbol_id: SymbolId,
    ) -> Result<u64> {
        match db.def(symbol_id) {
            SymbolDef::Defined(d) => {
                if let Some(piece_ref) = &d.piece {
                    return Ok(self.piece_address(piece_ref));
                }
                match d.section {
                    Some(section_index) => {
                        let file = &files[d.file_id.as_usize()];
                        let base = self.section_address(file, section_index).ok_or_else(|| {
                            anyhow!(
                                "Symbol `{}` is defined in a discarded section of {}",
                                db.name(symbol_id),
                                file.input
                            )
                        })?;
                        Ok(base + d.value)
                    }
                    None => Ok(d.value),
                }
            }
            SymbolDef::LinkerDefined { value, .. } => Ok(*value),
            SymbolDef::Undefined | SymbolDef::Lazy { .. } => Ok(0),
            SymbolDef::Common { .. } | SymbolDef::Synthetic(_) => {
                bail!(
                    "Internal error: unconverted symbol `{}` survived to layout",
                    db.name(symbol_id)
                )
            }
        }
    }

    /// Like `symbol_address`, but ifuncs resolve to their canonical PLT entry since their real
    /// address is only computed at run time.
    pub(crate) fn runtime_symbol_address(
        &self,
        files: &[ObjectFile<'data>],
        db: &ResolvedDb,
        symbol_id: SymbolId,
    ) -> Result<u64> {
        if matches!(db.def(symbol_id), SymbolDef::Defined(d) if d.ifunc) {
            let plt = self.global_slots[symbol_id.as_usize()].plt;
            if plt != SLOT_NONE {
                return Ok(self.plt_address(plt));
            }
        }
        self.symbol_address(files, db, symbol_id)
    }

    pub(crate) fn got_address(&self, slot: u32) -> u64 {
        debug_assert_ne!(slot, SLOT_NONE);
        self.chunks[self.got_chunk.unwrap()].sh_addr + u64::from(slot) * elf::GOT_ENTRY_SIZE
    }

    pub(crate) fn gotplt_address(&self, slot: u32) -> u64 {
        self.chunks[self.gotplt_chunk.unwrap()].sh_addr + u64::from(slot) * elf::GOT_ENTRY_SIZE
    }

    pub(crate) fn plt_address(&self, slot: u32) -> u64 {
        self.chunks[self.plt_chunk.unwrap()].sh_addr + u64::from(slot) * elf::PLT_ENTRY_SIZE
    }

    /// The output symbol table's section index for a resolved global.
    pub(crate) fn symbol_shndx(
        &self,
        files: &[ObjectFile<'data>],
        db: &ResolvedDb,
        symbol_id: SymbolId,
    ) -> u16 {
        match db.def(symbol_id) {
            SymbolDef::Defined(d) => {
                if let Some(piece_ref) = &d.piece {
                    return self.chunk_for_merged(piece_ref.merged).shndx as u16;
                }
                match d.section {
                    Some(section_index) => {
                        let file = &files[d.file_id.as_usize()];
                        match &file.sections[section_index.0] {
                            SectionSlot::Regular(sec) => sec
                                .output_section
                                .map(|id| self.chunk_for_section(id).shndx as u16)
                                .unwrap_or(object::elf::SHN_ABS),
                            _ => object::elf::SHN_ABS,
                        }
                    }
                    None => object::elf::SHN_ABS,
                }
            }
            SymbolDef::LinkerDefined { shndx, .. } => *shndx,
            _ => object::elf::SHN_UNDEF,
        }
    }
}

#[derive(Default)]
struct Markers {
    text_end: u64,
    data_end: u64,
    alloc_end: u64,
    bss_start: Option<u64>,
    init_array: (u64, u64),
    fini_array: (u64, u64),
    preinit_array: (u64, u64),
    rela_iplt: (u64, u64),
}

impl Markers {
    fn update(&mut self, chunk: &OutputChunk, rank: u32, mem_cursor: u64) {
        let Some(class) = load_class(rank) else {
            return;
        };
        self.alloc_end = self.alloc_end.max(mem_cursor);
        if class == LoadClass::Executable {
            self.text_end = self.text_end.max(mem_cursor);
        }
        if chunk.file_size > 0 {
            self.data_end = self.data_end.max(mem_cursor);
        }
        if rank == RANK_BSS && self.bss_start.is_none() {
            self.bss_start = Some(chunk.sh_addr);
        }
        let bounds = (chunk.sh_addr, chunk.sh_addr + chunk.sh_size);
        match chunk.sh_type {
            object::elf::SHT_INIT_ARRAY => self.init_array = bounds,
            object::elf::SHT_FINI_ARRAY => self.fini_array = bounds,
            object::elf::SHT_PREINIT_ARRAY => self.preinit_array = bounds,
            _ => {}
        }
        if chunk.kind == ChunkKind::RelaPlt {
            self.rela_iplt = bounds;
        }
    }
}

fn build_segments(chunks: &[OutputChunk], phnum: u64) -> Vec<SegmentLayout> {
    struct Range {
        offset: u64,
        vaddr: u64,
        file_end: u64,
        mem_end: u64,
        align: u64,
        present: bool,
    }
    impl Range {
        fn new() -> Self {
            Range {
                offset: 0,
                vaddr: 0,
                file_end: 0,
                mem_end: 0,
                align: 1,
                present: false,
            }
        }

        fn add(&mut self, chunk: &OutputChunk, include_nobits_mem: bool) {
            if !self.present {
                self.offset = chunk.sh_offset;
                self.vaddr = chunk.sh_addr;
                self.present = true;
            }
            if chunk.file_size > 0 {
                self.file_end = self.file_end.max(chunk.sh_offset + chunk.file_size);
            }
            let mem_end = chunk.sh_addr + chunk.sh_size;
            if chunk.file_size > 0 || include_nobits_mem {
                self.mem_end = self.mem_end.max(mem_end);
            }
            self.align = self.align.max(chunk.alignment);
        }

        fn to_segment(&self, segment_type: u32, flags: u32, alignment: u64) -> SegmentLayout {
            SegmentLayout {
                segment_type,
                flags,
                offset: self.offset,
                vaddr: self.vaddr,
                file_size: self.file_end.saturating_sub(self.offset),
                mem_size: self.mem_end.saturating_sub(self.vaddr),
                alignment,
            }
        }
    }

    let mut ro = Range::new();
    let mut exec = Range::new();
    let mut rw = Range::new();
    let mut tls = Range::new();
    let mut relro = Range::new();
    for chunk in chunks {
        let rank = chunk_rank(chunk);
        let is_tls = (RANK_TDATA..=RANK_TBSS).contains(&rank);
        match load_class(rank) {
            Some(LoadClass::ReadOnly) => ro.add(chunk, true),
            Some(LoadClass::Executable) => exec.add(chunk, true),
            // TLS NOBITS doesn't take up address space in the load segment, only in the TLS
            // template.
            Some(LoadClass::Writable) => rw.add(chunk, !is_tls),
            None => {}
        }
        if is_tls {
            tls.add(chunk, true);
        }
        if is_relro(rank) {
            relro.add(chunk, true);
        }
    }

    const PF_X: u32 = 1;
    const PF_W: u32 = 2;
    const PF_R: u32 = 4;
    let mut segments = Vec::new();
    segments.push(SegmentLayout {
        segment_type: object::elf::PT_PHDR,
        flags: PF_R,
        offset: elf::PHEADER_OFFSET,
        vaddr: elf::IMAGE_BASE + elf::PHEADER_OFFSET,
        file_size: phnum * u64::from(elf::PROGRAM_HEADER_SIZE),
        mem_size: phnum * u64::from(elf::PROGRAM_HEADER_SIZE),
        alignment: 8,
    });
    segments.push(ro.to_segment(object::elf::PT_LOAD, PF_R, elf::PAGE_SIZE));
    if exec.present {
        segments.push(exec.to_segment(object::elf::PT_LOAD, PF_R | PF_X, elf::PAGE_SIZE));
    }
    if rw.present {
        segments.push(rw.to_segment(object::elf::PT_LOAD, PF_R | PF_W, elf::PAGE_SIZE));
    }
    if tls.present {
        segments.push(tls.to_segment(object::elf::PT_TLS, PF_R, tls.align));
    }
    if relro.present {
        segments.push(relro.to_segment(object::elf::PT_GNU_RELRO, PF_R, 1));
    }
    segments
}

struct SymtabTotals {
    num_entries: u64,
    strings_size: u64,
    first_global: u64,
}

/// Sizes each file's contribution to .symtab/.strtab and assigns it disjoint entry and string
/// ranges: all files' locals first (so sh_info is the index of the first global), then each
/// file's globals, then symbols owned by no file.
#[tracing::instrument(skip_all, name = "Compute symbol table sizes")]
fn compute_symtab_sizes<'data>(
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
) -> Result<(Vec<FileSymtabLayout>, EpilogueSymtabLayout, SymtabTotals)> {
    let mut layouts = files
        .par_iter()
        .map(|file| {
            let mut layout = FileSymtabLayout::default();
            if !file.is_alive() {
                return Ok(layout);
            }
            // The STT_FILE entry.
            layout.num_locals = 1;
            layout.local_strings_size = file.symtab_file_name().len() as u32 + 1;
            for symbol in file.object.symbols() {
                if should_emit_local(file, &symbol)? {
                    layout.num_locals += 1;
                    layout.local_strings_size += symbol.name_bytes()?.len() as u32 + 1;
                } else if is_global_owner(file, &symbol, db) {
                    layout.num_globals += 1;
                    layout.global_strings_size += symbol.name_bytes()?.len() as u32 + 1;
                }
            }
            Ok(layout)
        })
        .collect::<Result<Vec<FileSymtabLayout>>>()?;

    let mut epilogue = EpilogueSymtabLayout::default();
    for index in 0..db.num_symbols() {
        if emit_in_epilogue(db, index) {
            epilogue.num_symbols += 1;
            epilogue.strings_size += db.name_of(index).len() as u32 + 1;
        }
    }

    // Null symbol and null string.
    let mut entry_cursor = 1u32;
    let mut string_cursor = 1u32;
    for layout in &mut layouts {
        layout.local_string_offset = string_cursor;
        entry_cursor += layout.num_locals;
        string_cursor += layout.local_strings_size;
    }
    let first_global = entry_cursor;
    for layout in &mut layouts {
        layout.global_string_offset = string_cursor;
        entry_cursor += layout.num_globals;
        string_cursor += layout.global_strings_size;
    }
    epilogue.string_offset = string_cursor;
    entry_cursor += epilogue.num_symbols;
    string_cursor += epilogue.strings_size;

    let totals = SymtabTotals {
        num_entries: u64::from(entry_cursor),
        strings_size: u64::from(string_cursor),
        first_global: u64::from(first_global),
    };
    Ok((layouts, epilogue, totals))
}

/// Whether a local symbol gets copied to the output symbol table.
pub(crate) fn should_emit_local<'data>(
    file: &ObjectFile<'data>,
    symbol: &elf::Symbol<'data, '_>,
) -> Result<bool> {
    if !symbol.is_local() {
        return Ok(false);
    }
    let name = symbol.name_bytes()?;
    if name.is_empty() {
        return Ok(false);
    }
    let (st_info, _) = elf::symbol_info(symbol);
    let st_type = elf::st_type(st_info);
    if st_type == object::elf::STT_SECTION || st_type == object::elf::STT_FILE {
        return Ok(false);
    }
    match symbol.section_index() {
        Some(section_index) => Ok(matches!(
            file.sections.get(section_index.0),
            Some(SectionSlot::Regular(_) | SectionSlot::Merge(_))
        )),
        None => Ok(matches!(
            symbol.section(),
            object::SymbolSection::Absolute
        )),
    }
}

/// Whether this file's symbol table entry is the one that ended up defining the global.
pub(crate) fn is_global_owner<'data>(
    file: &ObjectFile<'data>,
    symbol: &elf::Symbol<'data, '_>,
    db: &ResolvedDb<'data>,
) -> bool {
    let SymbolSlot::Global(symbol_id) = file.symbols[symbol.index().0] else {
        return false;
    };
    matches!(db.def(symbol_id), SymbolDef::Defined(d)
        if d.file_id == file.file_id && d.sym_index == symbol.index())
}

pub(crate) fn emit_in_epilogue(db: &ResolvedDb, index: usize) -> bool {
    match db.defs[index] {
        SymbolDef::LinkerDefined { .. } | SymbolDef::Synthetic(_) => true,
        SymbolDef::Undefined | SymbolDef::Lazy { .. } => {
            db.flags(SymbolId::from_usize(index)).load(Ordering::Relaxed) & REFERENCED != 0
        }
        _ => false,
    }
}

impl<'data> OutputChunk<'data> {
    fn pseudo(kind: ChunkKind, size: u64) -> OutputChunk<'data> {
        OutputChunk {
            kind,
            sh_flags: if kind == ChunkKind::SectionHeaders {
                0
            } else {
                u64::from(object::elf::SHF_ALLOC)
            },
            alignment: 8,
            sh_size: size,
            file_size: size,
            ..OutputChunk::default()
        }
    }

    pub(crate) fn display_name(&self) -> Cow<str> {
        match self.kind {
            ChunkKind::FileHeader => Cow::Borrowed("<ehdr>"),
            ChunkKind::ProgramHeaders => Cow::Borrowed("<phdr>"),
            ChunkKind::SectionHeaders => Cow::Borrowed("<shdr>"),
            _ => String::from_utf8_lossy(self.name),
        }
    }
}

impl<'data> Default for OutputChunk<'data> {
    fn default() -> Self {
        OutputChunk {
            kind: ChunkKind::FileHeader,
            name: b"",
            sh_type: object::elf::SHT_PROGBITS,
            sh_flags: 0,
            entsize: 0,
            alignment: 1,
            sh_size: 0,
            file_size: 0,
            sh_offset: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_info: 0,
            shndx: NO_SECTION_INDEX,
            name_offset: 0,
        }
    }
}

impl Default for SlotSet {
    fn default() -> Self {
        SlotSet {
            got: SLOT_NONE,
            gottp: SLOT_NONE,
            plt: SLOT_NONE,
        }
    }
}

impl OutputSectionId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with(flags: u64, sh_type: u32) -> OutputChunk<'static> {
        OutputChunk {
            kind: ChunkKind::OutputSection(OutputSectionId(0)),
            sh_flags: flags,
            sh_type,
            ..OutputChunk::default()
        }
    }

    #[test]
    fn test_ranks_order_segments() {
        let text = chunk_with(
            u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
            object::elf::SHT_PROGBITS,
        );
        let rodata = chunk_with(u64::from(object::elf::SHF_ALLOC), object::elf::SHT_PROGBITS);
        let data = chunk_with(
            u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE),
            object::elf::SHT_PROGBITS,
        );
        let bss = chunk_with(
            u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE),
            object::elf::SHT_NOBITS,
        );
        let comment = chunk_with(0, object::elf::SHT_PROGBITS);
        assert!(chunk_rank(&rodata) < chunk_rank(&text));
        assert!(chunk_rank(&text) < chunk_rank(&data));
        assert!(chunk_rank(&data) < chunk_rank(&bss));
        assert!(chunk_rank(&bss) < chunk_rank(&comment));
    }

    #[test]
    fn test_load_classes() {
        assert_eq!(load_class(RANK_EHDR), Some(LoadClass::ReadOnly));
        assert_eq!(load_class(RANK_TEXT), Some(LoadClass::Executable));
        assert_eq!(load_class(RANK_BSS), Some(LoadClass::Writable));
        assert_eq!(load_class(RANK_SYMTAB), None);
        assert!(is_relro(RANK_GOT));
        assert!(!is_relro(RANK_GOTPLT));
    }
}
