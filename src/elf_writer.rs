//! Writes the output file. The image is memory-mapped at its exact final size, carved into
//! disjoint sub-slices (one per chunk, then one per input section or per input file), and the
//! chunks are filled in parallel: raw section bytes plus relocations, GOT/PLT contents, the
//! various headers, and the per-file symbol table ranges that layout reserved.

use crate::elf;
use crate::elf::FileHeader;
use crate::elf::ProgramHeader;
use crate::elf::Rela;
use crate::elf::RelocationKind;
use crate::elf::SectionHeader;
use crate::elf::SymtabEntry;
use crate::error::Result;
use crate::layout::is_global_owner;
use crate::layout::should_emit_local;
use crate::layout::ChunkKind;
use crate::layout::GotEntry;
use crate::layout::Layout;
use crate::layout::OutputSectionId;
use crate::layout::SymRef;
use crate::parsing::ObjectFile;
use crate::parsing::Section;
use crate::parsing::SectionSlot;
use crate::parsing::SymbolSlot;
use crate::parsing::SLOT_NONE;
use crate::slice::slice_take_prefix_mut;
use crate::slice::take_first_mut;
use crate::string_merging::MergedSectionId;
use crate::symbol_db::ResolvedDb;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use memmap2::MmapOptions;
use object::Object;
use object::ObjectSection;
use object::ObjectSymbol;
use rayon::prelude::*;
use std::path::Path;

pub(crate) struct Output {
    file: std::fs::File,
    mmap: memmap2::MmapMut,
}

impl Output {
    #[tracing::instrument(skip_all, name = "Create output file")]
    pub(crate) fn create(path: &Path, file_size: u64) -> Result<Output> {
        let _ = std::fs::remove_file(path);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open `{}`", path.display()))?;
        file.set_len(file_size)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .with_context(|| format!("Failed to mmap output file `{}`", path.display()))?;
        Ok(Output { file, mmap })
    }

    #[tracing::instrument(skip_all, name = "Write output file")]
    pub(crate) fn write<'data>(
        &mut self,
        files: &[ObjectFile<'data>],
        db: &ResolvedDb<'data>,
        layout: &Layout<'data>,
    ) -> Result {
        let mut data: &mut [u8] = &mut self.mmap;
        let mut offset = 0u64;
        let mut jobs = Vec::new();
        let mut symtab_buffer = None;
        let mut strtab_buffer = None;
        for (i, chunk) in layout.chunks.iter().enumerate() {
            if chunk.file_size == 0 {
                continue;
            }
            let padding = chunk
                .sh_offset
                .checked_sub(offset)
                .expect("Chunk offsets went backwards");
            slice_take_prefix_mut(&mut data, padding as usize);
            let buffer = slice_take_prefix_mut(&mut data, chunk.file_size as usize);
            offset = chunk.sh_offset + chunk.file_size;
            match chunk.kind {
                // The symbol table and its string table are written together, since each
                // symbol entry records an offset into the strings.
                ChunkKind::Symtab => symtab_buffer = Some(buffer),
                ChunkKind::Strtab => strtab_buffer = Some(buffer),
                _ => jobs.push(WriteJob::Chunk(i, buffer)),
            }
        }
        jobs.push(WriteJob::SymbolTables {
            symtab: symtab_buffer.expect("missing symtab chunk"),
            strtab: strtab_buffer.expect("missing strtab chunk"),
        });
        jobs.into_par_iter()
            .try_for_each(|job| write_job(job, files, db, layout))?;
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> Result {
        self.mmap.flush()?;
        crate::fs::make_executable(&self.file)
    }
}

enum WriteJob<'out> {
    Chunk(usize, &'out mut [u8]),
    SymbolTables {
        symtab: &'out mut [u8],
        strtab: &'out mut [u8],
    },
}

fn write_job<'data>(
    job: WriteJob,
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    match job {
        WriteJob::SymbolTables { symtab, strtab } => {
            write_symbol_tables(symtab, strtab, files, db, layout)
        }
        WriteJob::Chunk(index, buffer) => {
            let chunk = &layout.chunks[index];
            match chunk.kind {
                ChunkKind::FileHeader => write_file_header(buffer, layout),
                ChunkKind::ProgramHeaders => write_program_headers(buffer, layout),
                ChunkKind::SectionHeaders => write_section_headers(buffer, layout),
                ChunkKind::Shstrtab => {
                    buffer.copy_from_slice(&layout.shstrtab_content);
                    Ok(())
                }
                ChunkKind::OutputSection(id) => {
                    write_output_section(id, buffer, files, db, layout)
                }
                ChunkKind::Merged(id) => write_merged_section(id, buffer, layout),
                ChunkKind::Got => write_got(buffer, files, db, layout),
                // .got.plt slots get their real values at startup, when the IRELATIVE
                // relocations run. The zeroed mapping is already what we want.
                ChunkKind::GotPlt => Ok(()),
                ChunkKind::Plt => write_plt(buffer, layout),
                ChunkKind::RelaPlt => write_rela_plt(buffer, files, db, layout),
                ChunkKind::Interp | ChunkKind::Symtab | ChunkKind::Strtab => {
                    unreachable!()
                }
            }
        }
    }
}

fn write_file_header(buffer: &mut [u8], layout: &Layout) -> Result {
    let header: &mut FileHeader = bytemuck::from_bytes_mut(buffer);
    let section_header_offset = layout
        .chunks
        .iter()
        .find(|c| c.kind == ChunkKind::SectionHeaders)
        .map(|c| c.sh_offset)
        .unwrap();
    *header = FileHeader {
        magic: [0x7f, b'E', b'L', b'F'],
        class: 2, // 64 bit
        data: 1,  // Little endian
        ei_version: 1,
        os_abi: 3, // Linux
        abi_version: 0,
        padding: [0; 7],
        ty: object::elf::ET_EXEC,
        machine: object::elf::EM_X86_64,
        e_version: 1,
        entry_point: layout.entry_address,
        program_header_offset: elf::PHEADER_OFFSET,
        section_header_offset,
        flags: 0,
        ehsize: elf::FILE_HEADER_SIZE,
        program_header_entry_size: elf::PROGRAM_HEADER_SIZE,
        program_header_num: layout.segments.len() as u16,
        section_header_entry_size: elf::SECTION_HEADER_SIZE,
        section_header_num: layout.num_section_headers as u16,
        section_names_index: layout.shstrndx,
    };
    Ok(())
}

fn write_program_headers(buffer: &mut [u8], layout: &Layout) -> Result {
    let headers: &mut [ProgramHeader] = bytemuck::cast_slice_mut(buffer);
    if headers.len() != layout.segments.len() {
        bail!("Miscounted program headers");
    }
    for (header, segment) in headers.iter_mut().zip(&layout.segments) {
        *header = ProgramHeader {
            segment_type: segment.segment_type,
            flags: segment.flags,
            offset: segment.offset,
            virtual_addr: segment.vaddr,
            physical_addr: segment.vaddr,
            file_size: segment.file_size,
            mem_size: segment.mem_size,
            alignment: segment.alignment,
        };
    }
    Ok(())
}

fn write_section_headers(buffer: &mut [u8], layout: &Layout) -> Result {
    let entries: &mut [SectionHeader] = bytemuck::cast_slice_mut(buffer);
    if entries.len() != layout.num_section_headers as usize {
        bail!("Miscounted section headers");
    }
    entries[0] = SectionHeader::default();
    for chunk in &layout.chunks {
        if chunk.shndx == crate::layout::NO_SECTION_INDEX {
            continue;
        }
        entries[chunk.shndx as usize] = SectionHeader {
            name: chunk.name_offset,
            ty: chunk.sh_type,
            flags: chunk.sh_flags,
            address: chunk.sh_addr,
            offset: chunk.sh_offset,
            size: chunk.sh_size,
            link: chunk.sh_link,
            info: chunk.sh_info,
            alignment: chunk.alignment,
            entsize: chunk.entsize,
        };
    }
    Ok(())
}

fn write_output_section<'data>(
    id: OutputSectionId,
    buffer: &mut [u8],
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    let output_section = &layout.output_sections.sections[id.as_usize()];
    let mut rest = buffer;
    let mut cursor = 0u64;
    let mut pieces = Vec::with_capacity(output_section.contributors.len());
    for &(file_id, section_index) in &output_section.contributors {
        let file = &files[file_id.as_usize()];
        let SectionSlot::Regular(section) = &file.sections[section_index.0] else {
            unreachable!();
        };
        let padding = section.output_offset - cursor;
        slice_take_prefix_mut(&mut rest, padding as usize);
        let out = slice_take_prefix_mut(&mut rest, section.size as usize);
        cursor = section.output_offset + section.size;
        pieces.push((file, section, out));
    }
    pieces.into_par_iter().try_for_each(|(file, section, out)| {
        out.copy_from_slice(section.data);
        apply_relocations(file, section, out, files, db, layout).with_context(|| {
            format!(
                "Failed to apply relocations in section `{}` of {}",
                String::from_utf8_lossy(section.name),
                file.input
            )
        })
    })
}

fn write_merged_section(id: MergedSectionId, buffer: &mut [u8], layout: &Layout) -> Result {
    let section = layout.merged.get(id);
    for piece in &section.pieces {
        let start = piece.output_offset as usize;
        buffer[start..start + piece.bytes.len()].copy_from_slice(piece.bytes);
    }
    Ok(())
}

fn write_got<'data>(
    buffer: &mut [u8],
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    for (i, entry) in layout.got_entries.iter().enumerate() {
        let value = match entry {
            GotEntry::Address(sym) => symref_runtime_address(sym, files, db, layout)?,
            GotEntry::TpOff(sym) => {
                symref_address(sym, files, db, layout)?.wrapping_sub(layout.tls_end)
            }
        };
        let start = i * elf::GOT_ENTRY_SIZE as usize;
        buffer[start..start + 8].copy_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

fn write_plt(buffer: &mut [u8], layout: &Layout) -> Result {
    for i in 0..layout.plt_entries.len() {
        let start = i * elf::PLT_ENTRY_SIZE as usize;
        let entry = &mut buffer[start..start + elf::PLT_ENTRY_SIZE as usize];
        entry.copy_from_slice(elf::PLT_ENTRY_TEMPLATE);
        let slot = i as u32;
        // The jump reads its target from our .got.plt slot. The displacement is relative to
        // the end of the 6-byte instruction.
        let displacement: i32 = (layout.gotplt_address(slot) as i64
            - (layout.plt_address(slot) as i64 + 6))
            .try_into()
            .map_err(|_| anyhow!("PLT is more than 2GiB away from GOT"))?;
        entry[2..6].copy_from_slice(&displacement.to_le_bytes());
    }
    Ok(())
}

/// One R_X86_64_IRELATIVE per ifunc: at startup the resolver (the symbol's static address) is
/// called and its return value stored into the .got.plt slot that the PLT entry jumps through.
fn write_rela_plt<'data>(
    buffer: &mut [u8],
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    let entries: &mut [Rela] = bytemuck::cast_slice_mut(buffer);
    for (i, (entry, sym)) in entries.iter_mut().zip(&layout.plt_entries).enumerate() {
        entry.address = layout.gotplt_address(i as u32);
        entry.info = u64::from(object::elf::R_X86_64_IRELATIVE);
        entry.addend = symref_address(sym, files, db, layout)?;
    }
    Ok(())
}

/// The address a reference to this symbol should observe at run time: ifuncs route through
/// their canonical PLT entry, everything else is the symbol itself.
fn symref_runtime_address<'data>(
    sym: &SymRef,
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result<u64> {
    match sym {
        SymRef::Global(id) => layout.runtime_symbol_address(files, db, *id),
        SymRef::Local(file_id, sym_index) => {
            let file = &files[file_id.as_usize()];
            if let SymbolSlot::Local(local) = &file.symbols[sym_index.0] {
                if local.plt_slot != SLOT_NONE {
                    return Ok(layout.plt_address(local.plt_slot));
                }
            }
            local_symbol_address(file, *sym_index, layout)
        }
    }
}

fn symref_address<'data>(
    sym: &SymRef,
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result<u64> {
    match sym {
        SymRef::Global(id) => layout.symbol_address(files, db, *id),
        SymRef::Local(file_id, sym_index) => {
            local_symbol_address(&files[file_id.as_usize()], *sym_index, layout)
        }
    }
}

fn local_symbol_address<'data>(
    file: &ObjectFile<'data>,
    sym_index: object::SymbolIndex,
    layout: &Layout<'data>,
) -> Result<u64> {
    let symbol = file.object.symbol_by_index(sym_index)?;
    match symbol.section_index() {
        Some(section_index) => match &file.sections[section_index.0] {
            SectionSlot::Regular(_) => {
                let base = layout
                    .section_address(file, section_index)
                    .ok_or_else(|| anyhow!("Local symbol in unallocated section"))?;
                Ok(base + symbol.address())
            }
            SectionSlot::Merge(merge) => {
                let (piece, offset) = merge.piece_for_offset(symbol.address())?;
                let chunk = layout.chunk_for_merged(merge.merged_id.unwrap());
                let piece = layout.merged.get(merge.merged_id.unwrap()).piece(merge.piece_ids[piece]);
                Ok(chunk.sh_addr + piece.output_offset + offset)
            }
            SectionSlot::Discard => {
                bail!("Reference to local symbol in discarded section")
            }
        },
        None => Ok(symbol.address()),
    }
}

struct TargetResolution {
    address: u64,
    addend: i64,
    got_address: Option<u64>,
    gottp_address: Option<u64>,
    plt_address: Option<u64>,
}

fn resolve_target<'data>(
    file: &ObjectFile<'data>,
    sym_index: object::SymbolIndex,
    addend: i64,
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result<TargetResolution> {
    match &file.symbols[sym_index.0] {
        SymbolSlot::Global(id) => {
            let slots = layout.global_slots[id.as_usize()];
            Ok(TargetResolution {
                address: layout.runtime_symbol_address(files, db, *id)?,
                addend,
                got_address: (slots.got != SLOT_NONE).then(|| layout.got_address(slots.got)),
                gottp_address: (slots.gottp != SLOT_NONE)
                    .then(|| layout.got_address(slots.gottp)),
                plt_address: (slots.plt != SLOT_NONE).then(|| layout.plt_address(slots.plt)),
            })
        }
        SymbolSlot::Local(local) => {
            let symbol = file.object.symbol_by_index(sym_index)?;
            let (st_info, _) = elf::symbol_info(&symbol);
            let mut addend = addend;
            let address = match symbol.section_index() {
                Some(section_index) => match &file.sections[section_index.0] {
                    SectionSlot::Regular(_) => {
                        let base = layout.section_address(file, section_index).ok_or_else(
                            || anyhow!("Relocation against unallocated section"),
                        )?;
                        base + symbol.address()
                    }
                    SectionSlot::Merge(merge) => {
                        // For a section symbol the addend is what picks the piece, so it's
                        // consumed here rather than applied to the merged address.
                        let offset_in_section;
                        if elf::st_type(st_info) == object::elf::STT_SECTION {
                            let target = symbol.address() as i64 + addend;
                            if target < 0 {
                                bail!("Negative offset into mergeable section");
                            }
                            offset_in_section = target as u64;
                            addend = 0;
                        } else {
                            offset_in_section = symbol.address();
                        }
                        let (piece, offset) = merge.piece_for_offset(offset_in_section)?;
                        let chunk = layout.chunk_for_merged(merge.merged_id.unwrap());
                        let piece = layout
                            .merged
                            .get(merge.merged_id.unwrap())
                            .piece(merge.piece_ids[piece]);
                        chunk.sh_addr + piece.output_offset + offset
                    }
                    SectionSlot::Discard => {
                        bail!("Relocation against discarded section")
                    }
                },
                None => symbol.address(),
            };
            Ok(TargetResolution {
                address,
                addend,
                got_address: (local.got_slot != SLOT_NONE)
                    .then(|| layout.got_address(local.got_slot)),
                gottp_address: (local.gottp_slot != SLOT_NONE)
                    .then(|| layout.got_address(local.gottp_slot)),
                plt_address: (local.plt_slot != SLOT_NONE)
                    .then(|| layout.plt_address(local.plt_slot)),
            })
        }
    }
}

fn apply_relocations<'data>(
    file: &ObjectFile<'data>,
    section: &Section<'data>,
    out: &mut [u8],
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    let section_address = layout
        .section_address(file, section.index)
        .expect("writing a section that wasn't laid out");
    let elf_section = file.object.section_by_index(section.index)?;
    for (offset_in_section, rel) in elf_section.relocations() {
        apply_relocation(
            file,
            offset_in_section,
            &rel,
            section_address,
            out,
            files,
            db,
            layout,
        )
        .with_context(|| {
            format!("Failed to apply relocation at offset 0x{offset_in_section:x}")
        })?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_relocation<'data>(
    file: &ObjectFile<'data>,
    offset_in_section: u64,
    rel: &object::Relocation,
    section_address: u64,
    out: &mut [u8],
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    let r_type = elf::rel_type(rel)?;
    let info = elf::RelocationKindInfo::from_raw(r_type)?;
    let object::RelocationTarget::Symbol(sym_index) = rel.target() else {
        bail!("Unsupported relocation target {:?}", rel.target());
    };
    let target = resolve_target(file, sym_index, rel.addend(), files, db, layout)?;
    let place = section_address + offset_in_section;
    let addend = target.addend as u64;
    let value = match info.kind {
        RelocationKind::Absolute => target.address.wrapping_add(addend),
        RelocationKind::Relative => target.address.wrapping_add(addend).wrapping_sub(place),
        RelocationKind::PltRelative => target
            .plt_address
            .unwrap_or(target.address)
            .wrapping_add(addend)
            .wrapping_sub(place),
        RelocationKind::GotRelative => target
            .got_address
            .context("GOT entry was never allocated")?
            .wrapping_add(addend)
            .wrapping_sub(place),
        RelocationKind::GotTpOff => target
            .gottp_address
            .context("GOT entry was never allocated")?
            .wrapping_add(addend)
            .wrapping_sub(place),
        RelocationKind::TpOff => target
            .address
            .wrapping_sub(layout.tls_end)
            .wrapping_add(addend),
    };
    let offset = offset_in_section as usize;
    let end = offset + info.byte_size;
    if out.len() < end {
        bail!("Relocation outside of bounds of section");
    }
    let value_bytes = value.to_le_bytes();
    out[offset..end].copy_from_slice(&value_bytes[..info.byte_size]);
    Ok(())
}

fn write_symbol_tables<'data>(
    symtab: &mut [u8],
    strtab: &mut [u8],
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    let mut entries: &mut [SymtabEntry] = bytemuck::cast_slice_mut(symtab);
    let mut strings: &mut [u8] = strtab;

    // The null symbol and the empty leading string.
    take_first_mut(&mut entries).unwrap();
    slice_take_prefix_mut(&mut strings, 1);

    let mut local_parts = Vec::with_capacity(files.len());
    for file_layout in &layout.file_symtabs {
        // The STT_FILE entry is included in num_locals.
        local_parts.push((
            slice_take_prefix_mut(&mut entries, file_layout.num_locals as usize),
            slice_take_prefix_mut(&mut strings, file_layout.local_strings_size as usize),
        ));
    }
    let mut global_parts = Vec::with_capacity(files.len());
    for file_layout in &layout.file_symtabs {
        global_parts.push((
            slice_take_prefix_mut(&mut entries, file_layout.num_globals as usize),
            slice_take_prefix_mut(&mut strings, file_layout.global_strings_size as usize),
        ));
    }

    files
        .par_iter()
        .zip(local_parts)
        .zip(global_parts)
        .enumerate()
        .try_for_each(|(i, ((file, locals), globals))| {
            let file_layout = &layout.file_symtabs[i];
            write_file_symbols(file, file_layout, locals, globals, files, db, layout)
                .with_context(|| format!("Failed to write symbols for {}", file.input))
        })?;

    let mut writer = SymbolTableWriter {
        string_offset: layout.epilogue_symtab.string_offset,
        entries,
        strings,
    };
    for index in 0..db.num_symbols() {
        if !crate::layout::emit_in_epilogue(db, index) {
            continue;
        }
        let name = db.name_of(index);
        match db.defs[index] {
            crate::symbol_db::SymbolDef::LinkerDefined { value, shndx } => {
                writer.define_symbol(
                    object::elf::STB_GLOBAL << 4,
                    0,
                    shndx,
                    value,
                    0,
                    name.bytes(),
                )?;
            }
            _ => {
                // An undefined weak reference that nothing ended up defining.
                writer.define_symbol(
                    object::elf::STB_WEAK << 4,
                    0,
                    object::elf::SHN_UNDEF,
                    0,
                    0,
                    name.bytes(),
                )?;
            }
        }
    }
    writer.check_exhausted()?;
    Ok(())
}

fn write_file_symbols<'data>(
    file: &ObjectFile<'data>,
    file_layout: &crate::layout::FileSymtabLayout,
    locals: (&mut [SymtabEntry], &mut [u8]),
    globals: (&mut [SymtabEntry], &mut [u8]),
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    if !file.is_alive() {
        return Ok(());
    }
    let mut local_writer = SymbolTableWriter {
        string_offset: file_layout.local_string_offset,
        entries: locals.0,
        strings: locals.1,
    };
    let mut global_writer = SymbolTableWriter {
        string_offset: file_layout.global_string_offset,
        entries: globals.0,
        strings: globals.1,
    };
    local_writer.define_symbol(
        object::elf::STT_FILE,
        0,
        object::elf::SHN_ABS,
        0,
        0,
        &file.symtab_file_name(),
    )?;
    for symbol in file.object.symbols() {
        let (st_info, st_other) = elf::symbol_info(&symbol);
        if should_emit_local(file, &symbol)? {
            let (value, shndx) = local_value_and_shndx(file, &symbol, layout)?;
            local_writer.define_symbol(
                st_info,
                st_other,
                shndx,
                value,
                symbol.size(),
                symbol.name_bytes()?,
            )?;
        } else if is_global_owner(file, &symbol, db) {
            let SymbolSlot::Global(symbol_id) = file.symbols[symbol.index().0] else {
                unreachable!();
            };
            let value = layout.symbol_address(files, db, symbol_id)?;
            let shndx = layout.symbol_shndx(files, db, symbol_id);
            global_writer.define_symbol(
                st_info,
                st_other,
                shndx,
                value,
                symbol.size(),
                symbol.name_bytes()?,
            )?;
        }
    }
    local_writer.check_exhausted()?;
    global_writer.check_exhausted()?;
    Ok(())
}

fn local_value_and_shndx<'data>(
    file: &ObjectFile<'data>,
    symbol: &elf::Symbol<'data, '_>,
    layout: &Layout<'data>,
) -> Result<(u64, u16)> {
    match symbol.section_index() {
        Some(section_index) => match &file.sections[section_index.0] {
            SectionSlot::Regular(sec) => {
                let base = layout
                    .section_address(file, section_index)
                    .ok_or_else(|| anyhow!("Local symbol in unallocated section"))?;
                let shndx = sec
                    .output_section
                    .map(|id| layout.chunk_for_section(id).shndx as u16)
                    .unwrap_or(object::elf::SHN_ABS);
                Ok((base + symbol.address(), shndx))
            }
            SectionSlot::Merge(merge) => {
                let (piece, offset) = merge.piece_for_offset(symbol.address())?;
                let merged_id = merge.merged_id.unwrap();
                let chunk = layout.chunk_for_merged(merged_id);
                let piece = layout.merged.get(merged_id).piece(merge.piece_ids[piece]);
                Ok((
                    chunk.sh_addr + piece.output_offset + offset,
                    chunk.shndx as u16,
                ))
            }
            SectionSlot::Discard => bail!("Local symbol in discarded section"),
        },
        None => Ok((symbol.address(), object::elf::SHN_ABS)),
    }
}

struct SymbolTableWriter<'out> {
    string_offset: u32,
    entries: &'out mut [SymtabEntry],
    strings: &'out mut [u8],
}

impl<'out> SymbolTableWriter<'out> {
    fn define_symbol(
        &mut self,
        info: u8,
        other: u8,
        shndx: u16,
        value: u64,
        size: u64,
        name: &[u8],
    ) -> Result {
        let entry = take_first_mut(&mut self.entries)
            .ok_or_else(|| anyhow!("Insufficient symbol table entries allocated"))?;
        *entry = SymtabEntry {
            name: self.string_offset,
            info,
            other,
            shndx,
            value,
            size,
        };
        let len = name.len();
        if self.strings.len() < len + 1 {
            bail!("Insufficient symbol string table space allocated");
        }
        let out = slice_take_prefix_mut(&mut self.strings, len + 1);
        out[..len].copy_from_slice(name);
        out[len] = 0;
        self.string_offset += len as u32 + 1;
        Ok(())
    }

    fn check_exhausted(&self) -> Result {
        if !self.entries.is_empty() || !self.strings.is_empty() {
            bail!(
                "Allocated symbol table entries weren't used: {} entries, {} string bytes remain",
                self.entries.len(),
                self.strings.len()
            );
        }
        Ok(())
    }
}
