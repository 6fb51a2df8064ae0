//! Writes a link map: every output chunk with its address, under it the input sections that
//! fed it, and under those the symbols they define. Everything is emitted in (address, file
//! priority, section index) order, so the map is stable across runs. The report goes to
//! standard output with --print-map and/or to a file with -Map; it's rendered once into a
//! buffer either way.

use crate::args::Args;
use crate::error::Result;
use crate::layout::is_global_owner;
use crate::layout::should_emit_local;
use crate::layout::ChunkKind;
use crate::layout::Layout;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::symbol_db::ResolvedDb;
use anyhow::Context;
use object::Object;
use object::ObjectSymbol;
use std::io::Write;

#[tracing::instrument(skip_all, name = "Write map file")]
pub(crate) fn emit<'data>(
    args: &Args,
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    if !args.print_map && args.map_path.is_none() {
        return Ok(());
    }
    let mut report = Vec::new();
    write_map(&mut report, files, db, layout)?;
    if let Some(path) = &args.map_path {
        std::fs::write(path, &report)
            .with_context(|| format!("Failed to write map file `{}`", path.display()))?;
    }
    if args.print_map {
        std::io::stdout().lock().write_all(&report)?;
    }
    Ok(())
}

fn write_map<'data>(
    out: &mut impl Write,
    files: &[ObjectFile<'data>],
    db: &ResolvedDb<'data>,
    layout: &Layout<'data>,
) -> Result {
    writeln!(out, "{:>16} {:>10} {:>5} Out     In      Symbol", "VMA", "Size", "Align")?;
    for chunk in &layout.chunks {
        writeln!(
            out,
            "{:>16x} {:>10x} {:>5} {}",
            chunk.sh_addr,
            chunk.sh_size,
            chunk.alignment,
            chunk.display_name(),
        )?;
        match chunk.kind {
            ChunkKind::OutputSection(id) => {
                let output_section = &layout.output_sections.sections[id.as_usize()];
                for &(file_id, section_index) in &output_section.contributors {
                    let file = &files[file_id.as_usize()];
                    let SectionSlot::Regular(section) = &file.sections[section_index.0] else {
                        continue;
                    };
                    let address = chunk.sh_addr + section.output_offset;
                    writeln!(
                        out,
                        "{:>16x} {:>10x} {:>5}         {}:({})",
                        address,
                        section.size,
                        section.alignment,
                        file.input,
                        String::from_utf8_lossy(section.name),
                    )?;
                    write_section_symbols(out, file, section_index, address, db)?;
                }
            }
            ChunkKind::Merged(id) => {
                // Deduplicated pieces, attributed to the input section whose copy won.
                for piece in &layout.merged.get(id).pieces {
                    let supplier = match piece.winner {
                        Some((file_id, section_index)) => {
                            let file = &files[file_id.as_usize()];
                            let SectionSlot::Merge(merge) = &file.sections[section_index.0]
                            else {
                                continue;
                            };
                            format!("{}:({})", file.input, String::from_utf8_lossy(merge.name))
                        }
                        None => "<linker>".to_owned(),
                    };
                    writeln!(
                        out,
                        "{:>16x} {:>10x} {:>5}         {}",
                        chunk.sh_addr + piece.output_offset,
                        piece.bytes.len(),
                        "",
                        supplier,
                    )?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn write_section_symbols<'data>(
    out: &mut impl Write,
    file: &ObjectFile<'data>,
    section_index: object::SectionIndex,
    section_address: u64,
    db: &ResolvedDb<'data>,
) -> Result {
    for symbol in file.object.symbols() {
        if symbol.section_index() != Some(section_index) {
            continue;
        }
        let emit = should_emit_local(file, &symbol)? || is_global_owner(file, &symbol, db);
        if !emit {
            continue;
        }
        writeln!(
            out,
            "{:>16x} {:>10x} {:>5}                 {}",
            section_address + symbol.address(),
            symbol.size(),
            "",
            String::from_utf8_lossy(symbol.name_bytes()?),
        )?;
    }
    Ok(())
}
