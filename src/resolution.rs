//! Resolves symbol references between objects. In the process we decide which archive members
//! take part in the link: whenever a live file has an undefined reference whose only known
//! supplier is an inactive member, that member gets activated and processed, which can in turn
//! activate further members. Activation and binding run together in one task scope; each file
//! is processed at most once, so the fixpoint terminates with no undefined reference left whose
//! supplier is still inactive.

use crate::error::Error;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::input_data::FileId;
use crate::parsing::ObjectFile;
use crate::parsing::Section;
use crate::parsing::SectionSlot;
use crate::parsing::SymbolSlot;
use crate::symbol_db::Definition;
use crate::symbol_db::ResolvedDb;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolDef;
use crate::symbol_db::SymbolName;
use crate::symbol_db::REFERENCED;
use crate::symbol_db::SYNTHETIC_SYMBOLS;
use anyhow::anyhow;
use anyhow::bail;
use crossbeam_queue::ArrayQueue;
use object::Object;
use object::ObjectSymbol;
use rayon::prelude::*;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "Symbol resolution")]
pub(crate) fn resolve_symbols<'data>(
    files: &mut [ObjectFile<'data>],
    symbol_db: SymbolDb<'data>,
) -> Result<ResolvedDb<'data>> {
    bind_and_activate(files, &symbol_db)?;
    let mut db = symbol_db.freeze();
    let comdat_groups = elect_comdat_winners(files);
    discard_comdat_losers(files, &comdat_groups);
    retract_discarded_definitions(files, &mut db);
    install_synthetic_symbols(&mut db);
    check_undefined_symbols(files, &db)?;
    convert_common_symbols(files, &mut db);
    Ok(db)
}

/// Runs symbol binding for every live file, activating archive members on demand. Per-symbol
/// locks serialise updates to each definition; the binding rules themselves are in
/// `SymbolDb::bind`.
#[tracing::instrument(skip_all, name = "Bind and activate")]
fn bind_and_activate<'data>(files: &mut [ObjectFile<'data>], db: &SymbolDb<'data>) -> Result {
    let errors = ArrayQueue::new(1);
    let errors_ref = &errors;
    let files_ref: &[ObjectFile<'data>] = files;
    rayon::scope(|s| {
        for file in files_ref.iter().filter(|f| f.is_alive()) {
            s.spawn(move |s| process_file(file, files_ref, db, s, errors_ref));
        }
    });
    if let Some(error) = errors.pop() {
        return Err(error);
    }
    Ok(())
}

fn process_file<'scope, 'data: 'scope>(
    file: &'scope ObjectFile<'data>,
    files: &'scope [ObjectFile<'data>],
    db: &'scope SymbolDb<'data>,
    s: &rayon::Scope<'scope>,
    errors: &'scope ArrayQueue<Error>,
) {
    let request_file = |file_id: FileId| {
        let target = &files[file_id.as_usize()];
        if !target.is_alive.swap(true, Ordering::Relaxed) {
            s.spawn(move |s| process_file(target, files, db, s, errors));
        }
    };
    if let Err(error) = bind_symbols(file, files, db, request_file) {
        // We only keep the first error.
        let _ = errors.push(error);
    }
}

fn bind_symbols<'data>(
    file: &ObjectFile<'data>,
    files: &[ObjectFile<'data>],
    db: &SymbolDb<'data>,
    mut request_file: impl FnMut(FileId),
) -> Result {
    for symbol in file.object.symbols() {
        if symbol.index().0 < file.first_global {
            continue;
        }
        let SymbolSlot::Global(symbol_id) = file.symbols[symbol.index().0] else {
            continue;
        };
        if symbol.is_undefined() {
            db.flags(symbol_id).fetch_or(REFERENCED, Ordering::Relaxed);
            if !symbol.is_weak() {
                // A weak reference isn't enough to drag in an archive member.
                if let SymbolDef::Lazy { file_id } = db.def(symbol_id) {
                    request_file(file_id);
                }
            }
            continue;
        }
        let incoming = if symbol.is_common() {
            SymbolDef::Common {
                file_id: file.file_id,
                sym_index: symbol.index(),
                // For commons, st_value holds the required alignment.
                size: symbol.size(),
                alignment: symbol.address().max(1),
            }
        } else {
            let section = symbol.section_index();
            let (st_info, _) = crate::elf::symbol_info(&symbol);
            SymbolDef::Defined(Definition {
                file_id: file.file_id,
                sym_index: symbol.index(),
                section,
                piece: None,
                value: symbol.address(),
                weak: symbol.is_weak(),
                in_comdat: section.map(|s| file.section_in_comdat(s)).unwrap_or(false),
                ifunc: crate::elf::st_type(st_info) == object::elf::STT_GNU_IFUNC,
            })
        };
        if let Err(duplicate) = db.bind(symbol_id, incoming) {
            let first = file.file_id.min(duplicate.existing_file);
            let second = file.file_id.max(duplicate.existing_file);
            bail!(
                "Duplicate symbol `{}` defined by both {} and {}",
                db.name(symbol_id),
                files[first.as_usize()].input,
                files[second.as_usize()].input,
            );
        }
    }
    Ok(())
}

struct ComdatGroups<'data> {
    ids: PassThroughHashMap<SymbolName<'data>, usize>,

    /// Per group, the winning (file priority, group section index), packed so the election can
    /// run with a single fetch_min per contender.
    winners: Vec<AtomicU64>,
}

fn pack_winner(file_id: FileId, group_section: object::SectionIndex) -> u64 {
    (u64::from(file_id.as_u32()) << 32) | group_section.0 as u64
}

/// Each live file installs itself as a candidate winner of every group it carries. The lowest
/// (priority, section index) pair wins, so the outcome is independent of scheduling.
#[tracing::instrument(skip_all, name = "Elect COMDAT winners")]
fn elect_comdat_winners<'data>(files: &[ObjectFile<'data>]) -> ComdatGroups<'data> {
    let mut groups = ComdatGroups {
        ids: Default::default(),
        winners: Vec::new(),
    };
    for file in files.iter().filter(|f| f.is_alive()) {
        for group in &file.comdat_groups {
            groups.ids.entry(group.signature).or_insert_with(|| {
                groups.winners.push(AtomicU64::new(u64::MAX));
                groups.winners.len() - 1
            });
        }
    }
    files
        .par_iter()
        .filter(|f| f.is_alive())
        .for_each(|file| {
            for group in &file.comdat_groups {
                let index = groups.ids[&group.signature];
                groups.winners[index]
                    .fetch_min(pack_winner(file.file_id, group.group_section), Ordering::Relaxed);
            }
        });
    groups
}

#[tracing::instrument(skip_all, name = "Discard COMDAT losers")]
fn discard_comdat_losers<'data>(files: &mut [ObjectFile<'data>], groups: &ComdatGroups<'data>) {
    files.par_iter_mut().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        let file_id = file.file_id;
        let sections = &mut file.sections;
        for group in &file.comdat_groups {
            let winner = groups.winners[groups.ids[&group.signature]].load(Ordering::Relaxed);
            if winner == pack_winner(file_id, group.group_section) {
                continue;
            }
            for &member in &group.members {
                if let Some(slot) = sections.get_mut(member.0) {
                    *slot = SectionSlot::Discard;
                }
            }
        }
    });
}

/// A symbol can end up defined in a section that subsequently got discarded (a COMDAT loser
/// whose twin sections don't define the same set of globals). Such definitions are withdrawn;
/// any remaining reference to them is then reported like any other undefined symbol.
fn retract_discarded_definitions<'data>(files: &[ObjectFile<'data>], db: &mut ResolvedDb<'data>) {
    for def in &mut db.defs {
        let SymbolDef::Defined(d) = def else {
            continue;
        };
        let Some(section_index) = d.section else {
            continue;
        };
        if matches!(
            files[d.file_id.as_usize()].sections[section_index.0],
            SectionSlot::Discard
        ) {
            *def = SymbolDef::Undefined;
        }
    }
}

/// Reserved symbols like `__bss_start` and `_end` get defined by the linker, but only when some
/// input refers to them and nothing defines them.
fn install_synthetic_symbols(db: &mut ResolvedDb) {
    for &(name, kind) in SYNTHETIC_SYMBOLS {
        if let Some(symbol_id) = db.symbol_id(&SymbolName::new(name)) {
            let def = &mut db.defs[symbol_id.as_usize()];
            if matches!(def, SymbolDef::Undefined | SymbolDef::Lazy { .. }) {
                *def = SymbolDef::Synthetic(kind);
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "Check undefined symbols")]
fn check_undefined_symbols<'data>(files: &[ObjectFile<'data>], db: &ResolvedDb<'data>) -> Result {
    let errors = ArrayQueue::new(1);
    files
        .par_iter()
        .filter(|f| f.is_alive())
        .for_each(|file| {
            for symbol in file.object.symbols() {
                let SymbolSlot::Global(symbol_id) = file.symbols[symbol.index().0] else {
                    continue;
                };
                if !symbol.is_undefined() || symbol.is_weak() {
                    continue;
                }
                if matches!(
                    db.def(symbol_id),
                    SymbolDef::Undefined | SymbolDef::Lazy { .. }
                ) {
                    let _ = errors.push(anyhow!(
                        "Undefined symbol `{}` referenced by {}",
                        db.name(symbol_id),
                        file.input
                    ));
                    return;
                }
            }
        });
    if let Some(error) = errors.pop() {
        return Err(error);
    }
    Ok(())
}

/// Folds every surviving common symbol into a fresh `.bss` allocation owned by the file that
/// supplied the winning (largest) tentative definition. Runs before relocation scanning so that
/// scans and relocations only ever see section-backed definitions.
#[tracing::instrument(skip_all, name = "Convert common symbols")]
fn convert_common_symbols<'data>(files: &mut [ObjectFile<'data>], db: &mut ResolvedDb<'data>) {
    for def in &mut db.defs {
        let SymbolDef::Common {
            file_id,
            sym_index,
            size,
            alignment,
        } = *def
        else {
            continue;
        };
        let file = &mut files[file_id.as_usize()];
        let section_index = object::SectionIndex(file.sections.len());
        file.sections.push(SectionSlot::Regular(Section {
            index: section_index,
            name: b".bss",
            sh_type: object::elf::SHT_NOBITS,
            sh_flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE),
            alignment,
            size,
            data: &[],
            output_section: None,
            output_offset: 0,
        }));
        *def = SymbolDef::Defined(Definition {
            file_id,
            sym_index,
            section: Some(section_index),
            piece: None,
            value: 0,
            weak: false,
            in_comdat: false,
            ifunc: false,
        });
    }
}
