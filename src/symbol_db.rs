//! The global symbol table. Names are read from each object in parallel (with their hashes
//! precomputed), then interned serially in command-line order so that symbol IDs are assigned
//! reproducibly. During resolution each symbol's definition is guarded by its own lock, while
//! GOT/PLT demand flags live in a separate atomic that relocation scanning updates with
//! `fetch_or`.

use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::input_data::FileId;
use crate::parsing::ObjectFile;
use crate::parsing::SymbolSlot;
use crate::string_merging::MergedSectionId;
use anyhow::Context;
use std::collections::hash_map;
use std::fmt::Display;
use std::hash::Hasher;
use std::sync::atomic::AtomicU8;
use std::sync::Mutex;

/// An index into the global symbol table. This is as opposed to a symbol index within an object
/// file, which is represented as object::SymbolIndex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SymbolId(u32);

pub(crate) const NEEDS_GOT: u8 = 1 << 0;
pub(crate) const NEEDS_GOTTP: u8 = 1 << 1;
pub(crate) const NEEDS_PLT: u8 = 1 << 2;

/// Set when some object refers to the symbol. Undefined symbols that nothing references don't
/// make it into the output symbol table.
pub(crate) const REFERENCED: u8 = 1 << 3;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SymbolName<'data> {
    /// We precompute the hash of the name bytes since that can run on multiple threads, whereas
    /// the symbol table is built from a single thread.
    hash: u64,
    bytes: &'data [u8],
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum SymbolDef {
    Undefined,

    /// Defined by an archive member that hasn't been activated. If the member never gets
    /// activated, references to the symbol behave as if it were undefined.
    Lazy { file_id: FileId },

    /// A tentative definition. All commons with the same name get folded into a single `.bss`
    /// allocation at the end of resolution.
    Common {
        file_id: FileId,
        sym_index: object::SymbolIndex,
        size: u64,
        alignment: u64,
    },

    Defined(Definition),

    /// A symbol like `__bss_start` that the linker defines itself. The address and output
    /// section index get filled in once layout has run.
    Synthetic(SyntheticKind),

    /// A `Synthetic` definition after layout has resolved it.
    LinkerDefined { value: u64, shndx: u16 },
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Definition {
    pub(crate) file_id: FileId,
    pub(crate) sym_index: object::SymbolIndex,
    pub(crate) section: Option<object::SectionIndex>,
    pub(crate) piece: Option<PieceRef>,
    pub(crate) value: u64,
    pub(crate) weak: bool,
    pub(crate) in_comdat: bool,
    pub(crate) ifunc: bool,
}

/// A reference into a deduplicated piece of a merged section.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PieceRef {
    pub(crate) merged: MergedSectionId,
    pub(crate) piece: u32,
    pub(crate) offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyntheticKind {
    EhdrStart,
    Etext,
    Edata,
    End,
    BssStart,
    InitArrayStart,
    InitArrayEnd,
    FiniArrayStart,
    FiniArrayEnd,
    PreinitArrayStart,
    PreinitArrayEnd,
    RelaIpltStart,
    RelaIpltEnd,
}

pub(crate) const SYNTHETIC_SYMBOLS: &[(&[u8], SyntheticKind)] = &[
    (b"__ehdr_start", SyntheticKind::EhdrStart),
    (b"etext", SyntheticKind::Etext),
    (b"_etext", SyntheticKind::Etext),
    (b"edata", SyntheticKind::Edata),
    (b"_edata", SyntheticKind::Edata),
    (b"end", SyntheticKind::End),
    (b"_end", SyntheticKind::End),
    (b"__bss_start", SyntheticKind::BssStart),
    (b"__init_array_start", SyntheticKind::InitArrayStart),
    (b"__init_array_end", SyntheticKind::InitArrayEnd),
    (b"__fini_array_start", SyntheticKind::FiniArrayStart),
    (b"__fini_array_end", SyntheticKind::FiniArrayEnd),
    (b"__preinit_array_start", SyntheticKind::PreinitArrayStart),
    (b"__preinit_array_end", SyntheticKind::PreinitArrayEnd),
    (b"__rela_iplt_start", SyntheticKind::RelaIpltStart),
    (b"__rela_iplt_end", SyntheticKind::RelaIpltEnd),
];

/// A global symbol that an object wants interned, produced while reading files in parallel.
pub(crate) struct PendingSymbol<'data> {
    pub(crate) name: SymbolName<'data>,
    pub(crate) sym_index: object::SymbolIndex,

    /// True if the owning file is an archive member that defines (not merely references) this
    /// symbol. Such definitions are recorded so that resolution knows which member to activate.
    pub(crate) lazy_definition: bool,
}

pub(crate) struct SymbolDb<'data> {
    ids: PassThroughHashMap<SymbolName<'data>, SymbolId>,
    names: Vec<SymbolName<'data>>,
    cells: Vec<Mutex<SymbolDef>>,
    flags: Vec<AtomicU8>,
}

/// The symbol table once resolution has finished with it. Definitions are plain data from here
/// on; only the demand flags remain atomic (relocation scanning runs after resolution).
pub(crate) struct ResolvedDb<'data> {
    ids: PassThroughHashMap<SymbolName<'data>, SymbolId>,
    names: Vec<SymbolName<'data>>,
    pub(crate) defs: Vec<SymbolDef>,
    flags: Vec<AtomicU8>,
}

/// Returned when two non-COMDAT strong definitions collide. The caller formats the final error,
/// since it knows how to name the input files involved.
pub(crate) struct DuplicateDefinition {
    pub(crate) existing_file: FileId,
}

impl<'data> SymbolDb<'data> {
    #[tracing::instrument(skip_all, name = "Build symbol DB")]
    pub(crate) fn build(files: &mut [ObjectFile<'data>]) -> Result<Self> {
        let mut db = SymbolDb {
            ids: Default::default(),
            names: Vec::new(),
            cells: Vec::new(),
            flags: Vec::new(),
        };
        for file in files {
            let file_id = file.file_id;
            let pending = core::mem::take(&mut file.pending_symbols);
            for symbol in pending {
                let symbol_id = db.add_symbol(symbol.name)?;
                file.symbols[symbol.sym_index.0] = SymbolSlot::Global(symbol_id);
                if symbol.lazy_definition {
                    let def = db.cells[symbol_id.as_usize()].get_mut().unwrap();
                    // The first member that can supply a symbol is the one that activation will
                    // pull, matching the order in which GNU linkers search archives.
                    if matches!(*def, SymbolDef::Undefined) {
                        *def = SymbolDef::Lazy { file_id };
                    }
                }
            }
        }
        Ok(db)
    }

    fn add_symbol(&mut self, name: SymbolName<'data>) -> Result<SymbolId> {
        match self.ids.entry(name) {
            hash_map::Entry::Occupied(entry) => Ok(*entry.get()),
            hash_map::Entry::Vacant(entry) => {
                let symbol_id = SymbolId(
                    u32::try_from(self.names.len()).context("Too many symbols")?,
                );
                entry.insert(symbol_id);
                self.names.push(name);
                self.cells.push(Mutex::new(SymbolDef::Undefined));
                self.flags.push(AtomicU8::new(0));
                Ok(symbol_id)
            }
        }
    }

    pub(crate) fn flags(&self, symbol_id: SymbolId) -> &AtomicU8 {
        &self.flags[symbol_id.as_usize()]
    }

    pub(crate) fn def(&self, symbol_id: SymbolId) -> SymbolDef {
        *self.cells[symbol_id.as_usize()].lock().unwrap()
    }

    pub(crate) fn name(&self, symbol_id: SymbolId) -> SymbolName<'data> {
        self.names[symbol_id.as_usize()]
    }

    /// Applies the binding rules for one incoming definition, taking the symbol's lock. The
    /// strongest definition wins; between definitions of equal strength the file with the lower
    /// priority wins, so the outcome doesn't depend on the order in which threads get here.
    pub(crate) fn bind(
        &self,
        symbol_id: SymbolId,
        incoming: SymbolDef,
    ) -> Result<(), DuplicateDefinition> {
        let mut cell = self.cells[symbol_id.as_usize()].lock().unwrap();
        let installed = *cell;
        if let (SymbolDef::Defined(new), SymbolDef::Defined(old)) = (&incoming, &installed) {
            if !new.weak && !old.weak && new.file_id != old.file_id && !new.in_comdat
                && !old.in_comdat
            {
                return Err(DuplicateDefinition {
                    existing_file: old.file_id,
                });
            }
        }
        if should_replace(&incoming, &installed) {
            *cell = incoming;
        }
        Ok(())
    }

    pub(crate) fn freeze(self) -> ResolvedDb<'data> {
        ResolvedDb {
            ids: self.ids,
            names: self.names,
            defs: self
                .cells
                .into_iter()
                .map(|cell| cell.into_inner().unwrap())
                .collect(),
            flags: self.flags,
        }
    }
}

/// Smaller is stronger. Symbols defined by the linker rank with `Undefined` because any input
/// definition should override them.
fn def_class(def: &SymbolDef) -> u32 {
    match def {
        SymbolDef::Defined(d) if !d.weak => 0,
        SymbolDef::Defined(_) => 1,
        SymbolDef::Common { .. } => 2,
        SymbolDef::Lazy { .. } => 3,
        SymbolDef::Undefined | SymbolDef::Synthetic(_) | SymbolDef::LinkerDefined { .. } => 4,
    }
}

fn def_priority(def: &SymbolDef) -> u32 {
    match def {
        SymbolDef::Defined(d) => d.file_id.as_u32(),
        SymbolDef::Common { file_id, .. } | SymbolDef::Lazy { file_id } => file_id.as_u32(),
        _ => u32::MAX,
    }
}

fn should_replace(incoming: &SymbolDef, installed: &SymbolDef) -> bool {
    if let (
        SymbolDef::Common {
            size: new_size,
            alignment: new_align,
            ..
        },
        SymbolDef::Common {
            size: old_size,
            alignment: old_align,
            ..
        },
    ) = (incoming, installed)
    {
        // Tentative definitions merge: the largest size and strictest alignment win.
        return (new_size, new_align, std::cmp::Reverse(def_priority(incoming)))
            > (old_size, old_align, std::cmp::Reverse(def_priority(installed)));
    }
    (def_class(incoming), def_priority(incoming)) < (def_class(installed), def_priority(installed))
}

impl<'data> ResolvedDb<'data> {
    pub(crate) fn symbol_id(&self, name: &SymbolName<'data>) -> Option<SymbolId> {
        self.ids.get(name).copied()
    }

    pub(crate) fn def(&self, symbol_id: SymbolId) -> &SymbolDef {
        &self.defs[symbol_id.as_usize()]
    }

    pub(crate) fn name(&self, symbol_id: SymbolId) -> SymbolName<'data> {
        self.names[symbol_id.as_usize()]
    }

    pub(crate) fn name_of(&self, index: usize) -> SymbolName<'data> {
        self.names[index]
    }

    pub(crate) fn flags(&self, symbol_id: SymbolId) -> &AtomicU8 {
        &self.flags[symbol_id.as_usize()]
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.defs.len()
    }
}

impl<'data> SymbolName<'data> {
    pub(crate) fn new(bytes: &'data [u8]) -> SymbolName<'data> {
        Self {
            bytes,
            hash: crate::hash::hash_bytes(bytes),
        }
    }

    pub(crate) fn bytes(&self) -> &'data [u8] {
        self.bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl<'data> std::hash::Hash for SymbolName<'data> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // We don't hash bytes because hash is already a hash of the bytes - that's the whole
        // point of storing it.
        state.write_u64(self.hash);
    }
}

impl SymbolId {
    pub(crate) fn placeholder() -> SymbolId {
        SymbolId(u32::MAX)
    }

    pub(crate) fn from_usize(index: usize) -> SymbolId {
        SymbolId(index as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl<'data> Display for SymbolName<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        String::from_utf8_lossy(self.bytes).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defined(file: u32, weak: bool, in_comdat: bool) -> SymbolDef {
        SymbolDef::Defined(Definition {
            file_id: FileId::new(file),
            sym_index: object::SymbolIndex(1),
            section: Some(object::SectionIndex(1)),
            piece: None,
            value: 0,
            weak,
            in_comdat,
            ifunc: false,
        })
    }

    fn common(file: u32, size: u64, alignment: u64) -> SymbolDef {
        SymbolDef::Common {
            file_id: FileId::new(file),
            sym_index: object::SymbolIndex(1),
            size,
            alignment,
        }
    }

    #[test]
    fn test_strong_beats_weak_and_undefined() {
        assert!(should_replace(&defined(5, false, false), &SymbolDef::Undefined));
        assert!(should_replace(&defined(5, false, false), &defined(1, true, false)));
        assert!(!should_replace(&defined(5, true, false), &defined(1, false, false)));
        assert!(!should_replace(&defined(5, true, false), &defined(1, true, false)));
    }

    #[test]
    fn test_priority_breaks_ties() {
        assert!(should_replace(&defined(1, false, true), &defined(5, false, true)));
        assert!(!should_replace(&defined(5, false, true), &defined(1, false, true)));
    }

    #[test]
    fn test_common_folding() {
        assert!(should_replace(&common(3, 64, 16), &common(1, 16, 8)));
        assert!(!should_replace(&common(3, 16, 8), &common(1, 64, 16)));
        // Equal size and alignment: earlier file wins.
        assert!(!should_replace(&common(3, 16, 8), &common(1, 16, 8)));
        assert!(should_replace(&defined(5, false, false), &common(1, 64, 16)));
        assert!(!should_replace(&common(1, 64, 16), &defined(5, false, false)));
    }

    #[test]
    fn test_lazy_ranks_between_common_and_undefined() {
        let lazy = SymbolDef::Lazy {
            file_id: FileId::new(7),
        };
        assert!(should_replace(&defined(9, true, false), &lazy));
        assert!(should_replace(&common(9, 8, 8), &lazy));
        assert!(!should_replace(&lazy, &defined(2, true, false)));
    }
}
