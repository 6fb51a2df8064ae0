//! Merges identical pieces from mergeable input sections (SHF_MERGE, optionally SHF_STRINGS).
//! Pieces were split and hashed while the files were being parsed in parallel; here we
//! deduplicate them and hand every unique piece an offset in its output section. Merging runs
//! after resolution so that dead archive members and COMDAT losers contribute nothing.
//!
//! Deduplication is sharded by hash into a fixed number of buckets so that it can run in
//! parallel without locks. Offsets are handed out bucket by bucket with the pieces inside a
//! bucket sorted by content, so the output doesn't depend on which thread saw a piece first.

use crate::elf::align_to;
use crate::error::Result;
use crate::hash::hash_bytes;
use crate::hash::PassThroughHashMap;
use crate::input_data::FileId;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::symbol_db::PieceRef;
use crate::symbol_db::ResolvedDb;
use crate::symbol_db::SymbolDef;
use ahash::AHashMap;
use anyhow::Context;
use rayon::prelude::*;
use std::hash::Hasher;

const MERGE_BUCKET_BITS: u32 = 4;
const MERGE_BUCKETS: usize = 1 << MERGE_BUCKET_BITS;

/// Written into the merged `.comment` section alongside the compiler version strings from the
/// inputs.
const LINKER_IDENTITY: &str = concat!("Linker: bold ", env!("CARGO_PKG_VERSION"), "\0");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MergedSectionId(u32);

pub(crate) struct MergedSections<'data> {
    pub(crate) sections: Vec<MergedSection<'data>>,
}

pub(crate) struct MergedSection<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_flags: u64,
    pub(crate) sh_type: u32,
    pub(crate) entsize: u64,
    pub(crate) alignment: u64,
    pub(crate) sh_size: u64,
    pub(crate) pieces: Vec<Piece<'data>>,
    lookup: PassThroughHashMap<PieceKey<'data>, u32>,
}

pub(crate) struct Piece<'data> {
    pub(crate) bytes: &'data [u8],
    pub(crate) output_offset: u64,

    /// The input section whose copy of the piece we consider canonical: the contributor with
    /// the lowest (file priority, section index). Only used for reporting; all copies are
    /// identical by definition.
    pub(crate) winner: Option<(FileId, object::SectionIndex)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct PieceKey<'data> {
    hash: u64,
    bytes: &'data [u8],
}

impl<'data> std::hash::Hash for PieceKey<'data> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct SectionKey<'data> {
    name: &'data [u8],
    sh_flags: u64,
    entsize: u64,
}

struct SectionBuilder<'data> {
    name: &'data [u8],
    sh_flags: u64,
    sh_type: u32,
    entsize: u64,
    alignment: u64,
    contributors: Vec<(FileId, object::SectionIndex)>,
    extra: &'static [u8],
}

#[tracing::instrument(skip_all, name = "Merge sections")]
pub(crate) fn merge_sections<'data>(
    files: &mut [ObjectFile<'data>],
    db: &mut ResolvedDb<'data>,
) -> Result<MergedSections<'data>> {
    let mut builders: Vec<SectionBuilder<'data>> = Vec::new();
    let mut lookup: AHashMap<SectionKey<'data>, MergedSectionId> = AHashMap::new();

    // The linker's own contribution to .comment. Registered first so the section exists even
    // when no input carries one.
    let comment_id = MergedSectionId(0);
    lookup.insert(
        SectionKey {
            name: b".comment",
            sh_flags: u64::from(object::elf::SHF_MERGE | object::elf::SHF_STRINGS),
            entsize: 1,
        },
        comment_id,
    );
    builders.push(SectionBuilder {
        name: b".comment",
        sh_flags: u64::from(object::elf::SHF_MERGE | object::elf::SHF_STRINGS),
        sh_type: object::elf::SHT_PROGBITS,
        entsize: 1,
        alignment: 1,
        contributors: Vec::new(),
        extra: LINKER_IDENTITY.as_bytes(),
    });

    // Register contributions in priority order so that the contributor lists (and hence piece
    // winners) don't depend on scheduling.
    for file in files.iter_mut() {
        if !file.is_alive() {
            continue;
        }
        let file_id = file.file_id;
        for slot in &mut file.sections {
            let SectionSlot::Merge(merge) = slot else {
                continue;
            };
            let key = SectionKey {
                name: merge.name,
                sh_flags: merge.sh_flags,
                entsize: merge.entsize,
            };
            let id = *lookup.entry(key).or_insert_with(|| {
                let id = MergedSectionId(builders.len() as u32);
                builders.push(SectionBuilder {
                    name: merge.name,
                    sh_flags: merge.sh_flags,
                    sh_type: merge.sh_type,
                    entsize: merge.entsize,
                    alignment: 1,
                    contributors: Vec::new(),
                    extra: &[],
                });
                id
            });
            let builder = &mut builders[id.0 as usize];
            builder.alignment = builder.alignment.max(merge.alignment);
            builder.contributors.push((file_id, merge.index));
            merge.merged_id = Some(id);
        }
    }

    let sections = {
        let files: &[ObjectFile<'data>] = files;
        builders
            .into_par_iter()
            .map(|builder| build_merged_section(builder, files))
            .collect::<Result<Vec<_>>>()?
    };
    let merged = MergedSections { sections };

    assign_piece_ids(files, &merged)?;
    resolve_merged_symbols(files, db, &merged)?;
    Ok(merged)
}

fn build_merged_section<'data>(
    builder: SectionBuilder<'data>,
    files: &[ObjectFile<'data>],
) -> Result<MergedSection<'data>> {
    // Deduplicate each bucket independently. A piece's bucket depends only on its hash, so
    // every occurrence of a given piece lands in the same bucket.
    let buckets: Vec<Vec<Piece<'data>>> = (0..MERGE_BUCKETS)
        .into_par_iter()
        .map(|bucket| {
            let mut seen: PassThroughHashMap<PieceKey, u32> = Default::default();
            let mut pieces: Vec<Piece> = Vec::new();
            let mut remaining = builder.extra;
            while !remaining.is_empty() {
                let len = memchr::memchr(0, remaining).map(|i| i + 1).unwrap();
                let (bytes, rest) = remaining.split_at(len);
                remaining = rest;
                let hash = hash_bytes(bytes);
                if piece_bucket(hash) != bucket {
                    continue;
                }
                pieces.push(Piece {
                    bytes,
                    output_offset: 0,
                    winner: None,
                });
                seen.insert(PieceKey { hash, bytes }, 0);
            }
            for &(file_id, section_index) in &builder.contributors {
                let SectionSlot::Merge(merge) =
                    &files[file_id.as_usize()].sections[section_index.0]
                else {
                    unreachable!();
                };
                for piece in 0..merge.num_pieces() {
                    let hash = merge.piece_hashes[piece];
                    if piece_bucket(hash) != bucket {
                        continue;
                    }
                    let key = PieceKey {
                        hash,
                        bytes: merge.piece_bytes(piece),
                    };
                    seen.entry(key).or_insert_with(|| {
                        pieces.push(Piece {
                            bytes: key.bytes,
                            output_offset: 0,
                            winner: Some((file_id, section_index)),
                        });
                        0
                    });
                }
            }
            // Offsets are assigned in sorted order so the result is independent of contributor
            // scheduling and stable across runs.
            pieces.sort_unstable_by_key(|p| p.bytes);
            pieces
        })
        .collect();

    let mut section = MergedSection {
        name: builder.name,
        sh_flags: builder.sh_flags,
        sh_type: builder.sh_type,
        entsize: builder.entsize,
        alignment: builder.alignment,
        sh_size: 0,
        pieces: Vec::new(),
        lookup: Default::default(),
    };
    let mut offset = 0;
    for bucket in buckets {
        for mut piece in bucket {
            offset = align_to(offset, builder.alignment);
            piece.output_offset = offset;
            offset += piece.bytes.len() as u64;
            let index = section.pieces.len() as u32;
            section.lookup.insert(
                PieceKey {
                    hash: hash_bytes(piece.bytes),
                    bytes: piece.bytes,
                },
                index,
            );
            section.pieces.push(piece);
        }
    }
    section.sh_size = offset;
    Ok(section)
}

fn piece_bucket(hash: u64) -> usize {
    (hash >> (64 - MERGE_BUCKET_BITS)) as usize
}

/// Records, for every piece of every live mergeable input section, where that piece ended up in
/// the output.
fn assign_piece_ids<'data>(
    files: &mut [ObjectFile<'data>],
    merged: &MergedSections<'data>,
) -> Result {
    files.par_iter_mut().try_for_each(|file| {
        if !file.is_alive() {
            return Ok(());
        }
        for slot in &mut file.sections {
            let SectionSlot::Merge(merge) = slot else {
                continue;
            };
            let section = merged.get(merge.merged_id.unwrap());
            merge.piece_ids = (0..merge.num_pieces())
                .map(|piece| {
                    let key = PieceKey {
                        hash: merge.piece_hashes[piece],
                        bytes: merge.piece_bytes(piece),
                    };
                    section
                        .lookup
                        .get(&key)
                        .copied()
                        .context("Piece missing from merged section")
                })
                .collect::<Result<Vec<u32>>>()?;
        }
        Ok(())
    })
}

/// Symbols that resolved into a mergeable section get a piece reference: the piece containing
/// their value plus the offset within it. Their section link is cleared; from here on the piece
/// is what determines their address.
fn resolve_merged_symbols<'data>(
    files: &[ObjectFile<'data>],
    db: &mut ResolvedDb<'data>,
    _merged: &MergedSections<'data>,
) -> Result {
    for i in 0..db.num_symbols() {
        let SymbolDef::Defined(def) = &db.defs[i] else {
            continue;
        };
        let Some(section_index) = def.section else {
            continue;
        };
        let file = &files[def.file_id.as_usize()];
        let SectionSlot::Merge(merge) = &file.sections[section_index.0] else {
            continue;
        };
        let (piece, offset_in_piece) = merge
            .piece_for_offset(def.value)
            .with_context(|| format!("Invalid merged-section symbol `{}`", db.name_of(i)))?;
        let piece_ref = PieceRef {
            merged: merge.merged_id.unwrap(),
            piece: merge.piece_ids[piece],
            offset: offset_in_piece,
        };
        let SymbolDef::Defined(def) = &mut db.defs[i] else {
            unreachable!();
        };
        def.piece = Some(piece_ref);
        def.section = None;
    }
    Ok(())
}

impl<'data> MergedSections<'data> {
    pub(crate) fn get(&self, id: MergedSectionId) -> &MergedSection<'data> {
        &self.sections[id.0 as usize]
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = MergedSectionId> {
        (0..self.sections.len() as u32).map(MergedSectionId)
    }
}

impl MergedSectionId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl<'data> MergedSection<'data> {
    pub(crate) fn piece(&self, index: u32) -> &Piece<'data> {
        &self.pieces[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_null_terminated() {
        assert!(LINKER_IDENTITY.ends_with('\0'));
    }

    #[test]
    fn test_bucket_is_stable() {
        let h = hash_bytes(b"hello\0");
        assert_eq!(piece_bucket(h), piece_bucket(h));
        assert!(piece_bucket(h) < MERGE_BUCKETS);
    }
}
