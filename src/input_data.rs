//! Code for figuring out what input files we need to read then mapping them into memory.

use crate::args::Args;
use crate::args::Input;
use crate::error::Result;
use crate::file_kind::FileKind;
use anyhow::bail;
use anyhow::Context;
use memmap2::Mmap;
use std::collections::HashSet;
use std::fmt::Display;
use std::path::PathBuf;

pub struct InputData<'config> {
    pub config: &'config Args,
    pub(crate) files: Vec<InputFile>,
}

/// Identifies an input object. Objects are numbered in command-line order (with archive members
/// numbered in archive order at the position of the archive), so a `FileId` doubles as the
/// file's priority: when two files both supply something, the file with the lower ID wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FileId(u32);

pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    bytes: Mmap,
}

/// Identifies an input object that may be a regular file on disk or an entry in an archive, in
/// which case `entry` carries the member's name.
#[derive(Clone, Copy)]
pub(crate) struct InputRef<'data> {
    pub(crate) file: &'data InputFile,
    pub(crate) entry: Option<&'data [u8]>,
}

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        &self.bytes
    }
}

impl<'config> InputData<'config> {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub fn from_args(config: &'config Args) -> Result<Self> {
        let mut input_data = Self {
            config,
            files: Vec::with_capacity(config.inputs.len()),
        };
        let mut seen = HashSet::new();
        for input in &config.inputs {
            let path = resolve_input(input)?;
            // The same file can legitimately appear on the command line more than once (e.g. an
            // archive listed twice for grouping purposes). Linking it twice would just produce
            // duplicate definitions.
            if !seen.insert(path.clone()) {
                continue;
            }
            input_data.register_file(path)?;
        }
        Ok(input_data)
    }

    fn register_file(&mut self, path: PathBuf) -> Result {
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;

        // Safety: this is only sound if nothing modifies the file while we've got it mapped. We
        // accept that risk: inputs come from the compile stage of the same build and mmap is a
        // large enough win (we touch only the parts of each file we need, and the kernel can
        // reclaim pages under memory pressure) that reading everything up-front isn't really an
        // option.
        let bytes = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap input file `{}`", path.display()))?;

        let kind = FileKind::identify_bytes(&bytes)
            .with_context(|| format!("Failed to process `{}`", path.display()))?;
        self.files.push(InputFile {
            filename: path,
            kind,
            bytes,
        });
        Ok(())
    }
}

fn resolve_input(input: &Input) -> Result<PathBuf> {
    match input {
        Input::File(path) => Ok(path.clone()),
        Input::Lib { name, search_path } => {
            // Static output, so we only ever look for static libraries.
            let filename = format!("lib{name}.a");
            for dir in search_path {
                let path = dir.join(&filename);
                if path.exists() {
                    return Ok(path);
                }
            }
            bail!("Couldn't find library `{filename}` in search path");
        }
    }
}

impl FileId {
    pub(crate) const fn new(value: u32) -> Self {
        Self(value)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn as_u32(self) -> u32 {
        self.0
    }
}

impl<'data> Display for InputRef<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.file.filename.display().fmt(f)?;
        if let Some(entry) = self.entry {
            write!(f, "({})", String::from_utf8_lossy(entry))?;
        }
        Ok(())
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
