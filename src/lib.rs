//! A parallel linker for static x86-64 ELF executables. Object files and archives go in, one
//! statically linked executable comes out. Files, sections and symbols are processed
//! concurrently wherever the pipeline allows, while every tie is broken on command-line order
//! so the output is byte-for-byte reproducible regardless of thread count.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub(crate) mod archive;
pub(crate) mod archive_splitter;
pub mod args;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod fs;
pub(crate) mod hash;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod map_file;
pub(crate) mod parsing;
pub(crate) mod resolution;
pub(crate) mod slice;
pub(crate) mod string_merging;
pub(crate) mod symbol_db;
pub(crate) mod timing;

pub fn setup_tracing(args: &args::Args) {
    if args.time_phases {
        timing::init_tracing();
    } else {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(EnvFilter::from_default_env())
            .try_init();
    }
}

#[tracing::instrument(skip_all, name = "Link")]
pub fn link(args: &args::Args) -> error::Result {
    args.setup_thread_pool()?;
    let input_data = input_data::InputData::from_args(args)?;
    let inputs = archive_splitter::split_archives(&input_data)?;
    let mut files = parsing::parse_input_files(&inputs)?;
    let symbol_db = symbol_db::SymbolDb::build(&mut files)?;
    let mut db = resolution::resolve_symbols(&mut files, symbol_db)?;
    let merged = string_merging::merge_sections(&mut files, &mut db)?;
    let layout = layout::compute(&mut files, &mut db, merged)?;
    let mut output = elf_writer::Output::create(&args.output, layout.file_size)?;
    output.write(&files, &db, &layout)?;
    output.finish()?;
    map_file::emit(args, &files, &db, &layout)?;
    Ok(())
}
