//! A hand-written parser for our arguments. We don't use a 3rd party library because order is
//! important for some arguments (e.g. -L must affect only the -l flags that come after it) and
//! it's not clear how easy it would be to get that correct with something like clap.

use crate::error::Result;
use anyhow::bail;
use std::num::NonZeroUsize;
use std::path::PathBuf;

pub struct Args {
    pub inputs: Vec<Input>,
    pub output: PathBuf,
    pub print_map: bool,

    /// Write the link map to this file (`-Map`), independently of --print-map.
    pub map_path: Option<PathBuf>,
    pub is_static: bool,
    pub num_threads: NonZeroUsize,
    pub time_phases: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    /// An object file or archive given by path.
    File(PathBuf),

    /// A library given via -l, to be located in the search path that was active when the flag
    /// was seen.
    Lib {
        name: String,
        search_path: Vec<PathBuf>,
    },
}

pub enum Action {
    /// The default. Link something.
    Link(Args),

    /// Print the linker version.
    Version,
}

// These flags don't currently affect our behaviour. We accept them so that we can be used as a
// drop-in replacement in existing build systems.
const IGNORED_FLAGS: &[&str] = &[
    "--build-id",
    "--gc-sections",
    "--no-gc-sections",
    "--start-group",
    "--end-group",
    "-nostdlib",
    "--eh-frame-hdr",
    "--no-eh-frame-hdr",
];

pub fn from_env() -> Result<Action> {
    let mut args = std::env::args();
    // Skip program name.
    args.next();
    parse(args)
}

pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Action> {
    let mut inputs = Vec::new();
    let mut lib_search_path: Vec<PathBuf> = Vec::new();
    let mut output = None;
    let mut print_map = false;
    let mut map_path = None;
    let mut is_static = true;
    let mut num_threads = None;
    let mut time_phases = false;
    while let Some(arg) = input.next() {
        let arg = arg.as_ref();
        let handle_z = |option: &str| -> Result {
            // We don't yet support any -z options, but we shouldn't fail just because a compiler
            // driver passed one.
            let _ = option;
            Ok(())
        };
        if let Some(rest) = arg.strip_prefix("-L") {
            if rest.is_empty() {
                if let Some(dir) = input.next() {
                    lib_search_path.push(PathBuf::from(dir.as_ref()));
                } else {
                    bail!("Missing argument to -L");
                }
            } else {
                lib_search_path.push(PathBuf::from(rest));
            }
        } else if let Some(rest) = arg.strip_prefix("-l") {
            let name = if rest.is_empty() {
                input
                    .next()
                    .map(|s| s.as_ref().to_owned())
                    .ok_or_else(|| anyhow::anyhow!("Missing argument to -l"))?
            } else {
                rest.to_owned()
            };
            inputs.push(Input::Lib {
                name,
                search_path: lib_search_path.clone(),
            });
        } else if arg == "-o" {
            output = input.next().map(|s| PathBuf::from(s.as_ref()));
        } else if let Some(rest) = arg.strip_prefix("--output=") {
            output = Some(PathBuf::from(rest));
        } else if arg == "-M" || arg == "--print-map" {
            print_map = true;
        } else if arg == "-Map" || arg == "--Map" {
            let Some(value) = input.next() else {
                bail!("Missing argument to -Map");
            };
            map_path = Some(PathBuf::from(value.as_ref()));
        } else if let Some(rest) = arg
            .strip_prefix("-Map=")
            .or_else(|| arg.strip_prefix("--Map="))
        {
            map_path = Some(PathBuf::from(rest));
        } else if arg == "-static" || arg == "--static" || arg == "-Bstatic" {
            is_static = true;
        } else if arg == "--time" {
            time_phases = true;
        } else if let Some(rest) = arg.strip_prefix("--threads=") {
            num_threads = Some(NonZeroUsize::new(rest.parse()?).ok_or_else(|| {
                anyhow::anyhow!("Invalid thread count")
            })?);
        } else if arg == "--threads" {
            let Some(value) = input.next() else {
                bail!("Missing argument to --threads");
            };
            num_threads = Some(NonZeroUsize::new(value.as_ref().parse()?).ok_or_else(|| {
                anyhow::anyhow!("Invalid thread count")
            })?);
        } else if arg == "--version" || arg == "-v" {
            return Ok(Action::Version);
        } else if arg == "-shared" || arg == "--shared" || arg == "-pie" || arg == "--pie" {
            bail!("Only static executable output is supported");
        } else if arg == "-dynamic-linker" || arg == "--dynamic-linker" {
            bail!("Dynamic linking is not supported");
        } else if arg == "-z" {
            if let Some(value) = input.next() {
                handle_z(value.as_ref())?;
            }
        } else if let Some(rest) = arg.strip_prefix("-z") {
            handle_z(rest)?;
        } else if IGNORED_FLAGS.contains(&arg) {
        } else if arg.starts_with('-') && arg.len() > 1 {
            bail!("Unrecognised argument `{arg}`");
        } else {
            inputs.push(Input::File(PathBuf::from(arg)));
        }
    }
    if inputs.is_empty() {
        bail!("No input files");
    }
    Ok(Action::Link(Args {
        inputs,
        output: output.unwrap_or_else(|| PathBuf::from("a.out")),
        print_map,
        map_path,
        is_static,
        num_threads: num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().unwrap_or(NonZeroUsize::new(1).unwrap())
        }),
        time_phases,
    }))
}

impl Args {
    pub fn setup_thread_pool(&self) -> Result {
        // Building the global pool fails if it has already been built, which happens when we're
        // invoked more than once from the same process (e.g. from tests). The pool we got first
        // time is fine to reuse.
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads.get())
            .build_global();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_link(args: &[&str]) -> Args {
        match parse(args.iter()).unwrap() {
            Action::Link(args) => args,
            Action::Version => panic!("Expected link action"),
        }
    }

    #[test]
    fn test_basic_parse() {
        let args = parse_link(&[
            "a.o", "-o", "out", "--print-map", "-Map=out.map", "--static", "--threads=3", "-L",
            "/usr/lib", "-lfoo",
        ]);
        assert_eq!(args.output, PathBuf::from("out"));
        assert!(args.print_map);
        assert_eq!(args.map_path, Some(PathBuf::from("out.map")));
        assert!(args.is_static);
        assert_eq!(args.num_threads.get(), 3);
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.inputs[0], Input::File(PathBuf::from("a.o")));
        assert_eq!(
            args.inputs[1],
            Input::Lib {
                name: "foo".to_owned(),
                search_path: vec![PathBuf::from("/usr/lib")],
            }
        );
    }

    #[test]
    fn test_rejects_dynamic_output() {
        assert!(parse(["a.o", "-shared"].iter()).is_err());
        assert!(parse(["a.o", "-pie"].iter()).is_err());
    }

    #[test]
    fn test_ignored_and_unknown_flags() {
        let args = parse_link(&["--start-group", "a.o", "--end-group"]);
        assert_eq!(args.inputs.len(), 1);
        assert!(parse(["a.o", "--definitely-not-a-flag"].iter()).is_err());
    }
}
