fn main() -> bold::error::Result {
    match bold::args::from_env()? {
        bold::args::Action::Link(args) => {
            bold::setup_tracing(&args);
            bold::link(&args)
        }
        bold::args::Action::Version => {
            println!("bold {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
