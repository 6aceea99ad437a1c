use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(error) = opsflow_cli::logging::init_logging() {
        eprintln!("{error:#}");
    }
    opsflow_cli::run()
}
