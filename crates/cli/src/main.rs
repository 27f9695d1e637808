use std::process::ExitCode;

fn main() -> ExitCode {
    kuria_cli::run()
}
