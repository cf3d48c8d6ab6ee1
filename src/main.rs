use std::process::ExitCode;

fn main() -> ExitCode {
    dotnet_interp::run_cli()
}
