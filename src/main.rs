use std::process::ExitCode;

use clap::Parser;

use masktile::{cli, logger};

fn main() -> ExitCode {
    let args = cli::CliArgs::parse();
    // Overwrites the previous run's log
    logger::init(args.command.name());
    cli::run(args)
}
