// Pinseal — Application Entry Point
//
// Parses CLI arguments, initializes structured logging on stderr, and
// dispatches to the command handler. stdout is reserved for command output
// (and for the PIN alone in `unseal-pin`).

use clap::Parser;

use pinseal::cli::{execute, Cli};

fn main() {
    pinseal::init_logging();

    let cli = Cli::parse();

    if let Err(e) = execute(cli.command) {
        eprintln!("Error: {}", e.diagnostic());
        std::process::exit(e.exit_code());
    }
}
