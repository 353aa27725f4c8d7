//! `echo`: inspect and edit an ECHO space from the command line.

/// CLI module - command-line interface for echo
mod cli;

fn main() {
    cli::run_cli();
}
