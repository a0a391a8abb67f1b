//! `nova-extd`: run Nova extension workers from the terminal.

use console::style;

fn main() {
    nova_extensions::logging::init();

    if let Err(e) = nova_extensions::cli::run() {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
}
