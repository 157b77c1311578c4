//! Host binary: CLI entry point for the RC2014-class Z80 virtual machine.

mod host;

use clap::Parser;
use host::{HostDriver, Options};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = Options::parse();
    if let Err(e) = HostDriver::new(options).run() {
        eprintln!("rc2014-vm: {e}");
        std::process::exit(1);
    }
}
