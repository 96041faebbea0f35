mod cli;
mod report;

use anyhow::Result;
use clap::Parser;

use crate::cli::{run_cli, Cli};

fn main() -> Result<()> {
    run_cli(Cli::parse())
}
