use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = atelier_flow_cli::Cli::parse();
    atelier_flow_cli::run_cli(cli)
}
