use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    memory_kernel_belief_cli::init_tracing();
    let cli = memory_kernel_belief_cli::Cli::parse();
    memory_kernel_belief_cli::run_cli(cli)
}
