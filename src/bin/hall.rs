//! Shim binary that calls into the `hall_gateway` library's `inner_main`.
use clap::Parser as _;
use eyre::Result;

use hall_gateway::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    hall_gateway::inner_main(Cli::parse()).await
}
