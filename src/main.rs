use anyhow::Result;

use scard_client::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}
