use clap::Parser;
use raptor::commands::{self, Cli};
use raptor::logging;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logger(cli.verbose);
    commands::run(cli)
}
