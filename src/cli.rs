use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Fetch rotated logs from all configured hosts", display_order = 1)]
    Fetch {
        #[clap(
            short,
            long,
            help = "Force debug log level and echo log output to stdout as well"
        )]
        verbose: bool,
    },
}
