use clap::Parser;
use logfetcher::cli::{Cli, Commands};

#[test]
fn fetch_subcommand_parses() {
    let cli = Cli::try_parse_from(["lf", "fetch"]).expect("parse");
    let Commands::Fetch { verbose } = cli.command;
    assert!(!verbose);
}

#[test]
fn verbose_flag_short_and_long() {
    let cli = Cli::try_parse_from(["lf", "fetch", "-v"]).expect("parse short");
    let Commands::Fetch { verbose } = cli.command;
    assert!(verbose);

    let cli = Cli::try_parse_from(["lf", "fetch", "--verbose"]).expect("parse long");
    let Commands::Fetch { verbose } = cli.command;
    assert!(verbose);
}

#[test]
fn missing_subcommand_is_an_error() {
    assert!(Cli::try_parse_from(["lf"]).is_err());
}
