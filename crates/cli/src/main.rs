mod cmd;
mod docker;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use smartbuild_lib::orchestrator::BuildError;

use crate::cmd::{BuildArgs, HashArgs, cmd_build, cmd_hash};
use crate::output::{print_error, print_hint};

/// smartbuild - Fingerprint-cached container image builds
#[derive(Parser)]
#[command(name = "smartbuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build the units of a plan, reusing images whose inputs are unchanged
  Build(BuildArgs),

  /// Print unit fingerprints and image references without building
  Hash(HashArgs),
}

fn init_logging(verbose: bool) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    if verbose {
      EnvFilter::new("warn,smartbuild_lib=debug,smartbuild_cli=debug")
    } else {
      EnvFilter::new("warn")
    }
  });

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn run(cli: &Cli) -> Result<()> {
  match &cli.command {
    Commands::Build(args) => cmd_build(args, cli.verbose),
    Commands::Hash(args) => cmd_hash(args),
  }
}

fn main() {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  if let Err(e) = run(&cli) {
    print_error(&format!("{:#}", e));
    if let Some(hint) = e.downcast_ref::<BuildError>().and_then(BuildError::hint) {
      print_hint(hint);
    }
    std::process::exit(1);
  }
}
