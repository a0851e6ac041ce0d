use anyhow::Context;
use arm64_to_sim_rs::convert;
use clap::Parser;
use crossterm::style::Stylize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command()]
struct Args {
    /// The arm64 binary to be patched in place
    binary: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    convert(&args.binary)
        .with_context(|| format!("failed to convert `{}`", args.binary.display()))?;

    println!("{}", "Done!".green().bold());
    Ok(())
}
