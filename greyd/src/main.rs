use std::path::PathBuf;

use clap::Parser;
use greyd_common::config::Config;

#[derive(Debug, Parser)]
#[command(name = "greyd", about = "A tarpitting and greylisting anti-spam daemon")]
struct Args {
    /// Configuration file; built-in defaults apply when omitted.
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    greyd_common::logging::init(args.debug);

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    greyd::run(config, args.config).await
}
