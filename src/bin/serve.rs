use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use poe2_ggpk::server::Backend;
use poe2_ggpk::Config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "./config.json")]
    config: PathBuf,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    Arc::new(Backend::new(config)).run(&args.addr)
}
