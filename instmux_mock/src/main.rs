use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use instmux_mock::MockServer;

/// Mock ASCII instrument answering an instmux command table over TCP.
#[derive(Debug, Parser)]
#[command(name = "instmux-mock", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:4001")]
    listen: String,

    /// Built-in table (`coherent_sdg`, `dg645`, `tpg261`) to emulate.
    #[arg(long, default_value = "coherent_sdg", conflicts_with = "table_file")]
    table: String,

    /// Command-table TOML file to emulate instead of a built-in table.
    #[arg(long)]
    table_file: Option<PathBuf>,

    /// Identity returned for the identification request.
    #[arg(long)]
    identity: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let server = match &args.table_file {
        Some(path) => {
            let src = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            MockServer::from_table_toml(&src)?
        }
        None => match args.table.as_str() {
            "coherent_sdg" | "sdg" => MockServer::coherent_sdg()?,
            "dg645" => MockServer::dg645()?,
            "tpg261" => MockServer::tpg261()?,
            other => anyhow::bail!("no built-in table named {other:?}"),
        },
    };
    let server = match args.identity {
        Some(id) => server.with_identity(id),
        None => server,
    };

    server.run(&args.listen).await
}
