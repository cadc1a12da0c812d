use std::env;

use instmux::{preload_builtin_tables, CommandTable, Endpoint, LinkConfig, PortRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    preload_builtin_tables()?;
    // INSTMUX_LOG_PAYLOADS=1 RUST_LOG=debug shows every line on the wire
    env_logger::init();

    let host = env::var("SDG_ADDR").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = env::var("SDG_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(4001);

    let registry = PortRegistry::new();
    registry.register(
        "sdg",
        Endpoint::tcp(&host, port),
        CommandTable::coherent_sdg()?,
        LinkConfig::from_env(),
    )?;

    println!("Reading output delays from {host}:{port}");
    for id in [8, 10, 12] {
        let ch = registry.bind("sdg", 0, id).await?;
        let name = ch.descriptor().map(|d| d.description.clone()).unwrap_or_default();
        match ch.read_float().await {
            Ok(v) => println!("{name}: {v:.1}"),
            Err(e) => eprintln!("{name}: read failed: {e}"),
        }
    }

    print!("{}", registry.report(1));
    Ok(())
}
