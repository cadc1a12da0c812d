use std::env;

use instmux::{CommandTable, Endpoint, LinkConfig, PortRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let addr = env::var("SDG_ADDR").unwrap_or_else(|_| "127.0.0.1:4001".into());
    let rate: i32 = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    let registry = PortRegistry::new();
    registry.register(
        "sdg",
        Endpoint::Tcp(addr.clone()),
        CommandTable::coherent_sdg()?,
        LinkConfig::from_env(),
    )?;

    let ch = registry.bind("sdg", 0, 1).await?;
    println!("{addr}: {}", ch.port().identity());
    ch.write_int(rate).await?;
    println!("trigger rate now {}", ch.read_int().await?);
    Ok(())
}
