//! Demo: load a store config, then exercise a few typed operations.
//!
//! Usage: `skv-demo [config.json]` (defaults to `server.json`).

use anyhow::Context;
use serde::{Deserialize, Serialize};
use skv_client::{Json, StoreClient, StoreConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Account {
    name: String,
    visits: u32,
    admin: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "server.json".to_string());
    let config = StoreConfig::from_json_file(&path)
        .with_context(|| format!("loading {}", path))?
        .into_pool_config();
    let client = StoreClient::with_config(config).context("building client")?;

    client.set("apples", "hello")?;
    let apples: String = client.get("apples")?;
    info!(%apples, "read back string");

    let account = Account {
        name: "demo".into(),
        visits: 1,
        admin: false,
    };
    client.set("account:json", &Json(&account))?;
    let Json(stored) = client.get::<Json<Account>>("account:json")?;
    info!(?stored, "read back json blob");

    client.set_object("account:hash", &account)?;
    let visits = client.hincrby("account:hash", "visits", 1)?;
    let hashed: Account = client.get_object("account:hash")?;
    info!(visits, ?hashed, "read back hash object");

    let stats = client.stats();
    info!(idle = stats.idle, active = stats.active, "pool stats");
    Ok(())
}
