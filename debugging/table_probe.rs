//! Print the stored total and, optionally, one visitor record from the table.
//! Uses COSMOS_CONNECTION_STRING and TABLE_NAME from the environment (.env supported).
//!
//! Usage: table_probe [identity]

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use visitcount::config::DEFAULT_TABLE_NAME;
use visitcount::counter::{read_count, COUNTER_PARTITION, COUNTER_ROW, VISITOR_PARTITION};
use visitcount::store::{Lookup, TableStore};
use visitcount::table::{StorageAccount, TableClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present for local runs.
    dotenv().ok();

    let conn = env::var("COSMOS_CONNECTION_STRING")
        .context("Missing COSMOS_CONNECTION_STRING in environment")?;
    let table = env::var("TABLE_NAME").unwrap_or_else(|_| DEFAULT_TABLE_NAME.to_string());

    let account = StorageAccount::from_connection_string(&conn)?;
    println!("account: {:?}", account);
    let client = TableClient::new(account, &table, Duration::from_secs(10))?;

    match client.get(COUNTER_PARTITION, COUNTER_ROW).await? {
        Lookup::Found(entity) => println!(
            "count: {} (etag {})",
            read_count(&entity),
            entity.etag.as_deref().unwrap_or("-")
        ),
        Lookup::NotFound => println!("count: no counter entity yet"),
    }

    if let Some(identity) = env::args().nth(1) {
        match client.get(VISITOR_PARTITION, &identity).await? {
            Lookup::Found(entity) => println!(
                "{}: {}",
                identity,
                serde_json::to_string_pretty(&entity.properties)?
            ),
            Lookup::NotFound => println!("{}: never seen", identity),
        }
    }

    Ok(())
}
