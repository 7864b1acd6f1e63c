//! Azure Table Storage / Cosmos DB Table API client.
//!
//! Only the handful of single-entity calls the counter needs are implemented:
//! point query, insert, conditional replace and table creation. Requests are
//! authorized with SharedKeyLite.
use crate::store::{CreateOutcome, Entity, Lookup, TableStore, UpdateOutcome};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{header, Client, Method, RequestBuilder, StatusCode, Url};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

const API_VERSION: &str = "2019-02-02";
const DATA_SERVICE_VERSION: &str = "3.0;NetFx";
const ACCEPT_NO_METADATA: &str = "application/json;odata=nometadata";

const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_TABLE_ENDPOINT: &str = "http://127.0.0.1:10002/devstoreaccount1";

/// Parsed storage connection string.
#[derive(Clone)]
pub struct StorageAccount {
    pub account_name: String,
    account_key: Vec<u8>,
    pub table_endpoint: Url,
}

impl std::fmt::Debug for StorageAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAccount")
            .field("account_name", &self.account_name)
            .field("table_endpoint", &self.table_endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl StorageAccount {
    pub fn from_connection_string(conn: &str) -> Result<Self> {
        let mut name = None;
        let mut key = None;
        let mut protocol = None;
        let mut suffix = None;
        let mut table_endpoint = None;
        let mut development = false;

        for part in conn.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| anyhow!("Malformed connection string segment"))?;
            match k.trim().to_ascii_lowercase().as_str() {
                "accountname" => name = Some(v.trim().to_string()),
                "accountkey" => key = Some(v.trim().to_string()),
                "defaultendpointsprotocol" => protocol = Some(v.trim().to_string()),
                "endpointsuffix" => suffix = Some(v.trim().to_string()),
                "tableendpoint" => table_endpoint = Some(v.trim().to_string()),
                "usedevelopmentstorage" => development = v.trim().eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        if development {
            return Self::build(DEV_ACCOUNT_NAME, DEV_ACCOUNT_KEY, DEV_TABLE_ENDPOINT);
        }

        let name = name.ok_or_else(|| anyhow!("Connection string has no AccountName"))?;
        let key = key.ok_or_else(|| anyhow!("Connection string has no AccountKey"))?;
        let endpoint = table_endpoint.unwrap_or_else(|| {
            format!(
                "{}://{}.table.{}",
                protocol.as_deref().unwrap_or("https"),
                name,
                suffix.as_deref().unwrap_or("core.windows.net")
            )
        });
        Self::build(&name, &key, &endpoint)
    }

    fn build(name: &str, key: &str, endpoint: &str) -> Result<Self> {
        let account_key = STANDARD
            .decode(key)
            .context("AccountKey is not valid base64")?;
        let table_endpoint =
            Url::parse(endpoint.trim_end_matches('/')).context("Invalid table endpoint")?;
        Ok(Self {
            account_name: name.to_string(),
            account_key,
            table_endpoint,
        })
    }

    /// SharedKeyLite signature for the table service.
    pub fn sign(&self, date: &str, canonical_resource: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.account_key)
            .map_err(|e| anyhow!("Invalid account key: {}", e))?;
        mac.update(format!("{}\n{}", date, canonical_resource).as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

pub fn validate_table_name(name: &str) -> Result<()> {
    let valid = (3..=63).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric())
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if !valid {
        bail!(
            "Invalid table name '{}': use 3-63 alphanumeric characters starting with a letter",
            name
        );
    }
    Ok(())
}

/// Escape characters the table service refuses in PartitionKey/RowKey.
/// `%` is escaped too so distinct identities never map to the same key.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        let forbidden = matches!(c, '/' | '\\' | '#' | '?' | '%')
            || c.is_control();
        if forbidden {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", b));
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn odata_key(key: &str) -> String {
    urlencoding::encode(&escape_key(key).replace('\'', "''")).into_owned()
}

fn rfc1123(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Serialize an entity body. Integers go out as Edm.Int64, which the wire
/// format carries as strings.
pub fn entity_body(entity: &Entity) -> Value {
    let mut body = Map::new();
    body.insert(
        "PartitionKey".to_string(),
        Value::String(escape_key(&entity.partition_key)),
    );
    body.insert("RowKey".to_string(), Value::String(escape_key(&entity.row_key)));
    for (name, value) in &entity.properties {
        match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => {
                body.insert(name.clone(), Value::String(n.to_string()));
                body.insert(
                    format!("{}@odata.type", name),
                    Value::String("Edm.Int64".to_string()),
                );
            }
            other => {
                body.insert(name.clone(), other.clone());
            }
        }
    }
    Value::Object(body)
}

/// Strip keys and service metadata from a queried entity.
pub fn user_properties(raw: Map<String, Value>) -> Map<String, Value> {
    raw.into_iter()
        .filter(|(k, _)| {
            !matches!(k.as_str(), "PartitionKey" | "RowKey" | "Timestamp")
                && !k.starts_with("odata.")
                && !k.contains("@odata.")
        })
        .collect()
}

#[derive(Clone)]
pub struct TableClient {
    client: Client,
    account: StorageAccount,
    table: String,
}

impl TableClient {
    pub fn new(account: StorageAccount, table: &str, timeout: Duration) -> Result<Self> {
        validate_table_name(table)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            account,
            table: table.to_string(),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn entity_resource(&self, partition_key: &str, row_key: &str) -> String {
        format!(
            "{}(PartitionKey='{}',RowKey='{}')",
            self.table,
            odata_key(partition_key),
            odata_key(row_key)
        )
    }

    fn request(&self, method: Method, resource: &str) -> Result<RequestBuilder> {
        let base = self.account.table_endpoint.as_str().trim_end_matches('/');
        let url = Url::parse(&format!("{}/{}", base, resource))
            .with_context(|| format!("Invalid table URL for {}", resource))?;
        let date = rfc1123(Utc::now());
        let canonical = format!("/{}{}", self.account.account_name, url.path());
        let signature = self.account.sign(&date, &canonical)?;
        Ok(self
            .client
            .request(method, url)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("DataServiceVersion", DATA_SERVICE_VERSION)
            .header("MaxDataServiceVersion", DATA_SERVICE_VERSION)
            .header(header::ACCEPT, ACCEPT_NO_METADATA)
            .header(
                header::AUTHORIZATION,
                format!("SharedKeyLite {}:{}", self.account.account_name, signature),
            ))
    }

    /// Create the table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<bool> {
        let res = self
            .request(Method::POST, "Tables")?
            .header("Prefer", "return-no-content")
            .json(&serde_json::json!({ "TableName": self.table }))
            .send()
            .await
            .context("Create table request failed")?;
        match res.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            status => Err(service_error("create table", status, res).await),
        }
    }
}

/// Successful reads always carry the row version.
fn require_etag(headers: &header::HeaderMap, partition_key: &str, row_key: &str) -> Result<String> {
    match headers.get(header::ETAG).map(|v| v.to_str()) {
        Some(Ok(etag)) if !etag.trim().is_empty() => Ok(etag.to_string()),
        Some(_) => bail!("Entity {}/{} returned an unreadable ETag", partition_key, row_key),
        None => bail!("Entity {}/{} returned no ETag", partition_key, row_key),
    }
}

async fn service_error(op: &str, status: StatusCode, res: reqwest::Response) -> anyhow::Error {
    let body = res.text().await.unwrap_or_default();
    anyhow!("Table {} failed with {}: {}", op, status, body)
}

#[async_trait]
impl TableStore for TableClient {
    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Lookup> {
        let res = self
            .request(Method::GET, &self.entity_resource(partition_key, row_key))?
            .send()
            .await
            .context("Query entity request failed")?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                debug!("Entity {}/{} not found", partition_key, row_key);
                return Ok(Lookup::NotFound);
            }
            status => return Err(service_error("query entity", status, res).await),
        }

        let etag = require_etag(res.headers(), partition_key, row_key)?;
        let raw: Map<String, Value> = res.json().await.context("Entity JSON parse failed")?;
        Ok(Lookup::Found(Entity {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            properties: user_properties(raw),
            etag: Some(etag),
        }))
    }

    async fn create(&self, entity: &Entity) -> Result<CreateOutcome> {
        let res = self
            .request(Method::POST, &self.table)?
            .header("Prefer", "return-no-content")
            .json(&entity_body(entity))
            .send()
            .await
            .context("Insert entity request failed")?;
        match res.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(CreateOutcome::Created),
            StatusCode::CONFLICT => Ok(CreateOutcome::AlreadyExists),
            status => Err(service_error("insert entity", status, res).await),
        }
    }

    async fn update(&self, entity: &Entity) -> Result<UpdateOutcome> {
        let res = self
            .request(
                Method::PUT,
                &self.entity_resource(&entity.partition_key, &entity.row_key),
            )?
            .header(header::IF_MATCH, entity.etag.as_deref().unwrap_or("*"))
            .json(&entity_body(entity))
            .send()
            .await
            .context("Update entity request failed")?;
        match res.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(UpdateOutcome::Updated),
            StatusCode::NOT_FOUND => Ok(UpdateOutcome::NotFound),
            StatusCode::PRECONDITION_FAILED => Ok(UpdateOutcome::Conflict),
            status => Err(service_error("update entity", status, res).await),
        }
    }
}
