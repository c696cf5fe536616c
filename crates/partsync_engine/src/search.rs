//! Search store adapter.
//!
//! Index-per-run: each sync writes into a fresh timestamped index tuned for
//! bulk loading (no refresh, async translog, single merge thread), then the
//! serving alias is swapped onto it in one atomic `_aliases` call. Readers
//! keep hitting the previous index until the swap, so a half-loaded run is
//! never visible.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use partsync_protocol::defaults::{ES_BULK_TIMEOUT_SECS, ES_CHUNKS_IN_FLIGHT};
use partsync_protocol::SyncError;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

pub struct SearchStore {
    http: reqwest::Client,
    node: String,
    alias: String,
    username: Option<String>,
    password: Option<String>,
    chunk_pairs: usize,
    chunks_in_flight: usize,
}

impl SearchStore {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(ES_BULK_TIMEOUT_SECS))
            .build()
            .context("Failed to build search store client")?;

        Ok(Self {
            http,
            node: config.search_node.trim_end_matches('/').to_string(),
            alias: config.search_alias.clone(),
            username: config.search_username.clone(),
            password: config.search_password.clone(),
            chunk_pairs: config.limits.es_chunk_pairs.max(1),
            chunks_in_flight: ES_CHUNKS_IN_FLIGHT,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.node, path.trim_start_matches('/'));
        let mut request = self.http.request(method, url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        request
    }

    /// Cheap reachability probe. The pipeline degrades to primary-only when
    /// this fails; it never aborts the run.
    pub async fn health(&self) -> Result<()> {
        self.request(Method::GET, "_cluster/health")
            .send()
            .await
            .context("search store unreachable")?
            .error_for_status()
            .context("search store unhealthy")?;
        Ok(())
    }

    /// Physical index name for a run started at `now`.
    pub fn run_index_name(&self, now: DateTime<Utc>) -> String {
        format!("{}_{}", self.alias, now.format("%Y%m%d_%H%M%S"))
    }

    /// Create this run's index and return its name.
    pub async fn prepare_run(&self, now: DateTime<Utc>) -> Result<String> {
        let name = self.run_index_name(now);
        self.create_run_index(&name).await?;
        Ok(name)
    }

    /// Create a run index with the load-tuned settings and fixed mappings.
    pub async fn create_run_index(&self, name: &str) -> Result<()> {
        let response = self
            .request(Method::PUT, name)
            .json(&run_index_body())
            .send()
            .await
            .context("index create request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(
                SyncError::Load(format!("index create returned {}: {}", status, body)).into(),
            );
        }

        info!(index = name, "run index created");
        Ok(())
    }

    /// Stream one search shard into `_bulk`, chunked on pair boundaries,
    /// with a bounded number of chunk POSTs in flight. Returns the number
    /// of documents indexed without error.
    pub async fn ingest_shard(&self, bulk_path: &Path) -> Result<u64> {
        let file = tokio::fs::File::open(bulk_path)
            .await
            .with_context(|| format!("Failed to open shard {}", bulk_path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let max_lines = self.chunk_pairs * 2;
        let mut chunk: Vec<String> = Vec::with_capacity(max_lines.min(65_536));
        let mut in_flight = FuturesUnordered::new();
        let mut indexed = 0u64;

        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            chunk.push(line);

            // Cutting on even line counts keeps action/document pairs whole.
            if chunk.len() >= max_lines {
                let body = drain_chunk(&mut chunk);
                in_flight.push(self.post_bulk(body));
                if in_flight.len() >= self.chunks_in_flight {
                    if let Some(result) = in_flight.next().await {
                        indexed += result?;
                    }
                }
            }
        }

        if !chunk.is_empty() {
            in_flight.push(self.post_bulk(drain_chunk(&mut chunk)));
        }
        while let Some(result) = in_flight.next().await {
            indexed += result?;
        }

        debug!(shard = %bulk_path.display(), indexed, "shard ingested");
        Ok(indexed)
    }

    async fn post_bulk(&self, body: String) -> Result<u64> {
        let response = self
            .request(Method::POST, "_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .context("bulk request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(SyncError::Load(format!("bulk returned {}", status)).into());
        }

        let parsed: Value = response.json().await.context("bad bulk response body")?;
        let empty = Vec::new();
        let items = parsed["items"].as_array().unwrap_or(&empty);

        let mut indexed = 0u64;
        let mut first_error: Option<String> = None;
        let mut error_count = 0u64;

        for item in items {
            let error = &item["index"]["error"];
            if error.is_null() {
                indexed += 1;
            } else {
                error_count += 1;
                if first_error.is_none() {
                    first_error = Some(error.to_string());
                }
            }
        }

        // One sampled error per chunk; the rest are only counted.
        if let Some(error) = first_error {
            warn!(errors = error_count, sample = %error, "bulk chunk had failures");
        }
        Ok(indexed)
    }

    /// Promote the run index behind the serving alias:
    /// refresh, restore normal settings, then one atomic alias swap.
    /// Returns the indexes that previously held the alias.
    pub async fn promote(&self, run_index: &str) -> Result<Vec<String>> {
        self.request(Method::POST, &format!("{}/_refresh", run_index))
            .send()
            .await
            .context("refresh failed")?
            .error_for_status()
            .context("refresh rejected")?;

        self.request(Method::PUT, &format!("{}/_settings", run_index))
            .json(&json!({
                "index": {
                    "refresh_interval": "5s",
                    "translog.durability": "request",
                    "translog.sync_interval": "5s",
                    "merge.scheduler.max_thread_count": null,
                }
            }))
            .send()
            .await
            .context("settings restore failed")?
            .error_for_status()
            .context("settings restore rejected")?;

        let holders = self.current_alias_holders().await?;

        let mut actions: Vec<Value> = holders
            .iter()
            .filter(|holder| holder.as_str() != run_index)
            .map(|holder| json!({"remove": {"index": holder, "alias": self.alias}}))
            .collect();
        actions.push(json!({"add": {"index": run_index, "alias": self.alias}}));

        let response = self
            .request(Method::POST, "_aliases")
            .json(&json!({ "actions": actions }))
            .send()
            .await
            .context("alias swap failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(
                SyncError::Load(format!("alias swap returned {}: {}", status, body)).into(),
            );
        }

        info!(alias = %self.alias, index = run_index, "alias promoted");
        Ok(holders
            .into_iter()
            .filter(|holder| holder != run_index)
            .collect())
    }

    /// Indexes currently holding the alias. A concrete index squatting on
    /// the alias name (legacy deployments) is deleted here so the swap can
    /// go through.
    async fn current_alias_holders(&self) -> Result<Vec<String>> {
        let response = self
            .request(Method::GET, &format!("_alias/{}", self.alias))
            .send()
            .await
            .context("alias lookup failed")?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                let exists = self
                    .request(Method::HEAD, &self.alias)
                    .send()
                    .await
                    .context("index existence check failed")?
                    .status()
                    .is_success();
                if exists {
                    warn!(alias = %self.alias, "alias name is a concrete index; deleting it");
                    self.request(Method::DELETE, &self.alias)
                        .send()
                        .await
                        .context("legacy index delete failed")?
                        .error_for_status()
                        .context("legacy index delete rejected")?;
                }
                Ok(Vec::new())
            }
            status if status.is_success() => {
                let body: Value = response.json().await.context("bad alias response")?;
                Ok(body
                    .as_object()
                    .map(|map| map.keys().cloned().collect())
                    .unwrap_or_default())
            }
            status => Err(SyncError::Load(format!("alias lookup returned {}", status)).into()),
        }
    }

    /// Delete indexes displaced by the swap. Failures are logged and
    /// swallowed; the run has already succeeded.
    pub async fn cleanup_old_indexes(&self, previous: &[String]) -> u64 {
        let mut deleted = 0u64;
        for index in previous {
            match self.request(Method::DELETE, index).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(index = %index, "old index deleted");
                    deleted += 1;
                }
                Ok(response) => {
                    warn!(index = %index, status = %response.status(), "old index delete failed")
                }
                Err(e) => warn!(index = %index, error = %e, "old index delete failed"),
            }
        }
        deleted
    }
}

fn drain_chunk(chunk: &mut Vec<String>) -> String {
    let mut body = chunk.join("\n");
    body.push('\n');
    chunk.clear();
    body
}

/// Settings and mappings for a run index, tuned for one massive write
/// burst followed by read-only serving.
fn run_index_body() -> Value {
    json!({
        "settings": {
            "number_of_shards": 5,
            "number_of_replicas": 0,
            "refresh_interval": "-1",
            "max_result_window": 50000,
            "translog": {
                "durability": "async",
                "sync_interval": "120s",
                "flush_threshold_size": "2gb"
            },
            "merge": {
                "scheduler": { "max_thread_count": 1 }
            },
            "analysis": {
                "filter": {
                    "autocomplete_filter": {
                        "type": "edge_ngram",
                        "min_gram": 2,
                        "max_gram": 20
                    }
                },
                "analyzer": {
                    "part_number_analyzer": {
                        "type": "custom",
                        "tokenizer": "keyword",
                        "filter": ["lowercase"]
                    },
                    "autocomplete_analyzer": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "autocomplete_filter"]
                    },
                    "autocomplete_search_analyzer": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase"]
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "partNumber": {
                    "type": "keyword",
                    "fields": {
                        "text": {
                            "type": "text",
                            "analyzer": "part_number_analyzer"
                        },
                        "autocomplete": {
                            "type": "text",
                            "analyzer": "autocomplete_analyzer",
                            "search_analyzer": "autocomplete_search_analyzer"
                        }
                    }
                },
                "description": {
                    "type": "text",
                    "fields": {
                        "keyword": { "type": "keyword", "ignore_above": 256 }
                    }
                },
                "brand": {
                    "type": "keyword",
                    "fields": { "text": { "type": "text" } }
                },
                "supplier": {
                    "type": "keyword",
                    "fields": { "text": { "type": "text" } }
                },
                "category": { "type": "keyword" },
                "subcategory": { "type": "keyword" },
                "stock": { "type": "keyword" },
                "stockCode": { "type": "keyword" },
                "currency": { "type": "keyword" },
                "price": { "type": "double" },
                "quantity": { "type": "integer" },
                "minOrderQty": { "type": "integer" },
                "weight": { "type": "double" },
                "weightUnit": { "type": "keyword" },
                "volume": { "type": "double" },
                "deliveryDays": { "type": "integer" },
                "integrationId": { "type": "keyword" },
                "integrationName": { "type": "keyword" },
                "fileName": { "type": "keyword" },
                "importedAt": { "type": "date" },
                "createdAt": { "type": "date" }
            }
        }
    })
}
