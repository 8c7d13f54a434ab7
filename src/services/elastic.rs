//! Elasticsearch mirror over its REST API.
//!
//! Documents are keyed by event id and hold the serialized event plus a `location`
//! geo point. On load, stale `active` documents are first flipped to `lost` server
//! side so a restart after downtime does not resurrect everything as fresh.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::{header, Certificate, Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::durable::DurableStore;
use crate::config::ElasticConfig;
use crate::error::PersistenceError;
use crate::models::Event;

#[derive(Debug, Clone)]
pub struct ElasticStore {
    client: Client,
    base_url: Url,
    index: String,
    username: Option<String>,
    password: Option<String>,
    api_key: Option<String>,
    bootstrap_limit: usize,
    max_retries: u32,
    stale_after: Duration,
}

const RETRY_DELAY: Duration = Duration::from_millis(250);

impl ElasticStore {
    /// Ping the cluster and make sure the index exists.
    pub async fn connect(config: &ElasticConfig, stale_after: Duration) -> Result<Self, PersistenceError> {
        let mut builder = Client::builder().timeout(config.request_timeout);
        if let Some(path) = &config.ca_certs {
            builder = builder.add_root_certificate(load_ca_bundle(path).await?);
        }
        if !config.verify_certs {
            warn!("Elasticsearch certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;
        let store = Self {
            client,
            base_url: config.url.clone(),
            index: config.index.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            api_key: config.api_key.clone(),
            bootstrap_limit: config.bootstrap_limit,
            max_retries: config.max_retries,
            stale_after,
        };

        let response = store.send(store.request(reqwest::Method::GET, "")).await?;
        ensure_success(response).await?;
        info!("Connected to Elasticsearch at {}", store.base_url);

        store.ensure_index().await?;
        Ok(store)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match (&self.api_key, &self.username) {
            (Some(key), _) => builder.header(header::AUTHORIZATION, format!("ApiKey {}", key)),
            (None, Some(user)) => builder.basic_auth(user, self.password.as_ref()),
            (None, None) => builder,
        }
    }

    /// Send with up to `max_retries` extra attempts on transport errors and gateway statuses.
    async fn send(&self, request: RequestBuilder) -> Result<Response, PersistenceError> {
        let mut attempt = 0;
        loop {
            let retry = if attempt < self.max_retries { request.try_clone() } else { None };
            let Some(next) = retry else {
                return Ok(request.send().await?);
            };
            attempt += 1;
            match next.send().await {
                Ok(response) if !is_retryable_status(response.status()) => return Ok(response),
                Ok(response) => warn!(
                    "Elasticsearch answered HTTP {} (attempt {}), retrying",
                    response.status().as_u16(),
                    attempt
                ),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!("Elasticsearch request failed (attempt {}): {}, retrying", attempt, e)
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    async fn ensure_index(&self) -> Result<(), PersistenceError> {
        let exists = self.send(self.request(reqwest::Method::HEAD, &self.index)).await?;
        if exists.status().is_success() {
            info!("Elasticsearch index available: {}", self.index);
            return Ok(());
        }
        if exists.status() != StatusCode::NOT_FOUND {
            return Err(PersistenceError::Status {
                status: exists.status().as_u16(),
                body: String::new(),
            });
        }
        let response = self
            .send(self.request(reqwest::Method::PUT, &self.index).json(&index_definition()))
            .await?;
        ensure_success(response).await?;
        info!("Elasticsearch index created: {}", self.index);
        Ok(())
    }

    async fn mark_stale_lost(&self, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        let cutoff = now
            .checked_sub_signed(crate::utils::time::to_chrono(self.stale_after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let body = json!({
            "query": {"bool": {"must": [
                {"term": {"status": "active"}},
                {"range": {"last_seen_at": {"lt": cutoff.to_rfc3339()}}}
            ]}},
            "script": {
                "source": "ctx._source.status='lost'; ctx._source.lost_at=params.lost_at;",
                "lang": "painless",
                "params": {"lost_at": now.to_rfc3339()}
            }
        });
        let path = format!("{}/_update_by_query?conflicts=proceed", self.index);
        let response = self.send(self.request(reqwest::Method::POST, &path).json(&body)).await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn search_all(&self) -> Result<Vec<Event>, PersistenceError> {
        let body = json!({
            "size": self.bootstrap_limit,
            "sort": [{"last_seen_at": {"order": "desc"}}]
        });
        let path = format!("{}/_search", self.index);
        let response = self.send(self.request(reqwest::Method::POST, &path).json(&body)).await?;
        let response = ensure_success(response).await?;
        let body: Value = response.json().await?;
        parse_hits(&body)
    }

    async fn load(&self) -> Result<Vec<Event>, PersistenceError> {
        if let Err(e) = self.mark_stale_lost(Utc::now()).await {
            warn!("Could not recompute lost events in Elasticsearch: {}", e);
        }
        self.search_all().await
    }

    async fn bulk_upsert(&self, events: &[Event]) -> Result<(), PersistenceError> {
        if events.is_empty() {
            return Ok(());
        }
        let body = bulk_body(&self.index, events)?;
        let request = self
            .request(reqwest::Method::POST, "_bulk")
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        let response = self.send(request).await?;
        let response = ensure_success(response).await?;
        let summary: Value = response.json().await?;
        let failed = count_bulk_failures(&summary);
        if failed > 0 {
            return Err(PersistenceError::PartialBulk {
                failed,
                total: events.len(),
            });
        }
        Ok(())
    }
}

impl DurableStore for ElasticStore {
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<Event>, PersistenceError>> {
        Box::pin(self.load())
    }

    fn upsert_many<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(self.bulk_upsert(events))
    }

    fn name(&self) -> &'static str {
        "elasticsearch"
    }
}

async fn load_ca_bundle(path: &Path) -> Result<Certificate, PersistenceError> {
    let certificate_error = |reason: String| PersistenceError::Certificate {
        path: path.display().to_string(),
        reason,
    };
    let pem = tokio::fs::read(path).await.map_err(|e| certificate_error(e.to_string()))?;
    Certificate::from_pem(&pem).map_err(|e| certificate_error(e.to_string()))
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, PersistenceError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(PersistenceError::Status {
        status,
        body: body.chars().take(500).collect(),
    })
}

fn index_definition() -> Value {
    json!({
        "mappings": {
            "properties": {
                "status": {"type": "keyword"},
                "source": {"type": "keyword"},
                "kind": {"type": "keyword"},
                "cause": {"type": "keyword"},
                "road": {"type": "keyword"},
                "kilometre": {"type": "keyword"},
                "province": {"type": "keyword"},
                "municipality": {"type": "keyword"},
                "latitude": {"type": "double"},
                "longitude": {"type": "double"},
                "location": {"type": "geo_point"},
                "started_at": {"type": "date"},
                "first_seen_at": {"type": "date"},
                "last_seen_at": {"type": "date"},
                "lost_at": {"type": "date"},
                "raw": {"type": "object", "enabled": false}
            }
        }
    })
}

fn document(event: &Event) -> Result<Value, PersistenceError> {
    let mut doc = serde_json::to_value(event).map_err(|e| PersistenceError::Malformed(e.to_string()))?;
    doc["location"] = json!({
        "lat": event.attributes.latitude,
        "lon": event.attributes.longitude,
    });
    Ok(doc)
}

/// NDJSON body for `_bulk`: one update action plus one partial doc per event.
fn bulk_body(index: &str, events: &[Event]) -> Result<String, PersistenceError> {
    let mut body = String::new();
    for event in events {
        let action = json!({"update": {"_index": index, "_id": event.id.as_str()}});
        let payload = json!({"doc": document(event)?, "doc_as_upsert": true});
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&payload.to_string());
        body.push('\n');
    }
    Ok(body)
}

fn count_bulk_failures(summary: &Value) -> usize {
    if !summary.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return 0;
    }
    summary
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("update").and_then(|u| u.get("error")).is_some())
                .count()
        })
        .unwrap_or(0)
}

/// Events from a `_search` response. Documents that no longer parse are skipped.
fn parse_hits(body: &Value) -> Result<Vec<Event>, PersistenceError> {
    let hits = body
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .ok_or_else(|| PersistenceError::Malformed("search response without hits".to_string()))?;

    let mut events = Vec::with_capacity(hits.len());
    for hit in hits {
        let Some(mut source) = hit.get("_source").cloned() else {
            continue;
        };
        if let (Some(id), Some(map)) = (hit.get("_id").and_then(Value::as_str), source.as_object_mut()) {
            map.insert("id".to_string(), Value::String(id.to_string()));
            map.remove("location");
        }
        match serde_json::from_value::<Event>(source) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Skipping unreadable Elasticsearch document {:?}: {}", hit.get("_id"), e),
        }
    }
    Ok(events)
}
