//! HTTP backend speaking the PostgREST dialect
//!
//! Rows live under `/rest/v1/{table}` and are filtered by
//! `owner_scope=eq.{scope}`. Writes ask for `return=representation` so the
//! stored row comes back in the response. The ledger delta goes through the
//! `apply_points_delta` RPC so concurrent deltas are summed server side.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::RemoteBackend;
use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};
use crate::model::{Collection, Entity, EntityId, HistoryEntry, LedgerDelta, PointsLedger, Scope};

/// [`RemoteBackend`] over HTTP
pub struct HttpBackend {
    base_url: String,
    client: Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, config: &RemoteConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref api_key) = config.api_key {
            let bearer = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| SyncError::Config(format!("invalid API key: {}", e)))?;
            let key = header::HeaderValue::from_str(api_key)
                .map_err(|e| SyncError::Config(format!("invalid API key: {}", e)))?;
            headers.insert(header::AUTHORIZATION, bearer);
            headers.insert("apikey", key);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    // ==================== Rows ====================

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let response = self
            .client
            .get(self.table_url(table))
            .query(filters)
            .query(&[("order", "created_at.asc")])
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn write_returning(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<serde_json::Value>> {
        let response = request
            .header("Prefer", "return=representation")
            .send()
            .await?;
        self.handle_response(response).await
    }

    fn first_entity(collection: Collection, rows: Vec<serde_json::Value>) -> Result<Entity> {
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Validation("server returned no row".into()))?;
        Entity::from_record(collection, row)
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound("Resource not found".to_string()));
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Validation(format!("{}: {}", status.as_u16(), body)));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Network(format!("{}: {}", status.as_u16(), body)));
        }

        let body = response.json().await?;
        Ok(body)
    }
}

fn scope_filter(scope: &Scope) -> (&'static str, String) {
    ("owner_scope", format!("eq.{}", scope))
}

fn id_filter(id: &EntityId) -> (&'static str, String) {
    ("id", format!("eq.{}", id))
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn fetch_collection(&self, collection: Collection, scope: &Scope) -> Result<Vec<Entity>> {
        let rows: Vec<serde_json::Value> =
            self.select(collection.as_str(), &[scope_filter(scope)]).await?;
        rows.into_iter()
            .map(|row| Entity::from_record(collection, row))
            .collect()
    }

    async fn fetch_entity(
        &self,
        collection: Collection,
        scope: &Scope,
        id: &EntityId,
    ) -> Result<Option<Entity>> {
        let rows: Vec<serde_json::Value> = self
            .select(collection.as_str(), &[scope_filter(scope), id_filter(id)])
            .await?;
        rows.into_iter()
            .next()
            .map(|row| Entity::from_record(collection, row))
            .transpose()
    }

    async fn fetch_ledger(&self, scope: &Scope) -> Result<PointsLedger> {
        let rows: Vec<PointsLedger> = self
            .select(Collection::Points.as_str(), &[scope_filter(scope)])
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .unwrap_or_else(|| PointsLedger::empty(scope.clone())))
    }

    async fn fetch_history(&self, scope: &Scope) -> Result<Vec<HistoryEntry>> {
        let response = self
            .client
            .get(self.table_url(Collection::History.as_str()))
            .query(&[scope_filter(scope)])
            .query(&[("order", "occurred_at.asc")])
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn insert(&self, entity: &Entity) -> Result<Entity> {
        let mut record = entity.to_record()?;
        // the server assigns the id
        if let Some(fields) = record.as_object_mut() {
            fields.remove("id");
        }

        let collection = entity.collection();
        debug!(%collection, "POST row");
        let rows = self
            .write_returning(self.client.post(self.table_url(collection.as_str())).json(&record))
            .await?;
        Self::first_entity(collection, rows)
    }

    async fn update(&self, entity: &Entity) -> Result<Entity> {
        let collection = entity.collection();
        debug!(%collection, id = %entity.id(), "PATCH row");
        let rows = self
            .write_returning(
                self.client
                    .patch(self.table_url(collection.as_str()))
                    .query(&[id_filter(entity.id())])
                    .json(&entity.to_record()?),
            )
            .await?;
        Self::first_entity(collection, rows)
    }

    async fn delete(&self, collection: Collection, scope: &Scope, id: &EntityId) -> Result<()> {
        debug!(%collection, %id, "DELETE row");
        let response = self
            .client
            .delete(self.table_url(collection.as_str()))
            .query(&[scope_filter(scope), id_filter(id)])
            .send()
            .await?;
        if !response.status().is_success() {
            let _: serde_json::Value = self.handle_response(response).await?;
        }
        Ok(())
    }

    async fn batch_update(&self, entities: &[Entity]) -> Result<()> {
        let Some(first) = entities.first() else {
            return Ok(());
        };
        let collection = first.collection();
        let records = entities
            .iter()
            .map(Entity::to_record)
            .collect::<Result<Vec<_>>>()?;

        debug!(%collection, rows = records.len(), "Batch upsert");
        let response = self
            .client
            .post(self.table_url(collection.as_str()))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&records)
            .send()
            .await?;
        if !response.status().is_success() {
            let _: serde_json::Value = self.handle_response(response).await?;
        }
        Ok(())
    }

    async fn apply_ledger_delta(&self, scope: &Scope, delta: LedgerDelta) -> Result<PointsLedger> {
        let body = serde_json::json!({
            "scope": scope,
            "points": delta.points,
            "partner_points": delta.partner_points,
        });
        let response = self
            .client
            .post(format!("{}/rest/v1/rpc/apply_points_delta", self.base_url))
            .json(&body)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn insert_history(&self, entry: &HistoryEntry) -> Result<HistoryEntry> {
        let mut record = serde_json::to_value(entry)?;
        if let Some(fields) = record.as_object_mut() {
            fields.remove("id");
        }
        let rows = self
            .write_returning(
                self.client
                    .post(self.table_url(Collection::History.as_str()))
                    .json(&record),
            )
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Validation("server returned no row".into()))?;
        Ok(serde_json::from_value(row)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let backend = HttpBackend::new("https://example.test/", &RemoteConfig::default()).unwrap();
        assert_eq!(backend.table_url("tasks"), "https://example.test/rest/v1/tasks");
    }

    #[test]
    fn test_invalid_api_key_is_a_config_error() {
        let config = RemoteConfig {
            api_key: Some("bad\nkey".into()),
            ..Default::default()
        };
        assert!(matches!(
            HttpBackend::new("https://example.test", &config),
            Err(SyncError::Config(_))
        ));
    }
}
