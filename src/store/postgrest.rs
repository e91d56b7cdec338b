//! PostgREST API client using a service key

use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::StoreConfig;

use super::{StoreError, StoreResult};

/// Thin client over the PostgREST REST and RPC endpoints.
/// The service key bypasses row-level security - server only.
#[derive(Clone)]
pub struct PostgrestClient {
    client: Client,
    base_url: String,
    service_key: String,
}

impl PostgrestClient {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.url.clone(),
            service_key: config.service_key.clone(),
        }
    }

    /// Get the REST API URL for a table
    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, function)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
    }

    async fn check(response: Response) -> StoreResult<Response> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> StoreResult<T> {
        response
            .json()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))
    }

    /// Make an authenticated GET request
    pub async fn get<T: DeserializeOwned>(&self, table: &str, query: &str) -> StoreResult<Vec<T>> {
        let url = format!("{}?{}", self.rest_url(table), query);
        let response = self.authed(self.client.get(&url)).send().await?;
        Self::parse(Self::check(response).await?).await
    }

    /// Make an authenticated GET request expecting at most one row
    pub async fn get_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> StoreResult<Option<T>> {
        let rows: Vec<T> = self.get(table, &format!("{}&limit=1", query)).await?;
        Ok(rows.into_iter().next())
    }

    /// Insert a row unless its primary key already exists; returns the rows written
    pub async fn insert_ignoring_duplicates<T: Serialize, R: DeserializeOwned>(
        &self,
        table: &str,
        data: &T,
    ) -> StoreResult<Vec<R>> {
        let response = self
            .authed(self.client.post(self.rest_url(table)))
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(data)
            .send()
            .await?;
        Self::parse(Self::check(response).await?).await
    }

    /// Conditional PATCH: only rows matching `filter` change.
    /// Returns the updated rows, empty when the condition did not hold.
    pub async fn update_where<T: Serialize, R: DeserializeOwned>(
        &self,
        table: &str,
        filter: &str,
        data: &T,
    ) -> StoreResult<Vec<R>> {
        let url = format!("{}?{}", self.rest_url(table), filter);
        let response = self
            .authed(self.client.patch(&url))
            .header("Prefer", "return=representation")
            .json(data)
            .send()
            .await?;
        Self::parse(Self::check(response).await?).await
    }

    /// Call a database function; multi-row atomic writes live there
    pub async fn rpc<T: Serialize, R: DeserializeOwned>(
        &self,
        function: &str,
        args: &T,
    ) -> StoreResult<R> {
        let response = self
            .authed(self.client.post(self.rpc_url(function)))
            .json(args)
            .send()
            .await?;
        Self::parse(Self::check(response).await?).await
    }
}
