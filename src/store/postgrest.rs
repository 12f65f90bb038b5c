//! PostgREST client for the relational persistence collaborator

use reqwest::{Client, RequestBuilder};
use serde::Serialize;

/// REST client authenticated with a service key
#[derive(Clone)]
pub struct PostgrestClient {
    client: Client,
    base_url: String,
    service_key: String,
}

impl PostgrestClient {
    pub fn new(base_url: &str, service_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        }
    }

    /// Get the REST API URL for a table
    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Get the URL of a stored procedure
    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, function)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<(), PersistenceError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(PersistenceError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PersistenceError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Insert one row without asking for it back
    pub async fn insert<T: Serialize>(&self, table: &str, row: &T) -> Result<(), PersistenceError> {
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(row);
        self.send(request).await
    }

    /// Patch rows matching a PostgREST filter
    pub async fn update<T: Serialize>(
        &self,
        table: &str,
        filter: &str,
        patch: &T,
    ) -> Result<(), PersistenceError> {
        let url = format!("{}?{}", self.table_url(table), filter);
        self.send(self.client.patch(url).json(patch)).await
    }

    /// Call a stored procedure
    pub async fn rpc<T: Serialize>(&self, function: &str, args: &T) -> Result<(), PersistenceError> {
        self.send(self.client.post(self.rpc_url(function)).json(args))
            .await
    }
}

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_built_without_double_slash() {
        let client = PostgrestClient::new("https://db.example.com/", "key");
        assert_eq!(client.table_url("matches"), "https://db.example.com/rest/v1/matches");
        assert_eq!(
            client.rpc_url("refresh_rankings"),
            "https://db.example.com/rest/v1/rpc/refresh_rankings"
        );
    }
}
