use anyhow::{Context, Result};
use async_trait::async_trait;
use pei_core::error::RemoteError;
use pei_core::sync::RemoteStore;
use pei_proto::{EntityType, RemoteChange, RemoteRecord, UpsertAck};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// REST adapter for the backend:
/// `GET/PUT/DELETE {base}/rest/{table}/{id}` and `GET {base}/rest/{table}?since={cursor}`.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/rest/{}", self.base_url, entity_type.table())
    }

    fn item_url(&self, entity_type: EntityType, id: &str) -> String {
        format!("{}/{}", self.collection_url(entity_type), id)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// True when the health endpoint answers with a success status
    pub async fn is_reachable(&self) -> bool {
        match self.request(Method::GET, &self.health_url()).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

async fn send(builder: RequestBuilder) -> Result<Response, RemoteError> {
    let response = builder
        .send()
        .await
        .map_err(|e| RemoteError::Network(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound);
    }
    let message = response.text().await.unwrap_or_default();
    if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT && status != StatusCode::TOO_MANY_REQUESTS {
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    } else {
        Err(RemoteError::Network(format!("server returned {status}: {message}")))
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response
        .json::<T>()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        match send(self.request(Method::GET, &self.item_url(entity_type, id))).await {
            Ok(response) => decode(response).await.map(Some),
            Err(RemoteError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upsert(
        &self,
        entity_type: EntityType,
        payload: &Value,
    ) -> Result<UpsertAck, RemoteError> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Rejected {
                status: 400,
                message: "payload has no id".to_string(),
            })?;
        let request = self
            .request(Method::PUT, &self.item_url(entity_type, id))
            .json(payload);
        decode(send(request).await?).await
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), RemoteError> {
        send(self.request(Method::DELETE, &self.item_url(entity_type, id))).await?;
        Ok(())
    }

    async fn changes_since(
        &self,
        entity_type: EntityType,
        cursor: i64,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        let request = self
            .request(Method::GET, &self.collection_url(entity_type))
            .query(&[("since", cursor)]);
        decode(send(request).await?).await
    }
}

/// Stand-in used when no server is configured; every call fails as unreachable.
pub struct LocalOnlyRemote;

#[async_trait]
impl RemoteStore for LocalOnlyRemote {
    async fn fetch(&self, _: EntityType, _: &str) -> Result<Option<RemoteRecord>, RemoteError> {
        Err(unconfigured())
    }

    async fn upsert(&self, _: EntityType, _: &Value) -> Result<UpsertAck, RemoteError> {
        Err(unconfigured())
    }

    async fn delete(&self, _: EntityType, _: &str) -> Result<(), RemoteError> {
        Err(unconfigured())
    }

    async fn changes_since(&self, _: EntityType, _: i64) -> Result<Vec<RemoteChange>, RemoteError> {
        Err(unconfigured())
    }
}

fn unconfigured() -> RemoteError {
    RemoteError::Network("no server configured".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn remote(server: &mockito::Server) -> HttpRemote {
        HttpRemote::new(&server.url(), Some("tok".into()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_present_and_missing() {
        let mut server = mockito::Server::new_async().await;
        let found = server
            .mock("GET", "/rest/peis/p1")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"payload":{"id":"p1","status":"draft"},"updated_at":200}"#)
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/rest/peis/p2")
            .with_status(404)
            .create_async()
            .await;

        let remote = remote(&server);
        let record = remote.fetch(EntityType::Plan, "p1").await.unwrap().unwrap();
        assert_eq!(record.updated_at, 200);
        assert_eq!(record.payload["status"], "draft");
        assert_eq!(remote.fetch(EntityType::Plan, "p2").await, Ok(None));

        found.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_upsert_puts_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/rest/students/s1")
            .match_body(Matcher::Json(json!({"id": "s1", "name": "Ana"})))
            .with_status(200)
            .with_body(r#"{"updated_at":42}"#)
            .create_async()
            .await;

        let ack = remote(&server)
            .upsert(EntityType::Student, &json!({"id": "s1", "name": "Ana"}))
            .await
            .unwrap();
        assert_eq!(ack.updated_at, 42);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_codes_map_to_error_kinds() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/rest/pei_goals/g1")
            .with_status(422)
            .with_body("description is required")
            .create_async()
            .await;
        server
            .mock("PUT", "/rest/pei_goals/g2")
            .with_status(503)
            .create_async()
            .await;
        server
            .mock("DELETE", "/rest/pei_goals/g3")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("PUT", "/rest/pei_goals/g4")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let remote = remote(&server);
        let rejected = remote
            .upsert(EntityType::Goal, &json!({"id": "g1"}))
            .await
            .unwrap_err();
        assert_eq!(
            rejected,
            RemoteError::Rejected {
                status: 422,
                message: "description is required".into()
            }
        );
        let unavailable = remote
            .upsert(EntityType::Goal, &json!({"id": "g2"}))
            .await
            .unwrap_err();
        assert!(unavailable.is_transient());
        assert_eq!(
            remote.delete(EntityType::Goal, "g3").await,
            Err(RemoteError::NotFound)
        );
        assert!(matches!(
            remote.upsert(EntityType::Goal, &json!({"id": "g4"})).await,
            Err(RemoteError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_changes_since_sends_cursor() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/pei_barriers")
            .match_query(Matcher::UrlEncoded("since".into(), "17".into()))
            .with_status(200)
            .with_body(r#"[{"id":"b1","payload":{"id":"b1"},"updated_at":18},{"id":"b2","updated_at":19,"deleted":true}]"#)
            .create_async()
            .await;

        let changes = remote(&server)
            .changes_since(EntityType::Barrier, 17)
            .await
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[1].deleted);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let remote =
            HttpRemote::new("http://127.0.0.1:9", None, Duration::from_millis(500)).unwrap();
        let err = remote.fetch(EntityType::Student, "s1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(!remote.is_reachable().await);
    }

    #[tokio::test]
    async fn test_local_only_remote_is_never_reachable() {
        let err = LocalOnlyRemote
            .changes_since(EntityType::Student, 0)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
