//! Backend inventory and credential encoding
//!
//! The inventory service answers a GET with `{"results": [...]}`, one entry
//! per upstream proxy. Ids and ports are accepted as JSON numbers or strings.

use crate::backend::{BackendRecord, BackendSet};
use crate::error::InventoryError;
use base64::Engine;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::{debug, info};

/// Encode `username:password` the way it is embedded in the load balancer config
pub fn encode_credential(username: &str, password: &str) -> Result<String, InventoryError> {
    if username.contains(':') {
        return Err(InventoryError::Encoding(
            "username must not contain ':'".to_string(),
        ));
    }
    if username.chars().chain(password.chars()).any(char::is_control) {
        return Err(InventoryError::Encoding(
            "credentials must not contain control characters".to_string(),
        ));
    }
    let plain = format!("{}:{}", username, password);
    Ok(base64::engine::general_purpose::STANDARD.encode(plain))
}

/// One entry of the inventory response
#[derive(Debug, Clone, Deserialize)]
pub struct BackendDescriptor {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub address: String,
    #[serde(deserialize_with = "port_from_any")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InventoryResponse {
    results: Vec<BackendDescriptor>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn port_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = string_or_number(deserializer)?;
    raw.trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid port '{}'", raw)))
}

/// Parse an inventory response body
pub fn parse_inventory(body: &str) -> Result<Vec<BackendDescriptor>, InventoryError> {
    let response: InventoryResponse =
        serde_json::from_str(body).map_err(|e| InventoryError::Fetch(e.to_string()))?;
    Ok(response.results)
}

/// Turn descriptors into records, falling back to the fleet-wide credentials
/// for entries that carry none
pub fn into_records(
    descriptors: Vec<BackendDescriptor>,
    default_username: Option<&str>,
    default_password: Option<&str>,
) -> Result<BackendSet, InventoryError> {
    let mut set = BackendSet::new();

    for descriptor in descriptors {
        if descriptor.id.is_empty() {
            return Err(InventoryError::Fetch("backend with empty id".to_string()));
        }

        // Credentials are taken as a pair, either the entry's own or the fleet-wide one
        let credentials = match descriptor.username.as_deref().filter(|u| !u.is_empty()) {
            Some(username) => Some((username, descriptor.password.as_deref().unwrap_or(""))),
            None => default_username
                .filter(|u| !u.is_empty())
                .map(|username| (username, default_password.unwrap_or(""))),
        };

        let mut record =
            BackendRecord::new(descriptor.id, descriptor.address, descriptor.port);
        if let Some((username, password)) = credentials {
            record = record.with_credentials(username, password)?;
        }

        let id = record.id.clone();
        if !set.push(record) {
            return Err(InventoryError::Fetch(format!("duplicate backend id '{}'", id)));
        }
    }

    Ok(set)
}

/// Fetches the backend list from the inventory service
pub struct InventoryClient {
    url: String,
    http_client: reqwest::Client,
}

impl InventoryClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, InventoryError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }

    pub async fn fetch(&self) -> Result<Vec<BackendDescriptor>, InventoryError> {
        debug!(url = %self.url, "Fetching backend inventory");

        let response = self.http_client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(InventoryError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let descriptors = parse_inventory(&body)?;
        info!(url = %self.url, count = descriptors.len(), "Backend inventory loaded");
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn fake_inventory(status_line: &'static str, body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    #[test]
    fn test_encode_credential() {
        assert_eq!(encode_credential("user", "pass").unwrap(), "dXNlcjpwYXNz");
        assert_eq!(encode_credential("", "").unwrap(), "Og==");
    }

    #[test]
    fn test_encode_credential_rejects_colon_in_username() {
        let err = encode_credential("us:er", "pass").unwrap_err();
        assert!(matches!(err, InventoryError::Encoding(_)));
        // Colons are fine in the password
        assert!(encode_credential("user", "pa:ss").is_ok());
    }

    #[test]
    fn test_encode_credential_rejects_control_characters() {
        assert!(encode_credential("user\n", "pass").is_err());
        assert!(encode_credential("user", "pa\rss").is_err());
    }

    #[test]
    fn test_parse_inventory_mixed_types() {
        let body = r#"{"results": [
            {"id": 1, "address": "10.0.0.1", "port": 8080, "username": "a", "password": "b"},
            {"id": "two", "address": "10.0.0.2", "port": "3128"}
        ]}"#;
        let descriptors = parse_inventory(body).unwrap();

        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].id, "1");
        assert_eq!(descriptors[0].port, 8080);
        assert_eq!(descriptors[0].username.as_deref(), Some("a"));
        assert_eq!(descriptors[1].id, "two");
        assert_eq!(descriptors[1].port, 3128);
        assert!(descriptors[1].username.is_none());
    }

    #[test]
    fn test_parse_inventory_errors() {
        assert!(matches!(
            parse_inventory("not json"),
            Err(InventoryError::Fetch(_))
        ));
        assert!(matches!(
            parse_inventory(r#"{"items": []}"#),
            Err(InventoryError::Fetch(_))
        ));
        assert!(matches!(
            parse_inventory(r#"{"results": [{"id": 1, "address": "x", "port": 70000}]}"#),
            Err(InventoryError::Fetch(_))
        ));
        assert!(matches!(
            parse_inventory(r#"{"results": [{"id": true, "address": "x", "port": 80}]}"#),
            Err(InventoryError::Fetch(_))
        ));
    }

    #[test]
    fn test_into_records_uses_fleet_credentials_as_fallback() {
        let descriptors = parse_inventory(
            r#"{"results": [
                {"id": 1, "address": "10.0.0.1", "port": 8080, "username": "own", "password": "pw"},
                {"id": 2, "address": "10.0.0.2", "port": 8080}
            ]}"#,
        )
        .unwrap();

        let set = into_records(descriptors, Some("fleet"), Some("secret")).unwrap();
        let records = set.as_slice();

        assert_eq!(records[0].username, "own");
        assert_eq!(records[0].encoded_credential, encode_credential("own", "pw").unwrap());
        assert_eq!(records[1].username, "fleet");
        assert_eq!(
            records[1].encoded_credential,
            encode_credential("fleet", "secret").unwrap()
        );
    }

    #[test]
    fn test_into_records_keeps_fleet_password_off_own_username() {
        let descriptors = parse_inventory(
            r#"{"results": [
                {"id": 1, "address": "10.0.0.1", "port": 8080, "username": "own"},
                {"id": 2, "address": "10.0.0.2", "port": 8080, "password": "stray"}
            ]}"#,
        )
        .unwrap();

        let set = into_records(descriptors, Some("fleet"), Some("secret")).unwrap();
        let records = set.as_slice();

        assert_eq!(records[0].username, "own");
        assert_eq!(records[0].password, "");
        assert_eq!(records[0].encoded_credential, encode_credential("own", "").unwrap());
        // Without its own username the entry takes the fleet pair as a whole
        assert_eq!(records[1].username, "fleet");
        assert_eq!(records[1].password, "secret");
    }

    #[test]
    fn test_into_records_without_any_credentials() {
        let descriptors =
            parse_inventory(r#"{"results": [{"id": 1, "address": "10.0.0.1", "port": 80}]}"#)
                .unwrap();
        let set = into_records(descriptors, None, None).unwrap();
        assert!(!set.as_slice()[0].has_credentials());
        assert!(set.as_slice()[0].encoded_credential.is_empty());
    }

    #[test]
    fn test_into_records_rejects_duplicates() {
        let descriptors = parse_inventory(
            r#"{"results": [
                {"id": 1, "address": "10.0.0.1", "port": 80},
                {"id": "1", "address": "10.0.0.2", "port": 80}
            ]}"#,
        )
        .unwrap();
        let err = into_records(descriptors, None, None).unwrap_err();
        assert!(err.to_string().contains("duplicate backend id '1'"));
    }

    #[test]
    fn test_into_records_propagates_encoding_errors() {
        let descriptors =
            parse_inventory(r#"{"results": [{"id": 1, "address": "10.0.0.1", "port": 80}]}"#)
                .unwrap();
        let err = into_records(descriptors, Some("bad:name"), Some("pw")).unwrap_err();
        assert!(matches!(err, InventoryError::Encoding(_)));
    }

    #[tokio::test]
    async fn test_fetch_from_inventory_service() {
        let addr = fake_inventory(
            "HTTP/1.1 200 OK",
            r#"{"results": [{"id": 1, "address": "10.0.0.1", "port": 8080}]}"#,
        )
        .await;
        let client =
            InventoryClient::new(format!("http://{}/proxies", addr), Duration::from_secs(5))
                .unwrap();

        let descriptors = client.fetch().await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].address, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        let addr = fake_inventory("HTTP/1.1 500 Internal Server Error", "{}").await;
        let client =
            InventoryClient::new(format!("http://{}/proxies", addr), Duration::from_secs(5))
                .unwrap();

        assert!(matches!(
            client.fetch().await,
            Err(InventoryError::Status(500))
        ));
    }

    #[tokio::test]
    async fn test_fetch_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            InventoryClient::new(format!("http://{}/proxies", addr), Duration::from_secs(5))
                .unwrap();
        assert!(matches!(client.fetch().await, Err(InventoryError::Http(_))));
    }
}
