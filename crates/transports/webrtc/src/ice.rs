//! Connectivity configuration fetch
//!
//! The STUN/TURN server list comes from an HTTP endpoint so credentials
//! can rotate without redeploying viewers. The fetch retries with capped
//! exponential backoff; running out of attempts fails the session before
//! any offer is sent.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use scopelink_core::config::IceConfig;
use scopelink_core::{Error, Result};

/// Source of the ICE server list for new peer connections.
#[async_trait]
pub trait IceProvider: Send + Sync {
    async fn servers(&self) -> Result<Vec<RTCIceServer>>;
}

/// Wire shape of the config endpoint response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceServerList {
    #[serde(default)]
    ice_servers: Vec<IceServerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceServerEntry {
    #[serde(deserialize_with = "one_or_many")]
    urls: Vec<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

/// Browser peers send `urls` as either a string or an array.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Fetches the ICE server list with retry.
pub struct IceConfigFetcher {
    client: reqwest::Client,
    config: IceConfig,
}

impl IceConfigFetcher {
    pub fn new(config: IceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Fetch the server list, retrying per the configured backoff.
    ///
    /// Exhausting the attempts returns [`Error::ConfigUnavailable`], which
    /// the session surfaces as a terminal negotiation failure.
    pub async fn fetch(&self) -> Result<Vec<RTCIceServer>> {
        let mut delay = Duration::from_millis(self.config.initial_backoff_ms);
        let max_delay = Duration::from_millis(self.config.max_backoff_ms);
        let mut last_error = String::new();

        for attempt in 1..=self.config.fetch_attempts {
            match self.fetch_once().await {
                Ok(servers) => {
                    info!(
                        attempt,
                        servers = servers.len(),
                        "fetched connectivity configuration"
                    );
                    return Ok(servers);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.config.fetch_attempts,
                        error = %e,
                        "connectivity config fetch failed"
                    );
                    last_error = e.to_string();
                    if attempt < self.config.fetch_attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(max_delay);
                    }
                }
            }
        }

        Err(Error::ConfigUnavailable(format!(
            "gave up after {} attempts: {last_error}",
            self.config.fetch_attempts
        )))
    }

    async fn fetch_once(&self) -> Result<Vec<RTCIceServer>> {
        let response = self
            .client
            .get(&self.config.config_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::ConfigUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::ConfigUnavailable(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let list: IceServerList = response
            .json()
            .await
            .map_err(|e| Error::ConfigUnavailable(format!("response body: {e}")))?;

        Ok(to_rtc_servers(list))
    }
}

#[async_trait]
impl IceProvider for IceConfigFetcher {
    async fn servers(&self) -> Result<Vec<RTCIceServer>> {
        self.fetch().await
    }
}

fn to_rtc_servers(list: IceServerList) -> Vec<RTCIceServer> {
    list.ice_servers
        .into_iter()
        .map(|entry| RTCIceServer {
            urls: entry.urls,
            username: entry.username.unwrap_or_default(),
            credential: entry.credential.unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        let body = r#"{
            "iceServers": [
                {"urls": "stun:stun.example.net:3478"},
                {
                    "urls": ["turn:turn.example.net:3478?transport=udp"],
                    "username": "scope",
                    "credential": "secret"
                }
            ]
        }"#;
        let list: IceServerList = serde_json::from_str(body).unwrap();
        let servers = to_rtc_servers(list);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.net:3478"]);
        assert_eq!(servers[0].username, "");
        assert_eq!(servers[1].username, "scope");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_parse_empty_response() {
        let list: IceServerList = serde_json::from_str("{}").unwrap();
        assert!(to_rtc_servers(list).is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_urls_type() {
        let body = r#"{"iceServers": [{"urls": 42}]}"#;
        assert!(serde_json::from_str::<IceServerList>(body).is_err());
    }
}
