use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::Driver;
use crate::config::value::raw_string;
use crate::config::ConfigError;

pub const INTERNAL_CONFIG_PATH: &str = "/api/internal/configurations";

#[derive(Deserialize)]
struct Entry {
    value: Value,
}

/// Talks to the peer that owns the configuration, authenticating with the
/// shared `Harbor-Secret`.
pub struct RestDriver {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl RestDriver {
    pub fn new(core_url: &str, secret: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}{}", core_url.trim_end_matches('/'), INTERNAL_CONFIG_PATH),
            secret,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => req.header(reqwest::header::AUTHORIZATION, format!("Harbor-Secret {secret}")),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ConfigError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(ConfigError::Peer { status, body })
    }
}

#[async_trait]
impl Driver for RestDriver {
    async fn load(&self) -> Result<HashMap<String, String>, ConfigError> {
        let resp = self.authorize(self.client.get(&self.url)).send().await?;
        let doc: HashMap<String, Entry> = Self::check(resp).await?.json().await?;
        Ok(doc
            .into_iter()
            .map(|(name, entry)| (name, raw_string(&entry.value)))
            .collect())
    }

    async fn save(&self, cfg: HashMap<String, String>) -> Result<(), ConfigError> {
        let resp = self.authorize(self.client.put(&self.url)).json(&cfg).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}
