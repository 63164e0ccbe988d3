//! Typed views over groups of configuration items.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LdapConf {
    pub url: String,
    pub search_dn: String,
    #[serde(skip_serializing, default)]
    pub search_password: String,
    pub base_dn: String,
    pub filter: String,
    pub uid: String,
    pub scope: i32,
    pub timeout: i32,
    pub verify_cert: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConf {
    pub base_dn: String,
    pub filter: String,
    pub name_attribute: String,
    pub search_scope: i32,
    pub admin_dn: String,
    pub membership_attribute: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcSetting {
    pub name: String,
    pub endpoint: String,
    pub verify_cert: bool,
    pub auto_onboard: bool,
    pub client_id: String,
    #[serde(skip_serializing, default)]
    pub client_secret: String,
    pub groups_claim: String,
    pub admin_group: String,
    /// `<ext_endpoint>/c/oidc/callback`
    pub redirect_url: String,
    pub scope: Vec<String>,
    pub user_claim: String,
    pub extra_redirect_parms: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSetting {
    pub enabled: bool,
    /// Bytes; -1 is unlimited.
    pub storage_per_project: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseCfg {
    pub host: String,
    pub port: i64,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
    pub max_idle_conns: i32,
    pub max_open_conns: i32,
}

impl DatabaseCfg {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.username, self.password, self.host, self.port, self.database, self.ssl_mode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_and_secret_fields() {
        let cfg = DatabaseCfg {
            host: "db".into(),
            port: 5432,
            username: "postgres".into(),
            password: "pw".into(),
            database: "registry".into(),
            ssl_mode: "disable".into(),
            max_idle_conns: 2,
            max_open_conns: 0,
        };
        assert_eq!(cfg.url(), "postgres://postgres:pw@db:5432/registry?sslmode=disable");
        let json = serde_json::to_value(&cfg).unwrap();
        assert!(json.get("password").is_none());
    }
}
