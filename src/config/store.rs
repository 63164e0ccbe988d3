//! The configuration store: an in-memory view over a [`Driver`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::items;
use super::metadata::{ItemType, Registry, Scope};
use super::models::{DatabaseCfg, GroupConf, LdapConf, OidcSetting, QuotaSetting};
use super::rules::{default_rules, Rule};
use super::value::{raw_string, ConfigValue};
use super::{ConfigError, Driver, PasswordCipher};

pub struct ConfigStore {
    registry: Arc<Registry>,
    values: DashMap<String, ConfigValue>,
    driver: Arc<dyn Driver>,
    cipher: PasswordCipher,
    rules: Vec<Box<dyn Rule>>,
    save_system_items: bool,
}

impl ConfigStore {
    /// A store holding every item's default value.
    pub fn new(registry: Arc<Registry>, driver: Arc<dyn Driver>, cipher: PasswordCipher) -> Self {
        let values = registry
            .items()
            .map(|item| {
                (
                    item.name.to_string(),
                    ConfigValue::unchecked(&registry, item.name, item.default_value),
                )
            })
            .collect();
        Self {
            registry,
            values,
            driver,
            cipher,
            rules: default_rules(),
            save_system_items: std::env::var("UTTEST").map(|v| v == "true").unwrap_or(false),
        }
    }

    pub fn with_rules(mut self, rules: Vec<Box<dyn Rule>>) -> Self {
        self.rules = rules;
        self
    }

    /// Also persist system-scope items on save.
    pub fn with_system_save(mut self, enabled: bool) -> Self {
        self.save_system_items = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Apply every item's environment binding from the process environment.
    pub fn load_env(&self) {
        self.load_env_with(|key| std::env::var(key).ok());
    }

    pub fn load_env_with(&self, lookup: impl Fn(&str) -> Option<String>) {
        let mut applied = 0;
        for item in self.registry.items() {
            let Some(env_key) = item.env_key else { continue };
            let Some(raw) = lookup(env_key) else { continue };
            match ConfigValue::new(&self.registry, item.name, &raw) {
                Ok(value) => {
                    self.values.insert(item.name.to_string(), value);
                    applied += 1;
                }
                Err(e) => warn!("ignoring {}: {}", env_key, e),
            }
        }
        debug!("applied {} configuration values from the environment", applied);
    }

    pub fn get(&self, name: &str) -> Result<ConfigValue, ConfigError> {
        if self.registry.get(name).is_none() {
            return Err(ConfigError::UnknownItem(name.to_string()));
        }
        self.values
            .get(name)
            .map(|v| v.clone())
            .ok_or_else(|| ConfigError::UnknownItem(name.to_string()))
    }

    /// Validate and keep in memory only.
    pub fn set(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        let value = ConfigValue::new(&self.registry, name, value)?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Pull values from the driver. Unknown names and invalid values are
    /// skipped; passwords are decrypted.
    pub async fn load(&self) -> Result<(), ConfigError> {
        let stored = self.driver.load().await?;
        let mut loaded = 0;
        for (name, raw) in stored {
            let Some(item) = self.registry.get(&name) else {
                warn!("skipping unknown configuration item {}", name);
                continue;
            };
            let raw = if item.item_type == ItemType::Password {
                match self.cipher.decrypt(&raw) {
                    Ok(plain) => plain,
                    Err(e) => {
                        warn!("skipping {}: {}", name, e);
                        continue;
                    }
                }
            } else {
                raw
            };
            match ConfigValue::new(&self.registry, &name, &raw) {
                Ok(value) => {
                    self.values.insert(name, value);
                    loaded += 1;
                }
                Err(e) => warn!("skipping stored value: {}", e),
            }
        }
        debug!("loaded {} configuration values", loaded);
        Ok(())
    }

    /// Persist every known item. System-scope items are left out unless
    /// system saving is enabled.
    pub async fn save(&self) -> Result<(), ConfigError> {
        let cfg: HashMap<String, String> = self
            .values
            .iter()
            .filter(|entry| {
                self.registry
                    .get(entry.key())
                    .is_some_and(|item| item.scope == Scope::User || self.save_system_items)
            })
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect();
        let count = cfg.len();
        self.driver.save(cfg).await?;
        info!("saved {} configuration values", count);
        Ok(())
    }

    /// Validate `changes`, run the cross-field rules, persist and apply.
    /// Nothing is applied if any step fails.
    pub async fn update(&self, changes: HashMap<String, Value>) -> Result<(), ConfigError> {
        let mut validated = Vec::with_capacity(changes.len());
        for (name, value) in &changes {
            let item = self
                .registry
                .get(name)
                .ok_or_else(|| ConfigError::UnknownItem(name.clone()))?;
            if item.scope == Scope::System || !item.editable {
                return Err(ConfigError::NotEditable(name.clone()));
            }
            validated.push(ConfigValue::new(&self.registry, name, &raw_string(value))?);
        }

        let mut merged: HashMap<String, String> = self
            .values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect();
        for value in &validated {
            merged.insert(value.name.clone(), value.value.clone());
        }
        for rule in &self.rules {
            rule.check(&merged).map_err(|reason| ConfigError::Rule {
                rule: rule.name(),
                reason,
            })?;
        }

        let subset = validated
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect();
        self.driver.save(subset).await?;
        let names: Vec<&str> = validated.iter().map(|v| v.name.as_str()).collect();
        info!("updated configuration: {}", names.join(", "));
        for value in validated {
            self.values.insert(value.name.clone(), value);
        }
        Ok(())
    }

    fn entries(&self, include: impl Fn(&super::Item) -> bool) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .filter_map(|entry| {
                let item = self.registry.get(entry.key())?;
                include(item).then(|| {
                    (
                        entry.key().clone(),
                        json!({ "value": entry.value().typed(), "editable": item.editable }),
                    )
                })
            })
            .collect()
    }

    /// User-scope items as `{name: {value, editable}}`. Passwords are never included.
    pub fn user_json(&self) -> BTreeMap<String, Value> {
        self.entries(|item| item.scope == Scope::User && item.item_type != ItemType::Password)
    }

    /// Every item, for privileged internal callers.
    pub fn all_json(&self, include_passwords: bool) -> BTreeMap<String, Value> {
        self.entries(|item| include_passwords || item.item_type != ItemType::Password)
    }

    fn string(&self, name: &str) -> String {
        self.get(name).map(|v| v.get_string()).unwrap_or_default()
    }

    fn int(&self, name: &str) -> i32 {
        self.get(name).map(|v| v.get_int()).unwrap_or_default()
    }

    fn boolean(&self, name: &str) -> bool {
        self.get(name).map(|v| v.get_bool()).unwrap_or_default()
    }

    pub fn auth_mode(&self) -> String {
        self.string(items::AUTH_MODE)
    }

    pub fn ldap_conf(&self) -> LdapConf {
        LdapConf {
            url: self.string(items::LDAP_URL),
            search_dn: self.string(items::LDAP_SEARCH_DN),
            search_password: self.string(items::LDAP_SEARCH_PASSWORD),
            base_dn: self.string(items::LDAP_BASE_DN),
            filter: self.string(items::LDAP_FILTER),
            uid: self.string(items::LDAP_UID),
            scope: self.int(items::LDAP_SCOPE),
            timeout: self.int(items::LDAP_TIMEOUT),
            verify_cert: self.boolean(items::LDAP_VERIFY_CERT),
        }
    }

    pub fn ldap_group_conf(&self) -> GroupConf {
        GroupConf {
            base_dn: self.string(items::LDAP_GROUP_BASE_DN),
            filter: self.string(items::LDAP_GROUP_SEARCH_FILTER),
            name_attribute: self.string(items::LDAP_GROUP_ATTRIBUTE_NAME),
            search_scope: self.int(items::LDAP_GROUP_SEARCH_SCOPE),
            admin_dn: self.string(items::LDAP_GROUP_ADMIN_DN),
            membership_attribute: self.string(items::LDAP_GROUP_MEMBERSHIP_ATTRIBUTE),
        }
    }

    pub fn oidc_setting(&self) -> OidcSetting {
        let scope = self
            .string(items::OIDC_SCOPE)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        OidcSetting {
            name: self.string(items::OIDC_NAME),
            endpoint: self.string(items::OIDC_ENDPOINT),
            verify_cert: self.boolean(items::OIDC_VERIFY_CERT),
            auto_onboard: self.boolean(items::OIDC_AUTO_ONBOARD),
            client_id: self.string(items::OIDC_CLIENT_ID),
            client_secret: self.string(items::OIDC_CLIENT_SECRET),
            groups_claim: self.string(items::OIDC_GROUPS_CLAIM),
            admin_group: self.string(items::OIDC_ADMIN_GROUP),
            redirect_url: format!(
                "{}/c/oidc/callback",
                self.string(items::EXT_ENDPOINT).trim_end_matches('/')
            ),
            scope,
            user_claim: self.string(items::OIDC_USER_CLAIM),
            extra_redirect_parms: self
                .get(items::OIDC_EXTRA_REDIRECT_PARMS)
                .map(|v| v.get_string_to_string_map())
                .unwrap_or_default(),
        }
    }

    pub fn quota_setting(&self) -> QuotaSetting {
        QuotaSetting {
            enabled: self.boolean(items::QUOTA_PER_PROJECT_ENABLE),
            storage_per_project: self
                .get(items::STORAGE_PER_PROJECT)
                .map(|v| v.get_int64())
                .unwrap_or(-1),
        }
    }

    pub fn database_cfg(&self) -> DatabaseCfg {
        DatabaseCfg {
            host: self.string(items::POSTGRESQL_HOST),
            port: self.get(items::POSTGRESQL_PORT).map(|v| v.get_int64()).unwrap_or(5432),
            username: self.string(items::POSTGRESQL_USERNAME),
            password: self.string(items::POSTGRESQL_PASSWORD),
            database: self.string(items::POSTGRESQL_DATABASE),
            ssl_mode: self.string(items::POSTGRESQL_SSLMODE),
            max_idle_conns: self.int(items::POSTGRESQL_MAX_IDLE_CONNS),
            max_open_conns: self.int(items::POSTGRESQL_MAX_OPEN_CONNS),
        }
    }

    pub fn read_only(&self) -> bool {
        self.boolean(items::READ_ONLY)
    }

    pub fn cache_ttl(&self) -> std::time::Duration {
        self.get(items::CONFIG_CACHE_TTL)
            .map(|v| v.get_duration())
            .unwrap_or(super::driver::DEFAULT_CACHE_TTL)
    }

    pub fn refresh_interval(&self) -> std::time::Duration {
        self.get(items::CONFIG_REFRESH_INTERVAL)
            .map(|v| v.get_duration())
            .unwrap_or(std::time::Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryDriver, StaticKeyProvider};

    const KEY: &[u8] = b"0123456789abcdef";

    fn cipher() -> PasswordCipher {
        PasswordCipher::new(Arc::new(StaticKeyProvider(KEY.to_vec())))
    }

    fn store() -> (ConfigStore, Arc<MemoryDriver>) {
        let registry = Registry::global();
        let driver = Arc::new(MemoryDriver::with_encryption(registry.clone(), cipher()));
        let store = ConfigStore::new(registry, driver.clone(), cipher()).with_system_save(false);
        (store, driver)
    }

    #[test]
    fn defaults_then_environment() {
        let (store, _) = store();
        assert_eq!(store.auth_mode(), "db_auth");
        store.load_env_with(|key| match key {
            "AUTH_MODE" => Some("ldap_auth".into()),
            "EMAIL_PORT" => Some("not-a-port".into()),
            "POSTGRESQL_HOST" => Some("db.internal".into()),
            _ => None,
        });
        assert_eq!(store.auth_mode(), "ldap_auth");
        // invalid environment values keep the default
        assert_eq!(store.get(items::EMAIL_PORT).unwrap().get_int(), 25);
        assert_eq!(store.database_cfg().host, "db.internal");
    }

    #[test]
    fn set_validates() {
        let (store, _) = store();
        assert!(store.set(items::LDAP_SCOPE, "1").is_ok());
        assert_eq!(store.ldap_conf().scope, 1);
        assert!(matches!(
            store.set(items::LDAP_SCOPE, "5"),
            Err(ConfigError::Validation { .. })
        ));
        assert!(matches!(store.get("nope"), Err(ConfigError::UnknownItem(_))));
    }

    #[tokio::test]
    async fn password_round_trip() {
        let (store, driver) = store();
        store
            .update(HashMap::from([(items::EMAIL_PASSWORD.to_string(), json!("hunter2"))]))
            .await
            .unwrap();

        let raw = driver.raw(items::EMAIL_PASSWORD).await.unwrap();
        assert!(raw.starts_with(crate::config::encrypt::ENCRYPTED_PREFIX));

        let registry = Registry::global();
        let fresh = ConfigStore::new(registry, driver.clone(), cipher());
        fresh.load().await.unwrap();
        assert_eq!(fresh.get(items::EMAIL_PASSWORD).unwrap().get_password(), "hunter2");
        assert!(!fresh.user_json().contains_key(items::EMAIL_PASSWORD));
        assert!(fresh.all_json(true).contains_key(items::EMAIL_PASSWORD));
    }

    #[tokio::test]
    async fn update_is_all_or_nothing() {
        let (store, driver) = store();
        let err = store
            .update(HashMap::from([
                (items::EMAIL_HOST.to_string(), json!("smtp.example.com")),
                (items::EMAIL_PORT.to_string(), json!(70000)),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        assert_eq!(store.get(items::EMAIL_HOST).unwrap().get_string(), "smtp.mydomain.com");
        assert!(driver.raw(items::EMAIL_HOST).await.is_none());

        assert!(matches!(
            store
                .update(HashMap::from([(items::POSTGRESQL_HOST.to_string(), json!("x"))]))
                .await,
            Err(ConfigError::NotEditable(_))
        ));
    }

    #[tokio::test]
    async fn rules_run_against_the_merged_view() {
        let (store, _) = store();
        let err = store
            .update(HashMap::from([(items::LDAP_GROUP_BASE_DN.to_string(), json!("ou=groups"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Rule { rule: "ldap_group", .. }));

        store
            .update(HashMap::from([(items::LDAP_GROUP_ATTRIBUTE_NAME.to_string(), json!("cn"))]))
            .await
            .unwrap_err();
        store
            .update(HashMap::from([
                (items::LDAP_GROUP_BASE_DN.to_string(), json!("ou=groups")),
                (items::LDAP_GROUP_ATTRIBUTE_NAME.to_string(), json!("cn")),
            ]))
            .await
            .unwrap();
        assert_eq!(store.ldap_group_conf().name_attribute, "cn");
    }

    #[tokio::test]
    async fn save_skips_system_items_and_load_skips_unknown() {
        let (store, driver) = store();
        store.set(items::EMAIL_FROM, "ops@example.com").unwrap();
        store.save().await.unwrap();
        assert_eq!(driver.raw(items::EMAIL_FROM).await.as_deref(), Some("ops@example.com"));
        assert!(driver.raw(items::POSTGRESQL_HOST).await.is_none());

        driver
            .save(HashMap::from([
                ("retired_item".to_string(), "x".to_string()),
                (items::TOKEN_EXPIRATION.to_string(), "45".to_string()),
            ]))
            .await
            .unwrap();
        store.load().await.unwrap();
        assert_eq!(store.get(items::TOKEN_EXPIRATION).unwrap().get_int(), 45);
    }

    #[test]
    fn typed_snapshots() {
        let (store, _) = store();
        store.set(items::OIDC_SCOPE, "openid, profile,").unwrap();
        store.set(items::EXT_ENDPOINT, "https://registry.example.com/").unwrap();
        let oidc = store.oidc_setting();
        assert_eq!(oidc.scope, vec!["openid", "profile"]);
        assert_eq!(oidc.redirect_url, "https://registry.example.com/c/oidc/callback");
        assert_eq!(store.quota_setting().storage_per_project, -1);
        assert_eq!(store.cache_ttl(), std::time::Duration::from_secs(60));
        assert!(store.user_json()[items::AUTH_MODE]["editable"].as_bool().unwrap());
    }
}
