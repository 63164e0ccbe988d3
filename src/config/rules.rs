//! Cross-field checks run on every update, in registration order.

use std::collections::HashMap;

use super::items;

/// A check over the configuration as it would look after an update.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, cfg: &HashMap<String, String>) -> Result<(), String>;
}

fn non_empty(cfg: &HashMap<String, String>, key: &str) -> bool {
    cfg.get(key).is_some_and(|v| !v.trim().is_empty())
}

/// Group search needs both a base DN and the attribute naming a group.
pub struct LdapGroupRule;

impl Rule for LdapGroupRule {
    fn name(&self) -> &'static str {
        "ldap_group"
    }

    fn check(&self, cfg: &HashMap<String, String>) -> Result<(), String> {
        let base = non_empty(cfg, items::LDAP_GROUP_BASE_DN);
        let attr = non_empty(cfg, items::LDAP_GROUP_ATTRIBUTE_NAME);
        match (base, attr) {
            (true, false) => Err(format!(
                "{} must be set together with {}",
                items::LDAP_GROUP_ATTRIBUTE_NAME,
                items::LDAP_GROUP_BASE_DN
            )),
            (false, true) => Err(format!(
                "{} must be set together with {}",
                items::LDAP_GROUP_BASE_DN,
                items::LDAP_GROUP_ATTRIBUTE_NAME
            )),
            _ => Ok(()),
        }
    }
}

/// OIDC login needs an https endpoint and a client id.
pub struct OidcRule;

impl Rule for OidcRule {
    fn name(&self) -> &'static str {
        "oidc"
    }

    fn check(&self, cfg: &HashMap<String, String>) -> Result<(), String> {
        if cfg.get(items::AUTH_MODE).map(String::as_str) != Some("oidc_auth") {
            return Ok(());
        }
        let endpoint = cfg.get(items::OIDC_ENDPOINT).map(|s| s.trim()).unwrap_or("");
        if endpoint.is_empty() {
            return Err(format!("{} is required for oidc_auth", items::OIDC_ENDPOINT));
        }
        if !endpoint.starts_with("https://") {
            return Err(format!("{} must use https", items::OIDC_ENDPOINT));
        }
        if !non_empty(cfg, items::OIDC_CLIENT_ID) {
            return Err(format!("{} is required for oidc_auth", items::OIDC_CLIENT_ID));
        }
        Ok(())
    }
}

pub fn default_rules() -> Vec<Box<dyn Rule>> {
    vec![Box::new(LdapGroupRule), Box::new(OidcRule)]
}
