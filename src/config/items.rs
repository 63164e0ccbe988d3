//! The built-in item table.

use super::metadata::{Item, ItemType, Scope};

pub const ADMIN_INITIAL_PASSWORD: &str = "admin_initial_password";
pub const AUTH_MODE: &str = "auth_mode";
pub const CORE_URL: &str = "core_url";
pub const EXT_ENDPOINT: &str = "ext_endpoint";
pub const NOTARY_URL: &str = "notary_url";
pub const READ_ONLY: &str = "read_only";
pub const SELF_REGISTRATION: &str = "self_registration";
pub const PROJECT_CREATION_RESTRICTION: &str = "project_creation_restriction";
pub const TOKEN_EXPIRATION: &str = "token_expiration";
pub const ROBOT_TOKEN_DURATION: &str = "robot_token_duration";
pub const ROBOT_NAME_PREFIX: &str = "robot_name_prefix";
pub const SCAN_ALL_POLICY: &str = "scan_all_policy";

pub const EMAIL_HOST: &str = "email_host";
pub const EMAIL_PORT: &str = "email_port";
pub const EMAIL_USERNAME: &str = "email_username";
pub const EMAIL_PASSWORD: &str = "email_password";
pub const EMAIL_FROM: &str = "email_from";
pub const EMAIL_SSL: &str = "email_ssl";
pub const EMAIL_IDENTITY: &str = "email_identity";
pub const EMAIL_INSECURE: &str = "email_insecure";

pub const LDAP_URL: &str = "ldap_url";
pub const LDAP_SEARCH_DN: &str = "ldap_search_dn";
pub const LDAP_SEARCH_PASSWORD: &str = "ldap_search_password";
pub const LDAP_BASE_DN: &str = "ldap_base_dn";
pub const LDAP_UID: &str = "ldap_uid";
pub const LDAP_FILTER: &str = "ldap_filter";
pub const LDAP_SCOPE: &str = "ldap_scope";
pub const LDAP_TIMEOUT: &str = "ldap_timeout";
pub const LDAP_VERIFY_CERT: &str = "ldap_verify_cert";
pub const LDAP_GROUP_MEMBERSHIP_ATTRIBUTE: &str = "ldap_group_membership_attribute";
pub const LDAP_GROUP_BASE_DN: &str = "ldap_group_base_dn";
pub const LDAP_GROUP_SEARCH_FILTER: &str = "ldap_group_search_filter";
pub const LDAP_GROUP_ATTRIBUTE_NAME: &str = "ldap_group_attribute_name";
pub const LDAP_GROUP_SEARCH_SCOPE: &str = "ldap_group_search_scope";
pub const LDAP_GROUP_ADMIN_DN: &str = "ldap_group_admin_dn";

pub const UAA_ENDPOINT: &str = "uaa_endpoint";
pub const UAA_CLIENT_ID: &str = "uaa_client_id";
pub const UAA_CLIENT_SECRET: &str = "uaa_client_secret";
pub const UAA_VERIFY_CERT: &str = "uaa_verify_cert";

pub const HTTP_AUTHPROXY_ENDPOINT: &str = "http_authproxy_endpoint";
pub const HTTP_AUTHPROXY_TOKENREVIEW_ENDPOINT: &str = "http_authproxy_tokenreview_endpoint";
pub const HTTP_AUTHPROXY_ADMIN_GROUPS: &str = "http_authproxy_admin_groups";
pub const HTTP_AUTHPROXY_ADMIN_USERNAMES: &str = "http_authproxy_admin_usernames";
pub const HTTP_AUTHPROXY_VERIFY_CERT: &str = "http_authproxy_verify_cert";
pub const HTTP_AUTHPROXY_SKIP_SEARCH: &str = "http_authproxy_skip_search";
pub const HTTP_AUTHPROXY_SERVER_CERTIFICATE: &str = "http_authproxy_server_certificate";

pub const OIDC_NAME: &str = "oidc_name";
pub const OIDC_ENDPOINT: &str = "oidc_endpoint";
pub const OIDC_CLIENT_ID: &str = "oidc_client_id";
pub const OIDC_CLIENT_SECRET: &str = "oidc_client_secret";
pub const OIDC_GROUPS_CLAIM: &str = "oidc_groups_claim";
pub const OIDC_ADMIN_GROUP: &str = "oidc_admin_group";
pub const OIDC_SCOPE: &str = "oidc_scope";
pub const OIDC_USER_CLAIM: &str = "oidc_user_claim";
pub const OIDC_VERIFY_CERT: &str = "oidc_verify_cert";
pub const OIDC_AUTO_ONBOARD: &str = "oidc_auto_onboard";
pub const OIDC_EXTRA_REDIRECT_PARMS: &str = "oidc_extra_redirect_parms";

pub const POSTGRESQL_HOST: &str = "postgresql_host";
pub const POSTGRESQL_PORT: &str = "postgresql_port";
pub const POSTGRESQL_USERNAME: &str = "postgresql_username";
pub const POSTGRESQL_PASSWORD: &str = "postgresql_password";
pub const POSTGRESQL_DATABASE: &str = "postgresql_database";
pub const POSTGRESQL_SSLMODE: &str = "postgresql_sslmode";
pub const POSTGRESQL_MAX_IDLE_CONNS: &str = "postgresql_max_idle_conns";
pub const POSTGRESQL_MAX_OPEN_CONNS: &str = "postgresql_max_open_conns";

pub const QUOTA_PER_PROJECT_ENABLE: &str = "quota_per_project_enable";
pub const STORAGE_PER_PROJECT: &str = "storage_per_project";

pub const METRIC_ENABLE: &str = "metric_enable";
pub const METRIC_PORT: &str = "metric_port";
pub const METRIC_PATH: &str = "metric_path";
pub const METRIC_NAMESPACE: &str = "metric_namespace";
pub const METRIC_SUBSYSTEM: &str = "metric_subsystem";

pub const TRACE_ENABLED: &str = "trace_enabled";
pub const TRACE_SERVICE_NAME: &str = "trace_service_name";
pub const TRACE_SAMPLE_RATE: &str = "trace_sample_rate";
pub const TRACE_ATTRIBUTES: &str = "trace_attribute";
pub const TRACE_OTEL_ENDPOINT: &str = "trace_otel_endpoint";
pub const TRACE_OTEL_TIMEOUT: &str = "trace_otel_timeout";

pub const CONFIG_CACHE_TTL: &str = "config_cache_ttl";
pub const CONFIG_REFRESH_INTERVAL: &str = "config_refresh_interval";

const BASIC: &str = "basic";
const EMAIL: &str = "email";
const LDAP_BASIC: &str = "ldapbasic";
const LDAP_GROUP: &str = "ldapgroup";
const UAA: &str = "uaa";
const HTTP_AUTH: &str = "http_auth";
const OIDC: &str = "oidc";
const DATABASE: &str = "database";
const QUOTA: &str = "quota";

fn system(name: &'static str, group: &'static str, env: &'static str, default: &'static str, t: ItemType) -> Item {
    Item {
        name,
        scope: Scope::System,
        group,
        env_key: Some(env),
        default_value: default,
        item_type: t,
        editable: false,
        description: "",
    }
}

fn user(
    name: &'static str,
    group: &'static str,
    env: Option<&'static str>,
    default: &'static str,
    t: ItemType,
    description: &'static str,
) -> Item {
    Item {
        name,
        scope: Scope::User,
        group,
        env_key: env,
        default_value: default,
        item_type: t,
        editable: true,
        description,
    }
}

pub fn all() -> Vec<Item> {
    use ItemType::*;

    vec![
        system(ADMIN_INITIAL_PASSWORD, BASIC, "HARBOR_ADMIN_PASSWORD", "", Password),
        user(AUTH_MODE, BASIC, Some("AUTH_MODE"), "db_auth", AuthMode, "The auth mode of the system"),
        system(CORE_URL, BASIC, "CORE_URL", "http://core:8080", String),
        system(EXT_ENDPOINT, BASIC, "EXT_ENDPOINT", "https://host01.com", String),
        system(NOTARY_URL, BASIC, "NOTARY_URL", "http://notary-server:4443", String),
        user(READ_ONLY, BASIC, Some("READ_ONLY"), "false", Bool, "Whether the registry is in read-only mode"),
        user(SELF_REGISTRATION, BASIC, Some("SELF_REGISTRATION"), "false", Bool, "Whether users may sign up themselves"),
        user(
            PROJECT_CREATION_RESTRICTION,
            BASIC,
            Some("PROJECT_CREATION_RESTRICTION"),
            "everyone",
            ProjectCreationRestriction,
            "Who can create projects: adminonly or everyone",
        ),
        user(TOKEN_EXPIRATION, BASIC, Some("TOKEN_EXPIRATION"), "30", Int, "Registry token lifetime in minutes"),
        user(ROBOT_TOKEN_DURATION, BASIC, Some("ROBOT_TOKEN_DURATION"), "30", Int, "Robot token lifetime in days"),
        user(ROBOT_NAME_PREFIX, BASIC, Some("ROBOT_NAME_PREFIX"), "robot$", String, "Prefix of robot account names"),
        user(SCAN_ALL_POLICY, BASIC, None, "{}", Map, "The policy to scan all images"),
        // email
        user(EMAIL_HOST, EMAIL, Some("EMAIL_HOST"), "smtp.mydomain.com", String, "SMTP server host"),
        user(EMAIL_PORT, EMAIL, Some("EMAIL_PORT"), "25", Port, "SMTP server port"),
        user(EMAIL_USERNAME, EMAIL, Some("EMAIL_USR"), "sample_admin@mydomain.com", String, "SMTP user"),
        user(EMAIL_PASSWORD, EMAIL, Some("EMAIL_PWD"), "", Password, "SMTP password"),
        user(EMAIL_FROM, EMAIL, Some("EMAIL_FROM"), "admin <sample_admin@mydomain.com>", String, "Sender of notifications"),
        user(EMAIL_SSL, EMAIL, Some("EMAIL_SSL"), "false", Bool, "Connect to SMTP over TLS"),
        user(EMAIL_IDENTITY, EMAIL, Some("EMAIL_IDENTITY"), "", String, "SMTP identity, defaults to the user"),
        user(EMAIL_INSECURE, EMAIL, Some("EMAIL_INSECURE"), "false", Bool, "Skip SMTP certificate verification"),
        // ldap
        user(LDAP_URL, LDAP_BASIC, Some("LDAP_URL"), "", NonEmptyString, "LDAP server URL"),
        user(LDAP_SEARCH_DN, LDAP_BASIC, Some("LDAP_SEARCH_DN"), "", String, "DN used for searches"),
        user(LDAP_SEARCH_PASSWORD, LDAP_BASIC, Some("LDAP_SEARCH_PWD"), "", Password, "Password of the search DN"),
        user(LDAP_BASE_DN, LDAP_BASIC, Some("LDAP_BASE_DN"), "", NonEmptyString, "Base DN for user lookups"),
        user(LDAP_UID, LDAP_BASIC, Some("LDAP_UID"), "cn", NonEmptyString, "Attribute identifying users"),
        user(LDAP_FILTER, LDAP_BASIC, Some("LDAP_FILTER"), "", String, "Filter for user searches"),
        user(LDAP_SCOPE, LDAP_BASIC, Some("LDAP_SCOPE"), "2", LdapScope, "0 base, 1 one level, 2 subtree"),
        user(LDAP_TIMEOUT, LDAP_BASIC, Some("LDAP_TIMEOUT"), "5", Int, "LDAP timeout in seconds"),
        user(LDAP_VERIFY_CERT, LDAP_BASIC, Some("LDAP_VERIFY_CERT"), "true", Bool, "Verify the LDAP certificate"),
        user(
            LDAP_GROUP_MEMBERSHIP_ATTRIBUTE,
            LDAP_BASIC,
            Some("LDAP_GROUP_MEMBERSHIP_ATTRIBUTE"),
            "memberof",
            String,
            "User attribute listing group membership",
        ),
        user(LDAP_GROUP_BASE_DN, LDAP_GROUP, Some("LDAP_GROUP_BASE_DN"), "", String, "Base DN for group searches"),
        user(LDAP_GROUP_SEARCH_FILTER, LDAP_GROUP, Some("LDAP_GROUP_FILTER"), "", String, "Filter for group searches"),
        user(LDAP_GROUP_ATTRIBUTE_NAME, LDAP_GROUP, Some("LDAP_GROUP_GID"), "", String, "Attribute identifying groups"),
        user(LDAP_GROUP_SEARCH_SCOPE, LDAP_GROUP, Some("LDAP_GROUP_SCOPE"), "2", LdapScope, "Scope of group searches"),
        user(LDAP_GROUP_ADMIN_DN, LDAP_GROUP, Some("LDAP_GROUP_ADMIN_DN"), "", String, "Group with admin rights"),
        // uaa
        user(UAA_ENDPOINT, UAA, Some("UAA_ENDPOINT"), "", String, "UAA endpoint"),
        user(UAA_CLIENT_ID, UAA, Some("UAA_CLIENTID"), "", String, "UAA client id"),
        user(UAA_CLIENT_SECRET, UAA, Some("UAA_CLIENTSECRET"), "", Password, "UAA client secret"),
        user(UAA_VERIFY_CERT, UAA, Some("UAA_VERIFY_CERT"), "false", Bool, "Verify the UAA certificate"),
        // http auth proxy
        user(HTTP_AUTHPROXY_ENDPOINT, HTTP_AUTH, None, "", String, "Auth proxy endpoint"),
        user(HTTP_AUTHPROXY_TOKENREVIEW_ENDPOINT, HTTP_AUTH, None, "", String, "Token review endpoint"),
        user(HTTP_AUTHPROXY_ADMIN_GROUPS, HTTP_AUTH, None, "", String, "Groups with admin rights"),
        user(HTTP_AUTHPROXY_ADMIN_USERNAMES, HTTP_AUTH, None, "", String, "Users with admin rights"),
        user(HTTP_AUTHPROXY_VERIFY_CERT, HTTP_AUTH, None, "true", Bool, "Verify the proxy certificate"),
        user(HTTP_AUTHPROXY_SKIP_SEARCH, HTTP_AUTH, None, "false", Bool, "Skip user search before onboarding"),
        user(HTTP_AUTHPROXY_SERVER_CERTIFICATE, HTTP_AUTH, None, "", String, "Certificate of the proxy"),
        // oidc
        user(OIDC_NAME, OIDC, None, "", String, "Provider name"),
        user(OIDC_ENDPOINT, OIDC, None, "", String, "Provider endpoint"),
        user(OIDC_CLIENT_ID, OIDC, None, "", String, "Client id"),
        user(OIDC_CLIENT_SECRET, OIDC, None, "", Password, "Client secret"),
        user(OIDC_GROUPS_CLAIM, OIDC, None, "", String, "Claim carrying group names"),
        user(OIDC_ADMIN_GROUP, OIDC, None, "", String, "Group with admin rights"),
        user(OIDC_SCOPE, OIDC, None, "", String, "Requested scopes, comma separated"),
        user(OIDC_USER_CLAIM, OIDC, None, "", String, "Claim carrying the username"),
        user(OIDC_VERIFY_CERT, OIDC, None, "true", Bool, "Verify the provider certificate"),
        user(OIDC_AUTO_ONBOARD, OIDC, None, "false", Bool, "Onboard users on first login"),
        user(OIDC_EXTRA_REDIRECT_PARMS, OIDC, None, "{}", StringToStringMap, "Extra redirect parameters"),
        // database
        system(POSTGRESQL_HOST, DATABASE, "POSTGRESQL_HOST", "postgresql", String),
        system(POSTGRESQL_PORT, DATABASE, "POSTGRESQL_PORT", "5432", Port),
        system(POSTGRESQL_USERNAME, DATABASE, "POSTGRESQL_USERNAME", "postgres", String),
        system(POSTGRESQL_PASSWORD, DATABASE, "POSTGRESQL_PASSWORD", "root123", Password),
        system(POSTGRESQL_DATABASE, DATABASE, "POSTGRESQL_DATABASE", "registry", String),
        system(POSTGRESQL_SSLMODE, DATABASE, "POSTGRESQL_SSLMODE", "disable", String),
        system(POSTGRESQL_MAX_IDLE_CONNS, DATABASE, "POSTGRESQL_MAX_IDLE_CONNS", "2", Int),
        system(POSTGRESQL_MAX_OPEN_CONNS, DATABASE, "POSTGRESQL_MAX_OPEN_CONNS", "0", Int),
        // quota
        user(QUOTA_PER_PROJECT_ENABLE, QUOTA, Some("QUOTA_PER_PROJECT_ENABLE"), "true", Bool, "Enable per-project quota"),
        user(STORAGE_PER_PROJECT, QUOTA, Some("STORAGE_PER_PROJECT"), "-1", Quota, "Storage quota per project, -1 is unlimited"),
        // metrics and tracing
        system(METRIC_ENABLE, BASIC, "METRIC_ENABLE", "false", Bool),
        system(METRIC_PORT, BASIC, "METRIC_PORT", "9090", Port),
        system(METRIC_PATH, BASIC, "METRIC_PATH", "/metrics", String),
        system(METRIC_NAMESPACE, BASIC, "METRIC_NAMESPACE", "harbor", String),
        system(METRIC_SUBSYSTEM, BASIC, "METRIC_SUBSYSTEM", "core", String),
        system(TRACE_ENABLED, BASIC, "TRACE_ENABLED", "false", Bool),
        system(TRACE_SERVICE_NAME, BASIC, "TRACE_SERVICE_NAME", "", String),
        system(TRACE_SAMPLE_RATE, BASIC, "TRACE_SAMPLE_RATE", "1", Float64),
        system(TRACE_ATTRIBUTES, BASIC, "TRACE_ATTRIBUTES", "", StringToStringMap),
        system(TRACE_OTEL_ENDPOINT, BASIC, "TRACE_OTEL_ENDPOINT", "", String),
        system(TRACE_OTEL_TIMEOUT, BASIC, "TRACE_OTEL_TIMEOUT", "10", Int64),
        // this service
        system(CONFIG_CACHE_TTL, BASIC, "CONFIG_CACHE_TTL", "60s", Duration),
        system(CONFIG_REFRESH_INTERVAL, BASIC, "CONFIG_REFRESH_INTERVAL", "5m", Duration),
    ]
}
