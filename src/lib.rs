//! Trust Registry — TUF metadata signing server and typed configuration store.
//!
//! ## Endpoints
//!
//! - `GET    /health`                                — Health check
//! - `GET    /v2/<gun>/_trust/tuf/<role>.json`       — Current metadata for a role
//! - `GET    /v2/<gun>/_trust/tuf/<N>.<role>.json`   — Metadata by version
//! - `GET    /v2/<gun>/_trust/tuf/<sha256>.<role>.json` — Metadata by checksum
//! - `GET    /v2/<gun>/_trust/tuf/<role>.key`        — Server-held public key (created on demand)
//! - `POST   /v2/<gun>/_trust/tuf/<role>.key`        — Rotate a server-held key
//! - `POST   /v2/<gun>/_trust/tuf/`                  — Multipart atomic publish
//! - `DELETE /v2/<gun>/_trust/tuf/`                  — Delete all trust data for a GUN
//! - `GET    /v2/<gun>/_trust/changefeed`            — Changes of one GUN
//! - `GET    /v2/_trust/changefeed`                  — Changes of every GUN
//! - `GET|PUT /api/configurations`                   — User-scope configuration
//! - `GET|PUT /api/internal/configurations`          — Full configuration for peers

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod handlers_config;
pub mod jobs;
pub mod models;
pub mod oidc;
pub mod routes;
pub mod server;
pub mod storage;
pub mod tuf;

pub use db::AppState;
pub use routes::router;
