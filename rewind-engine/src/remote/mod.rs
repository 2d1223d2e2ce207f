//! Boundary to the remote data platform.
//!
//! Everything the engine needs from a platform instance goes through
//! [`RemoteApi`]. The concrete REST client lives in [`rest`]; tests use an
//! in-memory fake.

#[cfg(test)]
pub(crate) mod fake;
pub mod rest;

use crate::schema::ObjectDescribe;
use crate::session::{Credentials, Session};
use crate::utils::errors::RemoteError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use rest::RestApi;

/// One record as exchanged with the platform: field name to JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// What a successful login hands back; the session manager turns it into a
/// [`Session`] with a computed expiry.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub access_token: String,
    pub instance_url: String,
    pub issued_at: DateTime<Utc>,
}

/// One page of a query cursor.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub records: Vec<Record>,

    /// Total rows the query will yield, if the platform reports it
    pub total_size: Option<u64>,

    /// Locator for the next page; `None` on the last page
    pub next: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Create,
    Update,
}

/// Per-record outcome of a bulk write, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub success: bool,
    pub id: Option<String>,
    pub error: Option<String>,
}

impl WriteResult {
    pub fn created(id: impl Into<String>) -> Self {
        Self {
            success: true,
            id: Some(id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            id: None,
            error: Some(error.into()),
        }
    }
}

/// Operations the engine consumes from a platform instance.
///
/// Query cursors are finite and not restartable: a page locator is only
/// valid once, in order.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant, RemoteError>;

    async fn describe(&self, session: &Session, object: &str) -> Result<ObjectDescribe, RemoteError>;

    async fn query(
        &self,
        session: &Session,
        object: &str,
        fields: &[String],
        batch_size: usize,
    ) -> Result<QueryPage, RemoteError>;

    async fn query_more(&self, session: &Session, locator: &str) -> Result<QueryPage, RemoteError>;

    async fn bulk_write(
        &self,
        session: &Session,
        object: &str,
        mode: WriteMode,
        records: &[Record],
    ) -> Result<Vec<WriteResult>, RemoteError>;
}
