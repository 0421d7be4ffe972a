//! Capability traits for the hosted backend (auth, tables, blob storage).
//!
//! `SupabaseClient` is the HTTP implementation; `RetryingClient` wraps any
//! implementor and adds the retry policy. Tests substitute in-memory fakes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::errors::BackendError;

pub mod client;

pub use client::SupabaseClient;

// ────────────────────────────────────────────────────────────────────────────
// Wire models
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignUpCredentials {
    pub email: String,
    pub password: String,
    /// User metadata stored alongside the account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
    /// Unix seconds. Filled in from `expires_in` when the server omits it.
    pub expires_at: Option<i64>,
    pub user: User,
}

impl Session {
    /// True when the access token expires within `margin_secs` of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, margin_secs: i64) -> bool {
        match self.expires_at {
            Some(at) => at - margin_secs <= now.timestamp(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthResponse {
    pub user: Option<User>,
    pub session: Option<Session>,
}

/// Equality filter rendered as `column=eq.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub(crate) fn query_pair(&self) -> (String, String) {
        (self.column.clone(), format!("eq.{}", self.value))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadResponse {
    #[serde(rename = "Key")]
    pub key: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Capability traits
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn sign_in_with_password(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthResponse, BackendError>;

    async fn sign_up(&self, credentials: &SignUpCredentials)
        -> Result<AuthResponse, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    /// Receiver that observes every session change (sign-in, refresh, sign-out).
    fn on_auth_state_change(&self) -> watch::Receiver<Option<Session>>;
}

#[async_trait]
pub trait TableApi: Send + Sync {
    async fn select(
        &self,
        table: &str,
        columns: Option<&str>,
        filters: &[Filter],
    ) -> Result<Vec<Value>, BackendError>;

    async fn insert(&self, table: &str, values: &Value) -> Result<Vec<Value>, BackendError>;

    async fn update(
        &self,
        table: &str,
        values: &Value,
        filters: &[Filter],
    ) -> Result<Vec<Value>, BackendError>;

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, BackendError>;
}

#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadResponse, BackendError>;

    async fn get_public_url(&self, bucket: &str, path: &str) -> Result<String, BackendError>;
}
