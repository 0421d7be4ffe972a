//! HTTP client for the hosted backend: GoTrue auth, PostgREST tables and
//! object storage, all behind one project URL and anon key.
//!
//! This type performs a single request per call and never retries on its own;
//! wrap it in `RetryingClient` for the retry policy.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::BackendError;
use crate::supabase::{
    AuthApi, AuthResponse, Credentials, Filter, Session, SignUpCredentials, StorageApi, TableApi,
    UploadResponse, User,
};

const CLIENT_INFO: &str = concat!("magiccv-backend/", env!("CARGO_PKG_VERSION"));
/// Sessions this close to expiry are refreshed before being handed out.
const EXPIRY_MARGIN_SECS: i64 = 60;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub struct SupabaseClient {
    http: Client,
    base_url: String,
    anon_key: String,
    schema: String,
    session: watch::Sender<Option<Session>>,
}

impl SupabaseClient {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        schema: &str,
        http_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = Client::builder().timeout(http_timeout).build()?;
        let (session, _) = watch::channel(None);

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            schema: schema.to_string(),
            session,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, BackendError> {
        Self::new(
            &config.supabase_url,
            &config.supabase_anon_key,
            &config.supabase_schema,
            config.http_timeout,
        )
    }

    /// Exchanges the stored refresh token for a new session.
    pub async fn refresh_session(&self) -> Result<Session, BackendError> {
        let refresh_token = self
            .session
            .borrow()
            .as_ref()
            .and_then(|s| s.refresh_token.clone())
            .ok_or(BackendError::NotAuthenticated)?;

        let request = self
            .request(Method::POST, "/auth/v1/token")
            .query(&[("grant_type", "refresh_token")])
            .json(&json!({ "refresh_token": refresh_token }));
        let session: Session = self.send_json(request).await?;
        let session = self.store_session(session);
        debug!(user_id = %session.user.id, "Session refreshed");
        Ok(session)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let token = self
            .session
            .borrow()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone());

        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("apikey", &self.anon_key)
            .header("x-client-info", CLIENT_INFO)
            .bearer_auth(token)
    }

    fn table_request(&self, method: Method, table: &str, filters: &[Filter]) -> RequestBuilder {
        let pairs: Vec<(String, String)> = filters.iter().map(Filter::query_pair).collect();
        let profile_header = if method == Method::GET {
            "Accept-Profile"
        } else {
            "Content-Profile"
        };

        self.request(method, &format!("/rest/v1/{table}"))
            .header(profile_header, &self.schema)
            .header("Prefer", "return=representation")
            .query(&pairs)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        let response = check_status(request.send().await?).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn send_rows(&self, request: RequestBuilder) -> Result<Vec<Value>, BackendError> {
        let response = check_status(request.send().await?).await?;
        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&body)?)
    }

    fn store_session(&self, mut session: Session) -> Session {
        if session.expires_at.is_none() {
            session.expires_at = Some(Utc::now().timestamp() + session.expires_in);
        }
        self.session.send_replace(Some(session.clone()));
        session
    }
}

async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Api {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

/// Picks the human-readable message out of an error body. The auth, table and
/// storage services each use a different key.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|key| v.get(key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl AuthApi for SupabaseClient {
    async fn sign_in_with_password(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthResponse, BackendError> {
        let request = self
            .request(Method::POST, "/auth/v1/token")
            .query(&[("grant_type", "password")])
            .json(credentials);
        let session: Session = self.send_json(request).await?;
        let session = self.store_session(session);
        info!(user_id = %session.user.id, "Signed in");

        Ok(AuthResponse {
            user: Some(session.user.clone()),
            session: Some(session),
        })
    }

    async fn sign_up(
        &self,
        credentials: &SignUpCredentials,
    ) -> Result<AuthResponse, BackendError> {
        let request = self.request(Method::POST, "/auth/v1/signup").json(credentials);
        let body: Value = self.send_json(request).await?;

        // With email confirmation enabled the server returns the bare user.
        if body.get("access_token").is_some() {
            let session = self.store_session(serde_json::from_value(body)?);
            info!(user_id = %session.user.id, "Signed up with session");
            Ok(AuthResponse {
                user: Some(session.user.clone()),
                session: Some(session),
            })
        } else {
            let user: User = serde_json::from_value(body)?;
            info!(user_id = %user.id, "Signed up, confirmation pending");
            Ok(AuthResponse {
                user: Some(user),
                session: None,
            })
        }
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        if self.session.borrow().is_none() {
            return Ok(());
        }

        let response = self.request(Method::POST, "/auth/v1/logout").send().await?;
        match check_status(response).await {
            Ok(_) => {}
            // Token already revoked or unknown; the local session is still dropped.
            Err(BackendError::Api { status: 401 | 404, .. }) => {}
            Err(e) => return Err(e),
        }

        self.session.send_replace(None);
        info!("Signed out");
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let current = self.session.borrow().clone();
        match current {
            Some(session) if session.is_expired_at(Utc::now(), EXPIRY_MARGIN_SECS) => {
                if session.refresh_token.is_some() {
                    self.refresh_session().await.map(Some)
                } else {
                    self.session.send_replace(None);
                    Ok(None)
                }
            }
            other => Ok(other),
        }
    }

    fn on_auth_state_change(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }
}

#[async_trait]
impl TableApi for SupabaseClient {
    async fn select(
        &self,
        table: &str,
        columns: Option<&str>,
        filters: &[Filter],
    ) -> Result<Vec<Value>, BackendError> {
        let request = self
            .table_request(Method::GET, table, filters)
            .query(&[("select", columns.unwrap_or("*"))]);
        self.send_rows(request).await
    }

    async fn insert(&self, table: &str, values: &Value) -> Result<Vec<Value>, BackendError> {
        let request = self.table_request(Method::POST, table, &[]).json(values);
        self.send_rows(request).await
    }

    async fn update(
        &self,
        table: &str,
        values: &Value,
        filters: &[Filter],
    ) -> Result<Vec<Value>, BackendError> {
        let request = self.table_request(Method::PATCH, table, filters).json(values);
        self.send_rows(request).await
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, BackendError> {
        let request = self.table_request(Method::DELETE, table, filters);
        self.send_rows(request).await
    }
}

#[async_trait]
impl StorageApi for SupabaseClient {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadResponse, BackendError> {
        let size = body.len();
        let request = self
            .request(
                Method::POST,
                &format!("/storage/v1/object/{bucket}/{}", path.trim_start_matches('/')),
            )
            .header("content-type", content_type.unwrap_or(DEFAULT_CONTENT_TYPE))
            .header("x-upsert", "false")
            .body(body);
        let uploaded: UploadResponse = self.send_json(request).await?;
        debug!(key = %uploaded.key, size, "Object uploaded");
        Ok(uploaded)
    }

    async fn get_public_url(&self, bucket: &str, path: &str) -> Result<String, BackendError> {
        Ok(format!(
            "{}/storage/v1/object/public/{bucket}/{}",
            self.base_url,
            path.trim_start_matches('/')
        ))
    }
}
