//! Retrying façade over the backend capability traits.
//!
//! `RetryingClient` exposes the same method surface as the wrapped client and
//! routes every call through `execute_with_retry` with a context label such as
//! `Auth:SignIn`, `DB:Select:<table>` or `Storage:Upload:<bucket>`.
//!
//! Scoped handles (`RetryingTable`, `RetryingBucket`) are small value objects:
//! build one per logical scope and reuse it. The wrapped client is shared by
//! `Arc` and never mutated here.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::watch;

use crate::errors::BackendError;
use crate::resilience::{execute_with_retry, RetryPolicy};
use crate::supabase::{
    AuthApi, AuthResponse, Credentials, Filter, Session, SignUpCredentials, StorageApi, TableApi,
    UploadResponse,
};

pub struct RetryingClient<C> {
    inner: Arc<C>,
    policy: RetryPolicy,
}

impl<C> Clone for RetryingClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: self.policy,
        }
    }
}

impl<C> RetryingClient<C> {
    pub fn new(inner: Arc<C>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<C: AuthApi> RetryingClient<C> {
    pub fn auth(&self) -> RetryingAuth<C> {
        RetryingAuth {
            inner: Arc::clone(&self.inner),
            policy: self.policy,
        }
    }
}

impl<C: TableApi> RetryingClient<C> {
    /// Handle scoped to `table`.
    pub fn from(&self, table: impl Into<String>) -> RetryingTable<C> {
        RetryingTable {
            inner: Arc::clone(&self.inner),
            policy: self.policy,
            table: table.into(),
            filters: Vec::new(),
        }
    }
}

impl<C: StorageApi> RetryingClient<C> {
    pub fn storage(&self) -> RetryingStorage<C> {
        RetryingStorage {
            inner: Arc::clone(&self.inner),
            policy: self.policy,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Auth
// ────────────────────────────────────────────────────────────────────────────

pub struct RetryingAuth<C> {
    inner: Arc<C>,
    policy: RetryPolicy,
}

impl<C: AuthApi> RetryingAuth<C> {
    pub async fn sign_in_with_password(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthResponse, BackendError> {
        execute_with_retry(&self.policy, "Auth:SignIn", || {
            self.inner.sign_in_with_password(credentials)
        })
        .await
    }

    pub async fn sign_up(
        &self,
        credentials: &SignUpCredentials,
    ) -> Result<AuthResponse, BackendError> {
        execute_with_retry(&self.policy, "Auth:SignUp", || self.inner.sign_up(credentials)).await
    }

    pub async fn sign_out(&self) -> Result<(), BackendError> {
        execute_with_retry(&self.policy, "Auth:SignOut", || self.inner.sign_out()).await
    }

    pub async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        execute_with_retry(&self.policy, "Auth:GetSession", || self.inner.get_session()).await
    }

    /// Not retried: subscribing is local and cannot fail.
    pub fn on_auth_state_change(&self) -> watch::Receiver<Option<Session>> {
        self.inner.on_auth_state_change()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tables
// ────────────────────────────────────────────────────────────────────────────

pub struct RetryingTable<C> {
    inner: Arc<C>,
    policy: RetryPolicy,
    table: String,
    filters: Vec<Filter>,
}

impl<C> Clone for RetryingTable<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: self.policy,
            table: self.table.clone(),
            filters: self.filters.clone(),
        }
    }
}

impl<C: TableApi> RetryingTable<C> {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Restricts select/update/delete to rows where `column` equals `value`.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub async fn select(&self, columns: Option<&str>) -> Result<Vec<Value>, BackendError> {
        let context = format!("DB:Select:{}", self.table);
        execute_with_retry(&self.policy, &context, || {
            self.inner.select(&self.table, columns, &self.filters)
        })
        .await
    }

    /// Repeated on transient failure; a write that landed before the failure
    /// surfaced can be inserted twice.
    pub async fn insert(&self, values: &Value) -> Result<Vec<Value>, BackendError> {
        let context = format!("DB:Insert:{}", self.table);
        execute_with_retry(&self.policy, &context, || self.inner.insert(&self.table, values)).await
    }

    pub async fn update(&self, values: &Value) -> Result<Vec<Value>, BackendError> {
        let context = format!("DB:Update:{}", self.table);
        execute_with_retry(&self.policy, &context, || {
            self.inner.update(&self.table, values, &self.filters)
        })
        .await
    }

    pub async fn delete(&self) -> Result<Vec<Value>, BackendError> {
        let context = format!("DB:Delete:{}", self.table);
        execute_with_retry(&self.policy, &context, || {
            self.inner.delete(&self.table, &self.filters)
        })
        .await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Storage
// ────────────────────────────────────────────────────────────────────────────

pub struct RetryingStorage<C> {
    inner: Arc<C>,
    policy: RetryPolicy,
}

impl<C: StorageApi> RetryingStorage<C> {
    /// Handle scoped to `bucket`.
    pub fn from(&self, bucket: impl Into<String>) -> RetryingBucket<C> {
        RetryingBucket {
            inner: Arc::clone(&self.inner),
            policy: self.policy,
            bucket: bucket.into(),
        }
    }
}

pub struct RetryingBucket<C> {
    inner: Arc<C>,
    policy: RetryPolicy,
    bucket: String,
}

impl<C: StorageApi> RetryingBucket<C> {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn upload(
        &self,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadResponse, BackendError> {
        let context = format!("Storage:Upload:{}", self.bucket);
        execute_with_retry(&self.policy, &context, || {
            self.inner
                .upload(&self.bucket, path, body.clone(), content_type)
        })
        .await
    }

    pub async fn get_public_url(&self, path: &str) -> Result<String, BackendError> {
        let context = format!("Storage:GetPublicUrl:{}", self.bucket);
        execute_with_retry(&self.policy, &context, || {
            self.inner.get_public_url(&self.bucket, path)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;
    use uuid::Uuid;

    use super::*;
    use crate::supabase::User;

    /// In-memory backend. Each target (table, bucket or "auth") fails a
    /// scripted number of times before succeeding.
    struct FakeBackend {
        failures: Mutex<HashMap<String, u32>>,
        hanging: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
        session: watch::Sender<Option<Session>>,
    }

    impl Default for FakeBackend {
        fn default() -> Self {
            Self {
                failures: Mutex::default(),
                hanging: Mutex::default(),
                calls: Mutex::default(),
                session: watch::channel(None).0,
            }
        }
    }

    impl FakeBackend {
        fn fail(self, target: &str, times: u32) -> Self {
            self.failures.lock().unwrap().insert(target.to_string(), times);
            self
        }

        fn hang(self, target: &str, times: u32) -> Self {
            self.hanging.lock().unwrap().insert(target.to_string(), times);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn take(map: &Mutex<HashMap<String, u32>>, target: &str) -> bool {
            let mut map = map.lock().unwrap();
            match map.get_mut(target) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        }

        async fn record(&self, target: &str, call: String) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(call);
            if Self::take(&self.hanging, target) {
                std::future::pending::<()>().await;
            }
            if Self::take(&self.failures, target) {
                return Err(BackendError::Api {
                    status: 503,
                    message: format!("{target} unavailable"),
                });
            }
            Ok(())
        }
    }

    fn session() -> Session {
        Session {
            access_token: "access".to_string(),
            refresh_token: None,
            token_type: "bearer".to_string(),
            expires_in: 3600,
            expires_at: None,
            user: User {
                id: Uuid::nil(),
                email: Some("jane@example.com".to_string()),
                created_at: None,
                user_metadata: Value::Null,
            },
        }
    }

    #[async_trait]
    impl AuthApi for FakeBackend {
        async fn sign_in_with_password(
            &self,
            credentials: &Credentials,
        ) -> Result<AuthResponse, BackendError> {
            self.record("auth", format!("sign_in:{}", credentials.email)).await?;
            self.session.send_replace(Some(session()));
            Ok(AuthResponse {
                user: Some(session().user),
                session: Some(session()),
            })
        }

        async fn sign_up(
            &self,
            credentials: &SignUpCredentials,
        ) -> Result<AuthResponse, BackendError> {
            self.record("auth", format!("sign_up:{}", credentials.email)).await?;
            Ok(AuthResponse {
                user: Some(session().user),
                session: None,
            })
        }

        async fn sign_out(&self) -> Result<(), BackendError> {
            self.record("auth", "sign_out".to_string()).await?;
            self.session.send_replace(None);
            Ok(())
        }

        async fn get_session(&self) -> Result<Option<Session>, BackendError> {
            self.record("auth", "get_session".to_string()).await?;
            Ok(self.session.borrow().clone())
        }

        fn on_auth_state_change(&self) -> watch::Receiver<Option<Session>> {
            self.session.subscribe()
        }
    }

    #[async_trait]
    impl TableApi for FakeBackend {
        async fn select(
            &self,
            table: &str,
            columns: Option<&str>,
            filters: &[Filter],
        ) -> Result<Vec<Value>, BackendError> {
            let call = format!("select:{table}:{}:{}", columns.unwrap_or("*"), filters.len());
            self.record(table, call).await?;
            Ok(vec![json!({ "table": table })])
        }

        async fn insert(&self, table: &str, values: &Value) -> Result<Vec<Value>, BackendError> {
            self.record(table, format!("insert:{table}")).await?;
            Ok(vec![values.clone()])
        }

        async fn update(
            &self,
            table: &str,
            values: &Value,
            filters: &[Filter],
        ) -> Result<Vec<Value>, BackendError> {
            let rendered: Vec<String> = filters
                .iter()
                .map(|f| format!("{}={}", f.column, f.value))
                .collect();
            self.record(table, format!("update:{table}:{}", rendered.join("&")))
                .await?;
            Ok(vec![values.clone()])
        }

        async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, BackendError> {
            self.record(table, format!("delete:{table}:{}", filters.len()))
                .await?;
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl StorageApi for FakeBackend {
        async fn upload(
            &self,
            bucket: &str,
            path: &str,
            body: Bytes,
            _content_type: Option<&str>,
        ) -> Result<UploadResponse, BackendError> {
            self.record(bucket, format!("upload:{bucket}/{path}:{}", body.len()))
                .await?;
            Ok(UploadResponse {
                key: format!("{bucket}/{path}"),
            })
        }

        async fn get_public_url(&self, bucket: &str, path: &str) -> Result<String, BackendError> {
            self.record(bucket, format!("public_url:{bucket}/{path}"))
                .await?;
            Ok(format!("https://cdn.example.com/{bucket}/{path}"))
        }
    }

    fn client(backend: FakeBackend) -> RetryingClient<FakeBackend> {
        RetryingClient::new(Arc::new(backend), RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_retries_until_success() {
        let client = client(FakeBackend::default().fail("processed_resumes", 2));
        let start = Instant::now();

        let rows = client
            .from("processed_resumes")
            .select(Some("id,status"))
            .await
            .unwrap();

        assert_eq!(rows, vec![json!({ "table": "processed_resumes" })]);
        assert_eq!(
            client.inner().calls(),
            vec!["select:processed_resumes:id,status:0"; 3]
        );
        assert!(start.elapsed() >= Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_exhaustion_returns_backend_error_unchanged() {
        let client = client(FakeBackend::default().fail("comments", u32::MAX));

        let err = client
            .from("comments")
            .insert(&json!({ "body": "great tool" }))
            .await
            .unwrap_err();

        match err {
            BackendError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "comments unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.inner().calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_reach_update_and_delete() {
        let client = client(FakeBackend::default());
        let resume = client.from("processed_resumes").eq("id", "7");

        resume.update(&json!({ "status": "completed" })).await.unwrap();
        resume.delete().await.unwrap();

        assert_eq!(
            client.inner().calls(),
            vec![
                "update:processed_resumes:id=7".to_string(),
                "delete:processed_resumes:1".to_string(),
            ]
        );
        assert_eq!(resume.table(), "processed_resumes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_resends_full_payload_on_retry() {
        let client = client(FakeBackend::default().fail("resumes", 1));
        let bucket = client.storage().from("resumes");

        let uploaded = bucket
            .upload(
                "user-1/resume.pdf",
                Bytes::from_static(b"%PDF-1.7 body"),
                Some("application/pdf"),
            )
            .await
            .unwrap();

        assert_eq!(uploaded.key, "resumes/user-1/resume.pdf");
        assert_eq!(
            client.inner().calls(),
            vec!["upload:resumes/user-1/resume.pdf:13"; 2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_public_url_times_out_then_recovers() {
        let client = client(FakeBackend::default().hang("resumes", 1));
        let start = Instant::now();

        let url = client
            .storage()
            .from("resumes")
            .get_public_url("user-1/resume.pdf")
            .await
            .unwrap();

        assert_eq!(url, "https://cdn.example.com/resumes/user-1/resume.pdf");
        assert_eq!(client.inner().calls().len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(11_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_forever_surfaces_timeout() {
        let client = client(FakeBackend::default().hang("auth", u32::MAX));

        let err = client.auth().get_session().await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "operation timed out after 10000ms");
        assert_eq!(client.inner().calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_flow_and_state_subscription() {
        let client = client(FakeBackend::default().fail("auth", 1));
        let auth = client.auth();
        let changes = auth.on_auth_state_change();

        let signed_in = auth
            .sign_in_with_password(&Credentials {
                email: "jane@example.com".to_string(),
                password: "hunter2".to_string(),
            })
            .await
            .unwrap();
        assert!(signed_in.session.is_some());
        assert!(changes.borrow().is_some());
        assert!(auth.get_session().await.unwrap().is_some());

        auth.sign_out().await.unwrap();
        assert!(changes.borrow().is_none());

        let signed_up = auth
            .sign_up(&SignUpCredentials {
                email: "sam@example.com".to_string(),
                password: "hunter3".to_string(),
                data: None,
            })
            .await
            .unwrap();
        assert!(signed_up.session.is_none());

        assert_eq!(
            client.inner().calls(),
            vec![
                "sign_in:jane@example.com",
                "sign_in:jane@example.com",
                "get_session",
                "sign_out",
                "sign_up:sam@example.com",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_scopes_share_client_not_attempts() {
        let client = client(
            FakeBackend::default()
                .fail("processed_resumes", 2)
                .fail("comments", 1),
        );
        let resumes = client.from("processed_resumes");
        let comments = client.from("comments");

        let (a, b) = tokio::join!(resumes.select(None), comments.select(None));

        assert!(a.is_ok());
        assert!(b.is_ok());
        let calls = client.inner().calls();
        assert_eq!(calls.iter().filter(|c| c.contains("processed_resumes")).count(), 3);
        assert_eq!(calls.iter().filter(|c| c.contains("comments")).count(), 2);
    }
}
