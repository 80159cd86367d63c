//! Job-host registration client.
//!
//! Keeps job-host-side runner registrations consistent with the fleet:
//! - Listing registrations for this fleet's scope
//! - Issuing short-lived registration tokens for new instances
//! - Removing registrations for instances that are gone
//!
//! The client tracks remaining rate-limit quota from response headers and
//! exposes it so the reconciler can skip the registration-list step of a
//! pass instead of exhausting the budget. Thousands of runners hammering
//! the global limit is the documented failure mode this defends against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::JobHostError;
use crate::fleet::{Registration, RegistrationToken};

/// Job-host registration operations.
#[async_trait]
pub trait JobHost: Send + Sync {
    /// Registrations currently known to the job host for this scope.
    async fn list_registrations(&self) -> Result<Vec<Registration>, JobHostError>;

    /// Issue a short-lived token a new instance uses to self-register.
    async fn create_registration_token(&self) -> Result<RegistrationToken, JobHostError>;

    /// Remove a registration by runner name.
    ///
    /// `NotFound` means already clean; `RateLimited` means back off until
    /// a later pass.
    async fn remove_registration(&self, name: &str) -> Result<(), JobHostError>;

    /// Remaining rate-limit quota, if the job host has reported one.
    fn remaining_quota(&self) -> Option<u32>;
}

const QUOTA_UNKNOWN: u32 = u32::MAX;

/// HTTP job-host client.
pub struct HttpJobHost {
    client: reqwest::Client,
    base_url: String,
    scope: String,
    quota: AtomicU32,
}

impl HttpJobHost {
    pub fn new(config: &Config) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            config.jobhost_api_token
        ))
        .expect("Invalid job host API token");
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .default_headers(headers)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.jobhost_api_url.trim_end_matches('/').to_string(),
            scope: config.jobhost_scope.clone(),
            quota: AtomicU32::new(QUOTA_UNKNOWN),
        }
    }

    /// Record the remaining quota from a response's rate-limit headers.
    fn observe_quota(&self, response: &reqwest::Response) {
        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());

        if let Some(remaining) = remaining {
            self.quota.store(remaining, Ordering::Relaxed);
            debug!(remaining, "Job host quota observed");
        }
    }

    fn rate_limited_error(response: &reqwest::Response) -> JobHostError {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        JobHostError::RateLimited { retry_after }
    }
}

#[async_trait]
impl JobHost for HttpJobHost {
    async fn list_registrations(&self) -> Result<Vec<Registration>, JobHostError> {
        let url = format!("{}/v1/{}/runners", self.base_url, self.scope);
        let response = self.client.get(&url).send().await?;
        self.observe_quota(&response);

        match response.status() {
            status if status.is_success() => {
                let body: RunnerListResponse = response.json().await?;
                Ok(body.runners)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(Self::rate_limited_error(&response)),
            status => Err(JobHostError::Protocol(format!("list returned {status}"))),
        }
    }

    async fn create_registration_token(&self) -> Result<RegistrationToken, JobHostError> {
        let url = format!("{}/v1/{}/runners/registration-token", self.base_url, self.scope);
        let response = self.client.post(&url).send().await?;
        self.observe_quota(&response);

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::TOO_MANY_REQUESTS => Err(Self::rate_limited_error(&response)),
            status => Err(JobHostError::Protocol(format!("token returned {status}"))),
        }
    }

    async fn remove_registration(&self, name: &str) -> Result<(), JobHostError> {
        let url = format!("{}/v1/{}/runners/{}", self.base_url, self.scope, name);
        let response = self.client.delete(&url).send().await?;
        self.observe_quota(&response);

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(JobHostError::NotFound(name.to_string())),
            StatusCode::TOO_MANY_REQUESTS => {
                warn!(runner = %name, "Registration removal rate limited");
                Err(Self::rate_limited_error(&response))
            }
            status => Err(JobHostError::Protocol(format!("remove returned {status}"))),
        }
    }

    fn remaining_quota(&self) -> Option<u32> {
        match self.quota.load(Ordering::Relaxed) {
            QUOTA_UNKNOWN => None,
            remaining => Some(remaining),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunnerListResponse {
    runners: Vec<Registration>,
}

/// In-memory job host for tests.
pub struct MockJobHost {
    registrations: Mutex<HashMap<String, Registration>>,
    next_id: AtomicU32,
    quota: AtomicU32,

    /// Fail the next N removals with `RateLimited`.
    rate_limit_removals: AtomicU32,
}

impl MockJobHost {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            quota: AtomicU32::new(QUOTA_UNKNOWN),
            rate_limit_removals: AtomicU32::new(0),
        }
    }

    /// Register a runner name, as the instance agent would on boot.
    pub fn register(&self, name: &str, busy: bool) {
        let id = i64::from(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.registrations.lock().unwrap().insert(
            name.to_string(),
            Registration {
                id,
                name: name.to_string(),
                busy,
                online: true,
            },
        );
    }

    pub fn set_busy(&self, name: &str, busy: bool) {
        if let Some(reg) = self.registrations.lock().unwrap().get_mut(name) {
            reg.busy = busy;
        }
    }

    pub fn set_online(&self, name: &str, online: bool) {
        if let Some(reg) = self.registrations.lock().unwrap().get_mut(name) {
            reg.online = online;
        }
    }

    pub fn set_quota(&self, remaining: u32) {
        self.quota.store(remaining, Ordering::SeqCst);
    }

    pub fn rate_limit_next_removals(&self, n: u32) {
        self.rate_limit_removals.store(n, Ordering::SeqCst);
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    pub fn registration_names(&self) -> Vec<String> {
        self.registrations.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for MockJobHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHost for MockJobHost {
    async fn list_registrations(&self) -> Result<Vec<Registration>, JobHostError> {
        Ok(self.registrations.lock().unwrap().values().cloned().collect())
    }

    async fn create_registration_token(&self) -> Result<RegistrationToken, JobHostError> {
        Ok(RegistrationToken {
            token: "mock-registration-token".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn remove_registration(&self, name: &str) -> Result<(), JobHostError> {
        let limited = self.rate_limit_removals.load(Ordering::SeqCst);
        if limited > 0 {
            self.rate_limit_removals.store(limited - 1, Ordering::SeqCst);
            return Err(JobHostError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            });
        }

        match self.registrations.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(JobHostError::NotFound(name.to_string())),
        }
    }

    fn remaining_quota(&self) -> Option<u32> {
        match self.quota.load(Ordering::SeqCst) {
            QUOTA_UNKNOWN => None,
            remaining => Some(remaining),
        }
    }
}
