//! REST compute-provider client.
//!
//! Talks to the provider's instance API:
//! - `GET  /v1/instances?fleet={fleet}` — list fleet-tagged instances
//! - `POST /v1/instances` — provision one instance
//! - `DELETE /v1/instances/{id}` — delete (404 treated as already gone)
//! - `GET  /v1/instances/{id}/health` — health probe

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::CloudError;
use crate::fleet::{HealthState, RunnerInstance, RunnerSpec, RunnerState};

use super::CloudInstanceManager;

pub struct HttpCloud {
    client: reqwest::Client,
    base_url: String,
    fleet: String,
}

impl HttpCloud {
    pub fn new(config: &Config) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            config.cloud_api_token
        ))
        .expect("Invalid cloud API token");
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .default_headers(headers)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.cloud_api_url.trim_end_matches('/').to_string(),
            fleet: config.fleet_name.clone(),
        }
    }
}

#[async_trait]
impl CloudInstanceManager for HttpCloud {
    async fn list(&self) -> Result<Vec<RunnerInstance>, CloudError> {
        let url = format!("{}/v1/instances", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("fleet", self.fleet.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CloudError::Protocol(format!(
                "list returned {}",
                response.status()
            )));
        }

        let records: Vec<InstanceRecord> = response.json().await?;
        let mut instances = Vec::with_capacity(records.len());
        for record in records {
            match record.runner_state() {
                Some(state) => instances.push(RunnerInstance {
                    id: record.id,
                    name: record.name,
                    state,
                    created_at: record.created_at,
                }),
                None => {
                    // Transient provider state; skip rather than fail the list.
                    debug!(
                        instance_id = %record.id,
                        provider_state = %record.state,
                        "Skipping instance in transient state"
                    );
                }
            }
        }
        Ok(instances)
    }

    async fn create(&self, spec: &RunnerSpec) -> Result<RunnerInstance, CloudError> {
        let url = format!("{}/v1/instances", self.base_url);
        let request = CreateInstanceRequest {
            fleet: &self.fleet,
            name: &spec.name,
            image: &spec.image,
            cpu_cores: spec.cpu_cores,
            memory_mb: spec.memory_mb,
            registration_token: &spec.registration_token,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        match response.status() {
            status if status.is_success() => {
                let record: InstanceRecord = response.json().await?;
                Ok(RunnerInstance {
                    state: record.runner_state().unwrap_or(RunnerState::Provisioning),
                    id: record.id,
                    name: record.name,
                    created_at: record.created_at,
                })
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => Err(CloudError::Quota),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(CloudError::Provision(format!("{status} - {body}")))
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<(), CloudError> {
        let url = format!("{}/v1/instances/{}", self.base_url, id);
        let response = self.client.delete(&url).send().await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // Already gone counts as deleted.
            StatusCode::NOT_FOUND => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(instance_id = %id, status = %status, "Instance delete failed");
                Err(CloudError::Provision(format!("{status} - {body}")))
            }
        }
    }

    async fn health_check(&self, id: &str) -> Result<HealthState, CloudError> {
        let url = format!("{}/v1/instances/{}/health", self.base_url, id);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            status if status.is_success() => {
                let health: HealthRecord = response.json().await?;
                Ok(health.state)
            }
            StatusCode::NOT_FOUND => Err(CloudError::NotFound(id.to_string())),
            status => Err(CloudError::Protocol(format!("health returned {status}"))),
        }
    }
}

/// Instance record as the provider reports it.
#[derive(Debug, Deserialize)]
struct InstanceRecord {
    id: String,
    name: String,
    state: String,
    created_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Map provider states onto runner states; `None` for transient ones.
    fn runner_state(&self) -> Option<RunnerState> {
        match self.state.as_str() {
            "pending" | "provisioning" | "starting" => Some(RunnerState::Provisioning),
            "running" => Some(RunnerState::Idle),
            "stopping" | "shutting-down" => Some(RunnerState::Stopping),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateInstanceRequest<'a> {
    fleet: &'a str,
    name: &'a str,
    image: &'a str,
    cpu_cores: u32,
    memory_mb: u64,
    registration_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct HealthRecord {
    state: HealthState,
}
