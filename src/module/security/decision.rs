//! External policy decision service client
//!
//! The service receives `POST {"input": {...}}` and answers `{"result": bool}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::config::DecisionServiceConfig;
use crate::module::security::canary::Variant;
use crate::module::security::permissions::CapabilityKind;
use crate::module::traits::ResourceLimits;

/// Facts sent to the decision service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    pub module: String,
    pub sha256: String,
    pub caps: Vec<CapabilityKind>,
    pub limits: ResourceLimits,
    pub principal: String,
    pub signer: Option<String>,
    pub variant: Variant,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct DecisionRequest<'a> {
    input: &'a DecisionInput,
}

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    #[serde(default)]
    result: Option<bool>,
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision service request failed: {0}")]
    Transport(String),
    #[error("decision service returned status {0}")]
    Status(u16),
    #[error("decision service returned no boolean result")]
    MissingResult,
}

/// A source of external allow/deny decisions
#[async_trait]
pub trait DecisionClient: Send + Sync {
    async fn decide(&self, input: &DecisionInput) -> Result<bool, DecisionError>;
}

/// Decision service reached over HTTP
pub struct HttpDecisionClient {
    client: reqwest::Client,
    url: String,
}

impl HttpDecisionClient {
    pub fn new(config: &DecisionServiceConfig) -> Result<Self, DecisionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| DecisionError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl DecisionClient for HttpDecisionClient {
    async fn decide(&self, input: &DecisionInput) -> Result<bool, DecisionError> {
        let response = self
            .client
            .post(&self.url)
            .json(&DecisionRequest { input })
            .send()
            .await
            .map_err(|e| DecisionError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DecisionError::Status(status.as_u16()));
        }
        let body: DecisionResponse = response
            .json()
            .await
            .map_err(|e| DecisionError::Transport(e.to_string()))?;
        body.result.ok_or(DecisionError::MissingResult)
    }
}
