use serde::{Deserialize, Serialize};

use crate::config::join_url;
use crate::constants::HEALTH_PATH;
use crate::types::{CoachError, ObservedError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LivenessResponse {
    pub status: String,
}

impl LivenessResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Asks the coach service whether it is up.
pub async fn probe(client: &reqwest::Client, base_url: &str) -> Result<LivenessResponse> {
    let url = join_url(base_url, HEALTH_PATH);
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ObservedError::from(CoachError::Network(e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = match response.text().await {
            Ok(text) => text,
            Err(_) => String::new(),
        };
        return Err(CoachError::Upstream(status.as_u16(), body).into());
    }

    let liveness = response
        .json::<LivenessResponse>()
        .await
        .map_err(|e| ObservedError::from(CoachError::Network(e)))?;
    tracing::debug!("Health probe {}: {}", url, liveness.status);
    Ok(liveness)
}
