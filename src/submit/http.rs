//! HTTP ingestion endpoint of the target platform

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::models::stix::StixBundle;
use crate::retry::classify_status;
use crate::submit::{BundleAck, PlatformSink};

#[derive(Debug, Default, Deserialize)]
struct IngestResponse {
    #[serde(default)]
    accepted: Option<Vec<String>>,
    #[serde(default)]
    rejected: Vec<Rejection>,
}

#[derive(Debug, Deserialize)]
struct Rejection {
    id: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Posts bundles as JSON to the platform's bundle import endpoint
pub struct HttpPlatformSink {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpPlatformSink {
    pub fn new(endpoint: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("malpkg-intel/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }
}

fn ack_from_response(bundle: &StixBundle, response: IngestResponse) -> BundleAck {
    if !response.rejected.is_empty() {
        for rejection in &response.rejected {
            tracing::warn!(
                object_id = %rejection.id,
                reason = rejection.reason.as_deref().unwrap_or("unspecified"),
                "Platform rejected object"
            );
        }
        let rejected: HashSet<&str> = response.rejected.iter().map(|r| r.id.as_str()).collect();
        let accepted = bundle
            .object_ids()
            .filter(|id| !rejected.contains(id))
            .map(str::to_string)
            .collect();
        return BundleAck::Partial { accepted };
    }

    match response.accepted {
        Some(ids) => BundleAck::Partial {
            accepted: ids.into_iter().collect(),
        },
        None => BundleAck::All,
    }
}

#[async_trait]
impl PlatformSink for HttpPlatformSink {
    fn name(&self) -> &'static str {
        "http_platform"
    }

    async fn send_bundle(&self, bundle: &StixBundle) -> Result<BundleAck> {
        let mut request = self.client.post(self.endpoint.clone()).json(bundle);

        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .context("Failed to send bundle to platform")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read platform response")?;

        if !status.is_success() {
            return Err(classify_status(status, &body, "Platform ingest"));
        }

        if body.trim().is_empty() {
            return Ok(BundleAck::All);
        }

        let parsed: IngestResponse =
            serde_json::from_str(&body).context("Failed to parse platform response")?;
        Ok(ack_from_response(bundle, parsed))
    }
}
