//! HTTP recovery issuer
//!
//! `POST {base}/v1/{api_path}/recovery/initiate_request?request_id=..[&after=..][&node_id=..]`
//! with the access token in `x-access-token`. Any 2xx response means the
//! request was accepted; the replay then arrives on the feed and ends with a
//! snapshot-complete message carrying the same request id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, info, warn};

use uf_common::{ProducerInfo, RequestId};
use uf_config::ApiSettings;

use crate::error::FeedError;
use crate::recovery::RecoveryIssuer;
use crate::Result;

pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

pub struct HttpRecoveryIssuer {
    client: Client,
    base_url: String,
    access_token: String,
    node_id: Option<i32>,
    next_request_id: AtomicU64,
}

impl HttpRecoveryIssuer {
    pub fn new(settings: &ApiSettings, node_id: Option<i32>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .connect_timeout(Duration::from_secs(settings.timeout_secs.min(10)))
            .build()?;

        // Seeded from the clock so ids keep increasing across restarts
        let seed = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(1);

        info!(
            base_url = %settings.base_url,
            node_id = ?node_id,
            timeout_secs = settings.timeout_secs,
            "Recovery API client initialized"
        );

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            access_token: settings.access_token.clone(),
            node_id,
            next_request_id: AtomicU64::new(seed),
        })
    }

    async fn initiate(
        &self,
        producer: &ProducerInfo,
        request_id: RequestId,
        after: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let url = format!(
            "{}/v1/{}/recovery/initiate_request",
            self.base_url, producer.api_path
        );

        let mut query: Vec<(&str, String)> = vec![("request_id", request_id.to_string())];
        if let Some(after) = after {
            query.push(("after", after.timestamp_millis().to_string()));
        }
        if let Some(node_id) = self.node_id {
            query.push(("node_id", node_id.to_string()));
        }

        debug!(
            producer_id = producer.id,
            request_id,
            url = %url,
            "Sending recovery request"
        );

        let response = self
            .client
            .post(&url)
            .query(&query)
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            producer_id = producer.id,
            request_id,
            status_code = status.as_u16(),
            "Recovery request rejected"
        );
        Err(FeedError::Recovery(format!(
            "{} rejected recovery request {}: {} {}",
            producer.name,
            request_id,
            status.as_u16(),
            body.trim()
        )))
    }
}

#[async_trait]
impl RecoveryIssuer for HttpRecoveryIssuer {
    fn next_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn issue_recovery(&self, producer: &ProducerInfo, request_id: RequestId, after: DateTime<Utc>) -> Result<()> {
        self.initiate(producer, request_id, Some(after)).await
    }

    async fn issue_full_snapshot(&self, producer: &ProducerInfo, request_id: RequestId) -> Result<()> {
        self.initiate(producer, request_id, None).await
    }
}
