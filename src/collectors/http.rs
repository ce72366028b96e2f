//! Paginated JSON advisory feed over HTTP

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::collectors::{FeedPage, FeedSource};
use crate::models::RawAdvisory;
use crate::retry::classify_status;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PageBody {
    Wrapped {
        records: Vec<Value>,
        #[serde(default)]
        next_offset: Option<u64>,
    },
    Bare(Vec<Value>),
}

/// Feed served as `GET <url>?offset=N&limit=M`
pub struct HttpFeedSource {
    client: Client,
    feed_url: Url,
}

impl HttpFeedSource {
    pub fn new(feed_url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("malpkg-intel/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, feed_url })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    fn name(&self) -> &'static str {
        "http_feed"
    }

    async fn fetch_page(&self, offset: u64, limit: usize) -> Result<FeedPage> {
        let response = self
            .client
            .get(self.feed_url.clone())
            .query(&[("offset", offset.to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .context("Failed to fetch advisory page")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, "Advisory feed"));
        }

        let body: PageBody = response
            .json()
            .await
            .context("Failed to parse advisory page")?;

        // A server-reported cursor wins over the short-page rule, so a server
        // that caps `limit` does not end the sweep early.
        let (values, exhausted, has_more) = match body {
            PageBody::Wrapped {
                records,
                next_offset: Some(next),
            } => (records, next <= offset, next > offset),
            PageBody::Wrapped {
                records,
                next_offset: None,
            }
            | PageBody::Bare(records) => (records, false, false),
        };

        let records = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| RawAdvisory::from_value(format!("offset:{}", offset + i as u64), value))
            .collect();

        Ok(FeedPage {
            records,
            exhausted,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Permanent;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn source_for(server: &MockServer) -> HttpFeedSource {
        let url = Url::parse(&format!("{}/advisories", server.uri())).unwrap();
        HttpFeedSource::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetches_wrapped_page_with_offset_and_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/advisories"))
            .and(query_param("offset", "10"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [
                    {"package": "left-pad-evil", "ecosystem": "npm",
                     "hashes": [{"algorithm": "sha256", "digest": "abc123"}]},
                    "not an object"
                ]
            })))
            .mount(&server)
            .await;

        let page = source_for(&server).await.fetch_page(10, 2).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].package.as_deref(), Some("left-pad-evil"));
        assert_eq!(page.records[0].locator, "offset:10");
        assert!(page.records[1].parse_error.is_some());
        assert_eq!(page.records[1].locator, "offset:11");
        assert!(!page.exhausted);
    }

    #[tokio::test]
    async fn test_next_offset_keeps_capped_feed_going() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [{"package": "a"}, {"package": "b"}],
                "next_offset": 2
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [{"package": "c"}],
                "next_offset": null
            })))
            .mount(&server)
            .await;

        let source = source_for(&server).await;

        let page = source.fetch_page(0, 5000).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.has_more);
        assert!(!page.exhausted);

        let page = source.fetch_page(2, 5000).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_accepts_bare_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/advisories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let page = source_for(&server).await.fetch_page(0, 50).await.unwrap();
        assert!(page.records.is_empty());
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = source_for(&server).await.fetch_page(0, 5).await.unwrap_err();
        assert!(err.downcast_ref::<Permanent>().is_some());
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = source_for(&server).await.fetch_page(0, 5).await.unwrap_err();
        assert!(err.downcast_ref::<Permanent>().is_none());
    }
}
