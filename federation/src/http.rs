//! HTTP client for the federation gateway

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::NaiveDate;
use log::debug;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

use crate::config::GatewayConfig;
use crate::error::{to_protocol_error, FederationError, Result};
use crate::gateway::{
    BatchUploadResponse, CallbackRegistration, DownloadedBatch, FederationGateway, SignedBatch, WireBatch,
    BATCH_SIGNATURE_HEADER, BATCH_TAG_HEADER, NEXT_BATCH_TAG_HEADER,
};

/// Gateway reached over HTTP
pub struct HttpGateway {
    /// Base URL for the gateway API
    base_url: String,

    /// HTTP client
    client: Client,

    /// Timeout for requests
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| FederationError::Config(e.to_string()))?;
        Ok(HttpGateway {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            timeout: config.request_timeout,
        })
    }

    async fn failure(response: Response) -> FederationError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            FederationError::Transport(format!("{}: {}", status, body))
        } else if status.is_client_error() {
            FederationError::Rejection(format!("{}: {}", status, body))
        } else {
            FederationError::Protocol(format!("Unexpected status {}: {}", status, body))
        }
    }
}

fn header(response: &Response, name: &str) -> Result<Option<String>> {
    match response.headers().get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.to_string()))
            .map_err(|e| FederationError::Protocol(format!("Invalid {} header: {}", name, e))),
    }
}

#[async_trait]
impl FederationGateway for HttpGateway {
    async fn list_callbacks(&self) -> Result<Vec<CallbackRegistration>> {
        let url = format!("{}/diagnosiskeys/callback", self.base_url);
        let response = self.client.get(&url).timeout(self.timeout).send().await?;

        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        let callbacks: Vec<CallbackRegistration> = response.json().await?;
        Ok(callbacks)
    }

    async fn put_callback(&self, registration: &CallbackRegistration) -> Result<()> {
        let url = format!("{}/diagnosiskeys/callback/{}", self.base_url, registration.id);
        let response = self
            .client
            .put(&url)
            .query(&[("url", registration.url.as_str())])
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }
        Ok(())
    }

    async fn upload_batch(&self, batch: &SignedBatch) -> Result<BatchUploadResponse> {
        let url = format!("{}/diagnosiskeys/upload", self.base_url);
        debug!("Uploading batch {} with {} keys", batch.batch_tag, batch.keys.len());
        let response = self
            .client
            .post(&url)
            .header(BATCH_TAG_HEADER, &batch.batch_tag)
            .header(BATCH_SIGNATURE_HEADER, batch.signature_base64())
            .json(&batch.to_wire())
            .timeout(self.timeout)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(BatchUploadResponse::all_accepted(batch.keys.len())),
            StatusCode::MULTI_STATUS => Ok(response.json().await?),
            StatusCode::CONFLICT => Ok(BatchUploadResponse::all_present(batch.keys.len())),
            _ => Err(Self::failure(response).await),
        }
    }

    async fn download_batch(&self, date: NaiveDate, batch_tag: Option<&str>) -> Result<Option<DownloadedBatch>> {
        let url = format!("{}/diagnosiskeys/download/{}", self.base_url, date.format("%Y-%m-%d"));
        let mut request = self.client.get(&url).timeout(self.timeout);
        if let Some(tag) = batch_tag {
            request = request.header(BATCH_TAG_HEADER, tag);
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!("No batch for {} ({:?})", date, batch_tag);
                return Ok(None);
            }
            status if !status.is_success() => return Err(Self::failure(response).await),
            _ => {}
        }

        let tag = header(&response, BATCH_TAG_HEADER)?
            .ok_or_else(|| FederationError::Protocol("Download response without batch tag".to_string()))?;
        if let Some(requested) = batch_tag {
            if requested != tag {
                return Err(FederationError::Protocol(format!(
                    "Requested batch {} but gateway answered with {}",
                    requested, tag
                )));
            }
        }
        let next_batch_tag = header(&response, NEXT_BATCH_TAG_HEADER)?.filter(|t| !t.is_empty() && t != "null");
        let signature = header(&response, BATCH_SIGNATURE_HEADER)?
            .map(|s| STANDARD.decode(s).map_err(to_protocol_error))
            .transpose()?;
        let body: WireBatch = response.json().await?;

        Ok(Some(DownloadedBatch {
            batch_tag: tag,
            next_batch_tag,
            keys: body.keys,
            signature,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{key, signer};
    use mockito::{Matcher, Server};

    fn gateway(server: &Server) -> HttpGateway {
        HttpGateway::new(&GatewayConfig {
            base_url: server.url(),
            ..Default::default()
        })
        .unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 9, 1).unwrap()
    }

    fn batch() -> SignedBatch {
        SignedBatch::sign(
            "2020-9-1-abc-1".to_string(),
            vec![key(1, "DE", &["DE"], 1), key(2, "DE", &["DE"], 1)],
            &signer(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_multi_status() {
        let mut server = Server::new_async().await;
        let batch = batch();
        let mock = server
            .mock("POST", "/diagnosiskeys/upload")
            .match_header("batchTag", "2020-9-1-abc-1")
            .match_header("batchSignature", batch.signature_base64().as_str())
            .match_body(Matcher::Regex(r#""keyData""#.to_string()))
            .with_status(207)
            .with_body(r#"{"201": [0], "400": [1]}"#)
            .create_async()
            .await;

        let response = gateway(&server).upload_batch(&batch).await.unwrap();
        assert_eq!(response.status201, vec![0]);
        assert_eq!(response.status400, vec![1]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_status_mapping() {
        let mut server = Server::new_async().await;
        let gateway = gateway(&server);

        let created = server.mock("POST", "/diagnosiskeys/upload").with_status(201).create_async().await;
        assert_eq!(gateway.upload_batch(&batch()).await.unwrap(), BatchUploadResponse::all_accepted(2));
        created.remove_async().await;

        let conflict = server.mock("POST", "/diagnosiskeys/upload").with_status(409).create_async().await;
        assert_eq!(gateway.upload_batch(&batch()).await.unwrap(), BatchUploadResponse::all_present(2));
        conflict.remove_async().await;

        let rejected = server.mock("POST", "/diagnosiskeys/upload").with_status(400).create_async().await;
        assert!(matches!(gateway.upload_batch(&batch()).await, Err(FederationError::Rejection(_))));
        rejected.remove_async().await;

        server.mock("POST", "/diagnosiskeys/upload").with_status(503).create_async().await;
        let err = gateway.upload_batch(&batch()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_download_reads_tags_and_keys() {
        let mut server = Server::new_async().await;
        let wire = WireBatch {
            keys: vec![(&key(5, "FR", &["DE"], 1)).into()],
        };
        server
            .mock("GET", "/diagnosiskeys/download/2020-09-01")
            .match_header("batchTag", "first")
            .with_status(200)
            .with_header("batchTag", "first")
            .with_header("nextBatchTag", "second")
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_string(&wire).unwrap())
            .create_async()
            .await;

        let batch = gateway(&server).download_batch(date(), Some("first")).await.unwrap().unwrap();
        assert_eq!(batch.batch_tag, "first");
        assert_eq!(batch.next_batch_tag.as_deref(), Some("second"));
        assert_eq!(batch.keys, wire.keys);
        assert!(batch.signature.is_none());
    }

    #[tokio::test]
    async fn test_download_missing_and_malformed() {
        let mut server = Server::new_async().await;
        let gateway = gateway(&server);

        let missing = server
            .mock("GET", "/diagnosiskeys/download/2020-09-01")
            .with_status(404)
            .create_async()
            .await;
        assert!(gateway.download_batch(date(), None).await.unwrap().is_none());
        missing.remove_async().await;

        server
            .mock("GET", "/diagnosiskeys/download/2020-09-01")
            .with_status(200)
            .with_body(r#"{"keys": []}"#)
            .create_async()
            .await;
        assert!(matches!(
            gateway.download_batch(date(), None).await,
            Err(FederationError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_download_rejects_other_batch_tag() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/diagnosiskeys/download/2020-09-01")
            .match_header("batchTag", "first")
            .with_status(200)
            .with_header("batchTag", "second")
            .with_header("content-type", "application/json")
            .with_body(r#"{"keys": []}"#)
            .create_async()
            .await;

        let result = gateway(&server).download_batch(date(), Some("first")).await;
        assert!(matches!(result, Err(FederationError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_callbacks() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/diagnosiskeys/callback")
            .with_status(200)
            .with_body(r#"[{"id": "a", "url": "https://peer/cb"}]"#)
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/diagnosiskeys/callback/b")
            .match_query(Matcher::UrlEncoded("url".into(), "https://peer/other".into()))
            .with_status(200)
            .create_async()
            .await;

        let gateway = gateway(&server);
        let callbacks = gateway.list_callbacks().await.unwrap();
        assert_eq!(callbacks[0].url, "https://peer/cb");
        gateway
            .put_callback(&CallbackRegistration {
                id: "b".to_string(),
                url: "https://peer/other".to_string(),
            })
            .await
            .unwrap();
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        let gateway = HttpGateway::new(&GatewayConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(500),
        })
        .unwrap();
        assert!(gateway.list_callbacks().await.unwrap_err().is_transient());
    }
}
