use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;

use crate::{strip_public_base, BlobStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// S3-compatible blob store over plain signed HTTP. Works against AWS
/// S3, MinIO and friends; the public URL prefix is configured
/// separately from the API endpoint so a CDN can front the bucket.
pub struct S3BlobStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    public_base_url: String,
}

impl S3BlobStore {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        region: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            region: region.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    /// Build a SigV4-signed request. The payload hash covers `body`, so
    /// a partially transmitted upload is rejected by the store rather
    /// than becoming visible.
    fn signed_request(
        &self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<reqwest::Request> {
        let identity: Identity = Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            None,
            None,
            "mentora-blob",
        )
        .into();

        let signing_params: aws_sigv4::http_request::SigningParams = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name("s3")
            .time(SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .context("build signing params")?
            .into();

        let signable = SignableRequest::new(
            method,
            url,
            headers.iter().copied(),
            SignableBody::Bytes(&body),
        )
        .context("build signable request")?;

        let (instructions, _signature) =
            sign(signable, &signing_params).context("sign request")?.into_parts();

        let mut builder = http::Request::builder().method(method).uri(url);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut request = builder.body(body)?;
        instructions.apply_to_request_http1x(&mut request);

        reqwest::Request::try_from(request).map_err(Into::into)
    }

    async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let response = self.client.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow!("blob store returned HTTP {status}: {body}"))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(&self, key: &str, bytes: &[u8], mime: &str) -> Result<String> {
        let url = self.object_url(key);
        let request =
            self.signed_request("PUT", &url, &[("content-type", mime)], bytes.to_vec())?;
        self.send(request).await?;
        tracing::debug!(key, size = bytes.len(), "blob uploaded");
        Ok(self.public_url(key))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(key);
        let request = self.signed_request("GET", &url, &[], Vec::new())?;
        let response = self.send(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(key);
        let request = self.signed_request("DELETE", &url, &[], Vec::new())?;
        let response = self.client.execute(request).await?;
        // 404 counts as deleted; delete is idempotent.
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(anyhow!("blob delete failed with HTTP {status}: {body}"))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    fn url_to_key(&self, url: &str) -> Option<String> {
        strip_public_base(&self.public_base_url, url).map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(endpoint: &str) -> S3BlobStore {
        S3BlobStore::new(
            endpoint,
            "mentora",
            "us-east-1",
            "AKIDEXAMPLE",
            "secret",
            "https://cdn.example.com",
        )
    }

    #[tokio::test]
    async fn upload_puts_signed_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/mentora/knowledge_documents/a.txt"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = store(&server.uri());
        let url = store
            .upload("knowledge_documents/a.txt", b"hello", "text/plain")
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example.com/knowledge_documents/a.txt");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let auth = requests[0]
            .headers
            .get("authorization")
            .expect("authorization header");
        assert!(auth.to_str().unwrap().starts_with("AWS4-HMAC-SHA256"));
    }

    #[tokio::test]
    async fn download_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mentora/k/v.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let store = store(&server.uri());
        let bytes = store.download("k/v.bin").await.unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn delete_treats_missing_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/mentora/k/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store(&server.uri());
        store.delete("k/gone").await.unwrap();
    }

    #[tokio::test]
    async fn server_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mentora/k/x"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = store(&server.uri());
        let err = store.download("k/x").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn url_reversal_only_under_public_base() {
        let store = store("http://localhost:9000");
        assert_eq!(
            store.url_to_key("https://cdn.example.com/forum_images/i.png"),
            Some("forum_images/i.png".to_string())
        );
        assert_eq!(store.url_to_key("http://localhost:9000/mentora/forum_images/i.png"), None);
    }
}
