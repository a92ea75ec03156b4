//! Source retrieval from the upstream file-management service.

use async_trait::async_trait;
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE},
};
use bytes::BytesMut;
use reqwest::{StatusCode, header};
use tracing::debug;

use crate::application::sandbox::{FetchError, SourceFetcher, SourcePackage};
use crate::config::SourceSettings;

use super::error::InfraError;

/// Fetches `GET {endpoint}/{source_id}/content` and checks the `ETag` against the requested
/// checksum.
#[derive(Debug, Clone)]
pub struct HttpSourceFetcher {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    verify_checksum: bool,
    max_bytes: u64,
}

impl HttpSourceFetcher {
    pub fn new(settings: &SourceSettings) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            token: settings.token.clone(),
            verify_checksum: settings.verify_checksum,
            max_bytes: settings.max_bytes.get(),
        })
    }

    fn content_url(&self, source_id: &str) -> String {
        format!(
            "{}/{}/content",
            self.endpoint,
            urlencoding::encode(source_id)
        )
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, source_id: &str, checksum: &str) -> Result<SourcePackage, FetchError> {
        let url = self.content_url(source_id);
        let mut request = self.client.get(&url);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let mut response = request
            .send()
            .await
            .map_err(|err| FetchError::Unavailable(err.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::Unauthorized);
            }
            status => {
                return Err(FetchError::Unavailable(format!(
                    "upstream responded with {status}"
                )));
            }
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if self.verify_checksum && !checksum_matches(checksum, &etag) {
            return Err(FetchError::ChecksumMismatch {
                expected: checksum.to_string(),
                actual: etag,
            });
        }

        let limit = self.max_bytes;
        if response.content_length().is_some_and(|length| length > limit) {
            return Err(FetchError::TooLarge { limit });
        }

        // Content-Length may be absent or wrong; count what actually arrives.
        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| FetchError::Unavailable(err.to_string()))?
        {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        let bytes = body.freeze();

        debug!(
            target = "texcompiler::fetcher",
            op = "fetcher::fetch",
            source_id,
            etag = %etag,
            size_bytes = bytes.len(),
            "Fetched source package"
        );

        Ok(SourcePackage {
            source_id: source_id.to_string(),
            etag,
            bytes,
        })
    }
}

/// The expected checksum is either the raw `ETag` or its base64 encoding.
fn checksum_matches(expected: &str, etag: &str) -> bool {
    if etag.is_empty() {
        return false;
    }
    if expected == etag {
        return true;
    }
    [STANDARD.decode(expected), URL_SAFE.decode(expected)]
        .into_iter()
        .flatten()
        .any(|decoded| decoded == etag.as_bytes())
}
