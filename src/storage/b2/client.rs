//! Backblaze B2 native API client
//!
//! Thin typed wrapper over the B2 endpoints used for chunked transfers:
//! single uploads, large-file (multipart) uploads, deletes and ranged reads.

use base64::Engine;
use reqwest::{Client, Response};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::errors::B2Error;
use super::types::*;

/// B2 API base URL for authorization (v3 for nested apiInfo structure)
const B2_AUTH_URL: &str = "https://api.backblazeb2.com/b2api/v3/b2_authorize_account";

/// HTTP client timeout
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum number of retries for retryable control-plane errors
const MAX_RETRIES: u32 = 3;

const CONTENT_TYPE: &str = "application/octet-stream";

/// Auth state that can be refreshed (interior mutability)
#[derive(Debug, Clone)]
struct AuthState {
    auth_token: String,
    api_url: String,
    download_url: String,
}

/// B2 API client bound to one bucket
#[derive(Clone)]
pub struct B2Client {
    http_client: Client,
    /// None until the first successful authorization
    auth_state: Arc<RwLock<Option<AuthState>>>,
    key_id: String,
    key: String,
    bucket_id: String,
}

impl B2Client {
    pub fn new(key_id: &str, key: &str, bucket_id: &str) -> Result<Self, B2Error> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| B2Error::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            auth_state: Arc::new(RwLock::new(None)),
            key_id: key_id.to_string(),
            key: key.to_string(),
            bucket_id: bucket_id.to_string(),
        })
    }

    pub fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    fn auth(&self) -> Result<AuthState, B2Error> {
        self.auth_state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(B2Error::Unauthorized)
    }

    /// Authorize (or re-authorize) the account and store the new token
    pub async fn authorize(&self) -> Result<(), B2Error> {
        let credentials = format!("{}:{}", self.key_id, self.key);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        let auth_header = format!("Basic {}", encoded);

        let response = self
            .http_client
            .get(B2_AUTH_URL)
            .header("Authorization", &auth_header)
            .send()
            .await?;
        let auth_response: AuthorizeAccountResponse = check(response).await?.json().await?;

        let api_url = auth_response.api_info.storage_api.api_url;
        let download_url = auth_response.api_info.storage_api.download_url;
        debug!(
            account = %auth_response.account_id,
            api_url = %api_url,
            download_url = %download_url,
            "B2 authorization successful"
        );

        *self.auth_state.write().unwrap_or_else(|e| e.into_inner()) = Some(AuthState {
            auth_token: auth_response.authorization_token,
            api_url,
            download_url,
        });
        Ok(())
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, B2Error>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, B2Error>>,
    {
        let backoff_ms = [500u64, 1000, 2000];
        let mut attempt = 0;

        loop {
            let e = match f().await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            if !e.is_retryable() || attempt >= MAX_RETRIES {
                error!(operation = operation, error = %e, "B2 operation failed");
                return Err(e);
            }

            if matches!(e, B2Error::AuthExpired) {
                warn!(operation = operation, "Auth expired, refreshing token...");
                if let Err(refresh_err) = self.authorize().await {
                    error!(error = %refresh_err, "Failed to refresh auth token");
                }
            }

            let delay = backoff_ms.get(attempt as usize).copied().unwrap_or(2000);
            attempt += 1;
            warn!(
                operation = operation,
                attempt = attempt,
                max = MAX_RETRIES,
                delay_ms = delay,
                error = %e,
                "Retrying B2 operation"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// POST a JSON body to `{api_url}/b2api/v2/{call}` and decode the reply
    async fn api_call<B, T>(&self, call: &str, body: B) -> Result<T, B2Error>
    where
        B: serde::Serialize,
        T: serde::de::DeserializeOwned,
    {
        let auth = self.auth()?;
        let url = format!("{}/b2api/v2/{}", auth.api_url, call);
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", &auth.auth_token)
            .json(&body)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Get an upload URL for single-shot uploads into the bucket
    pub async fn get_upload_url(&self) -> Result<UploadUrl, B2Error> {
        let upload_url: UploadUrl = self
            .with_retry("get_upload_url", || {
                self.api_call(
                    "b2_get_upload_url",
                    GetUploadUrlRequest {
                        bucket_id: &self.bucket_id,
                    },
                )
            })
            .await?;
        debug!(url = %upload_url.upload_url, "Got B2 upload URL");
        Ok(upload_url)
    }

    /// Upload a whole object to a previously fetched upload URL
    pub async fn upload_file(
        &self,
        upload_url: &str,
        token: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<B2File, B2Error> {
        let hash = crate::chunks::sha1_hex(data);
        let encoded_name = urlencoding::encode(file_name);

        info!(file = file_name, size = data.len(), "Uploading file to B2");

        let response = self
            .http_client
            .post(upload_url)
            .header("Authorization", token)
            .header("X-Bz-File-Name", encoded_name.as_ref())
            .header("Content-Type", CONTENT_TYPE)
            .header("Content-Length", data.len())
            .header("X-Bz-Content-Sha1", &hash)
            .body(data.to_vec())
            .send()
            .await?;
        let file: B2File = check(response).await?.json().await?;

        info!(file = file_name, file_id = %file.file_id, "File uploaded to B2");
        Ok(file)
    }

    /// Begin a large file; the returned file ID addresses its parts
    pub async fn start_large_file(&self, file_name: &str) -> Result<B2File, B2Error> {
        let file: B2File = self
            .with_retry("start_large_file", || {
                self.api_call(
                    "b2_start_large_file",
                    StartLargeFileRequest {
                        bucket_id: &self.bucket_id,
                        file_name,
                        content_type: CONTENT_TYPE,
                    },
                )
            })
            .await?;
        info!(file = file_name, file_id = %file.file_id, "Started B2 large file");
        Ok(file)
    }

    /// Fetch a part upload URL; each concurrent part upload needs its own
    pub async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadUrl, B2Error> {
        self.with_retry("get_upload_part_url", || {
            self.api_call("b2_get_upload_part_url", FileIdRequest { file_id })
        })
        .await
    }

    /// Upload one part of a large file (part numbers are 1-based)
    pub async fn upload_part(
        &self,
        part_url: &UploadUrl,
        part_number: u64,
        sha1: &str,
        data: &[u8],
    ) -> Result<UploadPartResponse, B2Error> {
        debug!(part = part_number, size = data.len(), "Uploading B2 part");

        let response = self
            .http_client
            .post(&part_url.upload_url)
            .header("Authorization", &part_url.authorization_token)
            .header("X-Bz-Part-Number", part_number)
            .header("Content-Length", data.len())
            .header("X-Bz-Content-Sha1", sha1)
            .body(data.to_vec())
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Assemble a large file from its part checksums, ordered by part number
    pub async fn finish_large_file(
        &self,
        file_id: &str,
        part_sha1_array: &[String],
    ) -> Result<B2File, B2Error> {
        let file: B2File = self
            .with_retry("finish_large_file", || {
                self.api_call(
                    "b2_finish_large_file",
                    FinishLargeFileRequest {
                        file_id,
                        part_sha1_array,
                    },
                )
            })
            .await?;
        info!(
            file_id = %file.file_id,
            parts = part_sha1_array.len(),
            size = file.content_length,
            "Finished B2 large file"
        );
        Ok(file)
    }

    pub async fn cancel_large_file(&self, file_id: &str) -> Result<B2File, B2Error> {
        let file: B2File = self
            .with_retry("cancel_large_file", || {
                self.api_call("b2_cancel_large_file", FileIdRequest { file_id })
            })
            .await?;
        info!(file_id = file_id, "Cancelled B2 large file");
        Ok(file)
    }

    /// Delete a file version from B2 (permanent delete)
    pub async fn delete_file_version(&self, file_name: &str, file_id: &str) -> Result<(), B2Error> {
        info!(file = file_name, file_id = file_id, "Deleting file from B2");
        let _: serde_json::Value = self
            .with_retry("delete_file_version", || {
                self.api_call(
                    "b2_delete_file_version",
                    DeleteFileVersionRequest { file_name, file_id },
                )
            })
            .await?;
        Ok(())
    }

    /// Download the inclusive byte range `start..=end` of a file by ID
    pub async fn download_file_by_id(
        &self,
        file_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, B2Error> {
        self.with_retry("download_file_by_id", || async move {
            let auth = self.auth()?;
            let url = format!("{}/b2api/v2/b2_download_file_by_id", auth.download_url);
            let response = self
                .http_client
                .get(&url)
                .query(&[("fileId", file_id)])
                .header("Authorization", &auth.auth_token)
                .header("Range", range_header(start, end))
                .send()
                .await?;
            let bytes = check(response).await?.bytes().await?;
            debug!(file_id = file_id, start = start, end = end, size = bytes.len(), "Downloaded range from B2");
            Ok(bytes.to_vec())
        })
        .await
    }
}

/// Map a non-success response to a typed error
async fn check(response: Response) -> Result<Response, B2Error> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(B2Error::from_status(status, &body))
}

pub(crate) fn range_header(start: u64, end: u64) -> String {
    format!("bytes={}-{}", start, end)
}
