use super::{CloudProvider, CloudStore, UploadRequest};
use crate::config::{expand_home, CloudUploadConfig};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
/// Resumable chunks other than the last must be a multiple of this.
const CHUNK_ALIGN: usize = 256 * 1024;
const METADATA_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: String,
}

/// Reads an OAuth access token from a file holding either the bare token or
/// a JSON object with an `access_token` field.
pub fn read_access_token(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        BackupError::Config(format!("cannot read credentials file {:?}: {}", path, e))
    })?;
    let trimmed = contents.trim();

    let token = if trimmed.starts_with('{') {
        serde_json::from_str::<TokenFile>(trimmed)?.access_token
    } else {
        trimmed.to_string()
    };

    if token.is_empty() {
        return Err(BackupError::Config(format!(
            "credentials file {:?} holds no access token",
            path
        )));
    }
    Ok(token)
}

fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn folder_query(name: &str, parent_id: Option<&str>) -> String {
    let mut query = format!(
        "name = '{}' and mimeType = '{}' and trashed = false",
        escape_query_value(name),
        FOLDER_MIME
    );
    if let Some(parent) = parent_id {
        query.push_str(&format!(" and '{}' in parents", escape_query_value(parent)));
    }
    query
}

fn content_range(offset: u64, len: usize, total: u64) -> String {
    if len == 0 {
        format!("bytes */{}", total)
    } else {
        format!("bytes {}-{}/{}", offset, offset + len as u64 - 1, total)
    }
}

/// Bytes the server has committed, from a 308 `Range: bytes=0-N` header.
fn committed_bytes(range: Option<&str>) -> Option<u64> {
    let end = range?.trim().strip_prefix("bytes=")?.split('-').nth(1)?;
    end.trim().parse::<u64>().ok().map(|n| n + 1)
}

fn aligned_chunk_size(requested: usize) -> usize {
    (requested.max(CHUNK_ALIGN) / CHUNK_ALIGN) * CHUNK_ALIGN
}

fn backoff(retry: u32) -> Duration {
    Duration::from_secs(1u64 << retry.min(5)).min(MAX_BACKOFF)
}

async fn error_from_response(response: reqwest::Response, what: &str) -> BackupError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    BackupError::cloud(Some(status), format!("{} failed: {} - {}", what, status, text))
}

/// Reads up to `want` more bytes from a blocking source on the blocking pool.
async fn read_more(
    source: Box<dyn Read + Send>,
    want: usize,
) -> Result<(Box<dyn Read + Send>, Vec<u8>)> {
    tokio::task::spawn_blocking(move || {
        let mut source = source;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BackupError::Io(e)),
            }
        }
        buf.truncate(filled);
        Ok((source, buf))
    })
    .await?
}

enum ChunkReply {
    /// 308: the server wants more, having committed this many bytes.
    Continue(Option<u64>),
    Done(String),
}

/// Google Drive v3 over plain REST.
pub struct DriveClient {
    client: Client,
    token: String,
}

impl DriveClient {
    pub fn new(token: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent("TLM-Remote-Backup/1.0")
            // resumable uploads answer 308 without a Location
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, token })
    }

    pub fn from_credentials_file(path: &Path) -> Result<Self> {
        Self::new(read_access_token(path)?)
    }

    async fn start_session(&self, request: &UploadRequest) -> Result<String> {
        let url = format!(
            "{}/files?uploadType=resumable&supportsAllDrives=true",
            DRIVE_UPLOAD_BASE
        );
        let metadata = serde_json::json!({
            "name": request.name,
            "parents": [request.folder_id],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("X-Upload-Content-Type", &request.mime_type)
            .header("X-Upload-Content-Length", request.size.to_string())
            .timeout(METADATA_TIMEOUT)
            .json(&metadata)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, "Starting resumable upload").await);
        }

        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackupError::cloud(None, "resumable upload returned no session URI"))
    }

    async fn put_chunk(
        &self,
        session_uri: &str,
        chunk: &[u8],
        offset: u64,
        request: &UploadRequest,
    ) -> Result<ChunkReply> {
        let response = self
            .client
            .put(session_uri)
            .bearer_auth(&self.token)
            .header(
                reqwest::header::CONTENT_RANGE,
                content_range(offset, chunk.len(), request.size),
            )
            .timeout(request.timeout)
            .body(chunk.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PERMANENT_REDIRECT {
            let range = response
                .headers()
                .get(reqwest::header::RANGE)
                .and_then(|v| v.to_str().ok());
            return Ok(ChunkReply::Continue(committed_bytes(range)));
        }
        if status.is_success() {
            let file: DriveFile = response.json().await?;
            return Ok(ChunkReply::Done(file.id));
        }
        Err(error_from_response(response, "Uploading chunk").await)
    }

    /// Sends one chunk, retrying transient failures with exponential backoff.
    async fn put_chunk_with_retry(
        &self,
        session_uri: &str,
        chunk: &[u8],
        offset: u64,
        request: &UploadRequest,
    ) -> Result<ChunkReply> {
        let mut retry = 0;
        loop {
            match self.put_chunk(session_uri, chunk, offset, request).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && retry < request.max_retries => {
                    retry += 1;
                    let delay = backoff(retry);
                    warn!(
                        "Chunk at offset {} failed ({}), retry {}/{} in {:?}",
                        offset, e, retry, request.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl CloudStore for DriveClient {
    async fn find_folder(&self, name: &str, parent_id: Option<&str>) -> Result<Option<String>> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let query = folder_query(name, parent_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id, name)"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, "Folder lookup").await);
        }

        let list: FileList = response.json().await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        let url = format!("{}/files?supportsAllDrives=true", DRIVE_API_BASE);
        let mut body = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
        });
        if let Some(parent) = parent_id {
            body["parents"] = serde_json::json!([parent]);
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .timeout(METADATA_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, "Folder creation").await);
        }

        let file: DriveFile = response.json().await?;
        Ok(file.id)
    }

    async fn upload_stream(
        &self,
        source: Box<dyn Read + Send>,
        request: &UploadRequest,
    ) -> Result<String> {
        let session_uri = self.start_session(request).await?;
        let chunk_size = aligned_chunk_size(request.chunk_size);
        debug!(
            "Resumable upload of {} ({} bytes) in {} KB chunks",
            request.name,
            request.size,
            chunk_size / 1024
        );

        let mut source = source;
        let mut pending: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut offset: u64 = 0;
        let mut stalls = 0u32;

        loop {
            let remaining = request.size - offset;
            let want = (chunk_size as u64).min(remaining) as usize;
            if pending.len() < want {
                let (returned, more) = read_more(source, want - pending.len()).await?;
                source = returned;
                pending.extend_from_slice(&more);
            }

            let is_last = offset + pending.len() as u64 >= request.size;
            if pending.len() < want || (!is_last && pending.len() % CHUNK_ALIGN != 0) {
                return Err(BackupError::Transfer(format!(
                    "source for {} ended at {} of {} bytes",
                    request.name,
                    offset + pending.len() as u64,
                    request.size
                )));
            }

            match self
                .put_chunk_with_retry(&session_uri, &pending, offset, request)
                .await?
            {
                ChunkReply::Done(id) => {
                    info!("Uploaded {} to Drive as {}", request.name, id);
                    return Ok(id);
                }
                ChunkReply::Continue(committed) => {
                    let committed = committed.unwrap_or(offset).max(offset);
                    let accepted = (committed - offset).min(pending.len() as u64) as usize;
                    if accepted == 0 {
                        stalls += 1;
                        if pending.is_empty() || stalls > request.max_retries {
                            return Err(BackupError::cloud(
                                None,
                                format!("upload of {} stalled at {} bytes", request.name, offset),
                            ));
                        }
                    } else {
                        stalls = 0;
                    }
                    pending.drain(..accepted);
                    offset += accepted as u64;
                }
            }
        }
    }

    async fn test_connection(&self) -> Result<()> {
        info!("Testing Google Drive connection...");
        let url = format!("{}/about?fields=user", DRIVE_API_BASE);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, "Drive connection test").await);
        }
        info!("Google Drive connection test successful");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Google Drive"
    }
}

/// Builds a [`DriveClient`] from each job's resolved credentials file.
pub struct DriveProvider {
    fallback_credentials: Option<PathBuf>,
}

impl DriveProvider {
    pub fn new(fallback_credentials: Option<PathBuf>) -> Self {
        Self {
            fallback_credentials,
        }
    }
}

impl CloudProvider for DriveProvider {
    fn store_for(&self, cloud: &CloudUploadConfig) -> Result<Arc<dyn CloudStore>> {
        let path = cloud
            .credentials_ref
            .as_ref()
            .or(self.fallback_credentials.as_ref())
            .ok_or_else(|| {
                BackupError::Config("cloud upload enabled but no credentials file configured".to_string())
            })?;
        Ok(Arc::new(DriveClient::from_credentials_file(&expand_home(path))?))
    }
}
