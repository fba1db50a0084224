use std::{path::Path, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use super::{Image, ImageError, ImageSource, ObjectFetcher};
use crate::domain::{config::ImageConfig, filesystem::ObjectHash};

/// Image and object client for the image server's HTTP interface
#[derive(Debug, Clone)]
pub struct HttpImageClient {
  client: reqwest::Client,
  base_url: String,
  /// Bounds a whole image request; object bodies can be large, so they only
  /// get the client's connect and read timeouts
  request_timeout: Duration,
}

impl HttpImageClient {
  pub fn new(base_url: &str, config: &ImageConfig) -> Result<Self, ImageError> {
    let request_timeout = Duration::from_secs(config.request_timeout_secs);
    let client = reqwest::Client::builder()
      .connect_timeout(request_timeout)
      .read_timeout(request_timeout)
      .build()?;
    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      request_timeout,
    })
  }

  fn image_url(&self, name: &str) -> String {
    format!("{}/images/{}", self.base_url, name)
  }

  fn object_url(&self, hash: &ObjectHash) -> String {
    format!("{}/objects/{}", self.base_url, hash.to_hex())
  }
}

#[async_trait]
impl ImageSource for HttpImageClient {
  async fn get_image(&self, name: &str) -> Result<Option<Image>, ImageError> {
    let url = self.image_url(name);
    let response = self.client.get(&url).timeout(self.request_timeout).send().await?;
    match response.status() {
      StatusCode::NOT_FOUND => Ok(None),
      status if status.is_success() => Ok(Some(response.json::<Image>().await?)),
      status => Err(ImageError::Status {
        status: status.as_u16(),
        url,
      }),
    }
  }
}

#[async_trait]
impl ObjectFetcher for HttpImageClient {
  async fn fetch(&self, hash: ObjectHash, dest: &Path) -> Result<u64, ImageError> {
    let url = self.object_url(&hash);
    let response = self.client.get(&url).send().await?;
    match response.status() {
      StatusCode::NOT_FOUND => return Err(ImageError::ObjectNotFound { hash }),
      status if !status.is_success() => {
        return Err(ImageError::Status {
          status: status.as_u16(),
          url,
        });
      }
      _ => {}
    }

    let temp = dest.with_extension("partial");
    let written = match write_verified(&temp, response, hash).await {
      Ok(written) => written,
      Err(e) => {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
      }
    };
    tokio::fs::rename(&temp, dest).await.map_err(|e| io_error(dest, e))?;
    debug!(hash = %hash, bytes = written, "Fetched object");
    Ok(written)
  }
}

fn io_error(path: &Path, source: std::io::Error) -> ImageError {
  ImageError::Io {
    path: path.display().to_string(),
    source,
  }
}

/// Stream the response body into `path`, checking it hashes to `expected`
async fn write_verified(path: &Path, response: reqwest::Response, expected: ObjectHash) -> Result<u64, ImageError> {
  let mut file = tokio::fs::File::create(path).await.map_err(|e| io_error(path, e))?;
  let mut hasher = Sha256::new();
  let mut written = 0u64;
  let mut body = response.bytes_stream();
  while let Some(chunk) = body.next().await {
    let chunk = chunk?;
    hasher.update(&chunk);
    file.write_all(&chunk).await.map_err(|e| io_error(path, e))?;
    written += chunk.len() as u64;
    trace!(hash = %expected, written, "Object chunk");
  }
  file.sync_all().await.map_err(|e| io_error(path, e))?;

  let actual = ObjectHash::from(hasher);
  if actual != expected {
    return Err(ImageError::HashMismatch { expected, actual });
  }
  Ok(written)
}
