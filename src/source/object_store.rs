/// Byte transport for flat files: a local mirror directory or an S3-compatible bucket
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client;
use std::io::Read;
use std::path::PathBuf;
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

use crate::config::FlatFileConfig;
use crate::error::{BackfillError, Result};

/// Blocking, streaming object reads. Called from the Router's blocking thread.
pub trait FlatFileStore: Send + Sync {
    /// Open `key` for streaming. `Ok(None)` when the object does not exist.
    fn open(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>>;

    /// Cheap reachability check done before a run starts.
    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String;
}

/// Flat files mirrored under a directory, using the same key layout as the bucket
pub struct LocalFlatFiles {
    root: PathBuf,
}

impl LocalFlatFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FlatFileStore for LocalFlatFiles {
    fn open(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let path = self.root.join(key);
        match std::fs::File::open(&path) {
            Ok(file) => Ok(Some(Box::new(std::io::BufReader::new(file)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn check(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(BackfillError::SourceUnavailable(format!(
                "flat file directory {} does not exist",
                self.root.display()
            )))
        }
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

/// Flat files served over the S3 API (e.g. files.polygon.io)
pub struct S3FlatFiles {
    client: Client,
    bucket: String,
    handle: Handle,
}

impl S3FlatFiles {
    /// Must be called from within the tokio runtime that will drive downloads.
    pub fn new(config: &FlatFileConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            BackfillError::SourceUnavailable(format!("S3 flat files need a tokio runtime: {}", e))
        })?;

        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "flatfile",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .endpoint_url(config.endpoint.clone())
            .region(Region::new("us-east-1"))
            .credentials_provider(credentials)
            .behavior_version(BehaviorVersion::latest())
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            handle,
        })
    }
}

impl FlatFileStore for S3FlatFiles {
    fn open(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let response = self.handle.block_on(
            self.client
                .get_object()
                .bucket(self.bucket.clone())
                .key(key)
                .send(),
        );

        match response {
            Ok(output) => {
                debug!("Streaming s3://{}/{}", self.bucket, key);
                let body = Box::pin(output.body.into_async_read());
                Ok(Some(Box::new(SyncIoBridge::new_with_handle(
                    body,
                    self.handle.clone(),
                ))))
            }
            Err(err) if is_missing_object(&err) => Ok(None),
            Err(err) => Err(BackfillError::ObjectStoreError(format!(
                "GetObject s3://{}/{} failed: {}",
                self.bucket, key, err
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// The provider answers 403 for days it has not published yet, 404 otherwise.
fn is_missing_object(err: &SdkError<GetObjectError>) -> bool {
    if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
        return true;
    }
    matches!(
        err.raw_response().map(|r| r.status().as_u16()),
        Some(403) | Some(404)
    )
}
