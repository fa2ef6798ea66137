//! Template staging and toolkit bootstrap.
//!
//! Templates larger than the inline limit have to be uploaded to the toolkit
//! bucket and referenced by URL. When that bucket does not exist the deploy
//! fails with [`DeployError::BootstrapRequired`] and the scheduler calls the
//! [`Bootstrapper`] once before retrying.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use tracing::{debug, info};

use crate::config::ConfigHasher;
use crate::error::{DeployError, Result, StackweaveError};

use super::cloudformation::classify;

/// Largest template body accepted inline by the control plane.
pub const INLINE_TEMPLATE_LIMIT: usize = 51_200;

/// Prefix of every bootstrap-required message.
pub const BOOTSTRAP_REQUIRED_PREFIX: &str =
    "This stack uses assets, so the toolkit stack must be deployed to the environment";

/// Stages template bodies somewhere the control plane can read them.
#[async_trait]
pub trait AssetPublisher: Send + Sync {
    /// Uploads a template body and returns its URL.
    ///
    /// Returns [`DeployError::BootstrapRequired`] when the staging location
    /// does not exist yet.
    async fn stage_template(&self, stack_name: &str, body: &str) -> Result<String>;
}

/// Creates the toolkit resources that asset staging depends on.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Creates or repairs the toolkit resources.
    async fn bootstrap(&self) -> Result<()>;
}

/// Builds the error returned when the toolkit resources are missing.
#[must_use]
pub fn bootstrap_required(detail: &str) -> StackweaveError {
    StackweaveError::Deploy(DeployError::BootstrapRequired {
        message: format!("{BOOTSTRAP_REQUIRED_PREFIX} ({detail})"),
    })
}

/// Keeps transient upload errors retryable and wraps the rest.
fn staging_error(stack_name: &str, err: StackweaveError) -> StackweaveError {
    if err.is_retryable() {
        return err;
    }
    StackweaveError::Deploy(DeployError::AssetStaging {
        stack: stack_name.to_string(),
        message: err.detail(),
    })
}

/// S3 toolkit bucket used for both staging and bootstrap.
#[derive(Debug, Clone)]
pub struct S3AssetPublisher {
    /// S3 client.
    client: Client,
    /// Toolkit bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Region the bucket lives in.
    region: String,
}

impl S3AssetPublisher {
    /// Creates a publisher from the shared AWS configuration.
    #[must_use]
    pub fn new(config: &aws_config::SdkConfig, bucket: &str, prefix: Option<&str>) -> Self {
        let region = config
            .region()
            .map_or_else(|| String::from("us-east-1"), ToString::to_string);
        Self::with_client(Client::new(config), bucket, prefix, &region)
    }

    /// Creates a publisher with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, region: &str) -> Self {
        let prefix = prefix
            .map(|p| {
                let p = p.trim_matches('/');
                if p.is_empty() {
                    String::new()
                } else {
                    format!("{p}/")
                }
            })
            .unwrap_or_default();

        Self {
            client,
            bucket: bucket.to_string(),
            prefix,
            region: region.to_string(),
        }
    }

    /// Object key for a template, content addressed so re-uploads are stable.
    #[must_use]
    pub fn template_key(&self, stack_name: &str, body: &str) -> String {
        let hash = ConfigHasher::new().hash_template(body);
        format!("{}{stack_name}-{hash}.json", self.prefix)
    }

    /// Public URL of an object in the toolkit bucket.
    #[must_use]
    pub fn object_url(&self, key: &str) -> String {
        format!("https://s3.{}.amazonaws.com/{}/{key}", self.region, self.bucket)
    }

    async fn bucket_exists(&self) -> Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(classify(&err, &self.bucket)),
        }
    }
}

#[async_trait]
impl AssetPublisher for S3AssetPublisher {
    async fn stage_template(&self, stack_name: &str, body: &str) -> Result<String> {
        let key = self.template_key(stack_name, body);
        debug!("Staging template for {stack_name} at s3://{}/{key}", self.bucket);

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(self.object_url(&key)),
            Err(err) if err.code() == Some("NoSuchBucket") => Err(bootstrap_required(&format!(
                "bucket {} does not exist",
                self.bucket
            ))),
            Err(err) => Err(staging_error(stack_name, classify(&err, &self.bucket))),
        }
    }
}

#[async_trait]
impl Bootstrapper for S3AssetPublisher {
    async fn bootstrap(&self) -> Result<()> {
        if self.bucket_exists().await? {
            debug!("Toolkit bucket {} already exists", self.bucket);
            return Ok(());
        }

        info!("Bootstrapping toolkit bucket {} in {}", self.bucket, self.region);

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(()),
            // An earlier attempt may have created it before the error came back.
            Err(err) if err.code() == Some("BucketAlreadyOwnedByYou") => Ok(()),
            Err(err) => Err(classify(&err, &self.bucket)),
        }
    }
}
