//! AWS Signature Version 4 request signing for Bedrock.
//!
//! Credentials come from `aws-config`: either a fixed provider handed in by
//! the caller, or the default chain (environment, shared profile files, SSO,
//! container and instance metadata) resolved on first use.

use crate::error::{ErrorKind, ProviderError};
use crate::transport::{RequestSigner, SigningRequest};
use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use std::time::SystemTime;
use tokio::sync::OnceCell;
use tracing::debug;

pub use aws_credential_types::Credentials;

pub const BEDROCK_SERVICE: &str = "bedrock";

pub struct SigV4Signer {
    region: String,
    service: String,
    profile: Option<String>,
    credentials: OnceCell<SharedCredentialsProvider>,
}

impl std::fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("region", &self.region)
            .field("service", &self.service)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl SigV4Signer {
    /// Sign with a fixed credentials provider, e.g. static [`Credentials`].
    pub fn new(
        credentials: impl ProvideCredentials + 'static,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
            profile: None,
            credentials: OnceCell::new_with(Some(SharedCredentialsProvider::new(credentials))),
        }
    }

    /// Resolve credentials through the default AWS chain, restricted to
    /// `profile` when given. Nothing is loaded until the first request.
    pub fn from_default_chain(
        region: impl Into<String>,
        service: impl Into<String>,
        profile: Option<String>,
    ) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
            profile,
            credentials: OnceCell::new(),
        }
    }

    async fn provider(&self) -> Result<&SharedCredentialsProvider, ProviderError> {
        self.credentials
            .get_or_try_init(|| async {
                debug!(region = %self.region, profile = ?self.profile, "loading AWS credential chain");
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(aws_config::Region::new(self.region.clone()));
                if let Some(profile) = &self.profile {
                    loader = loader.profile_name(profile);
                }
                loader
                    .load()
                    .await
                    .credentials_provider()
                    .ok_or_else(|| auth_error("no AWS credentials provider available".into()))
            })
            .await
    }

    /// Signing headers for `request` with `credentials` at `time`.
    pub fn sign_with(
        &self,
        credentials: &Credentials,
        request: &SigningRequest<'_>,
        time: SystemTime,
    ) -> Result<Vec<(String, String)>, ProviderError> {
        let identity: Identity = credentials.clone().into();
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(&self.service)
            .time(time)
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| signing_error(e.to_string()))?
            .into();
        let signable = SignableRequest::new(
            request.method,
            request.url,
            request
                .headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
            SignableBody::Bytes(request.body),
        )
        .map_err(|e| signing_error(e.to_string()))?;
        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| signing_error(e.to_string()))?
            .into_parts();
        Ok(instructions
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect())
    }
}

#[async_trait]
impl RequestSigner for SigV4Signer {
    async fn sign(&self, request: &SigningRequest<'_>) -> Result<Vec<(String, String)>, ProviderError> {
        let credentials = self
            .provider()
            .await?
            .provide_credentials()
            .await
            .map_err(|e| auth_error(format!("resolving AWS credentials: {e}")))?;
        self.sign_with(&credentials, request, SystemTime::now())
    }
}

fn auth_error(message: String) -> ProviderError {
    ProviderError::api("bedrock", ErrorKind::Authentication, message)
}

fn signing_error(message: String) -> ProviderError {
    ProviderError::api("bedrock", ErrorKind::Validation, format!("cannot sign request: {message}"))
}
