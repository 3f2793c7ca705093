use std::env;
use std::time::SystemTime;

use anyhow::Context as _;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningParams, SigningSettings};
use aws_sigv4::sign::v4;
use bytes::Bytes;

const REGION_ENV_VAR: &str = "AWS_REGION";
const FALLBACK_REGION_ENV_VAR: &str = "AWS_DEFAULT_REGION";
const SERVICE_ENV_VAR: &str = "AWS_SERVICE_NAME";

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_SERVICE: &str = "aps";

/// Signs outbound requests with AWS Signature Version 4, as required by
/// Amazon Managed Prometheus. Signing happens after the Director has fully
/// rewritten the request, so the signature covers what is actually sent.
pub struct AwsSigner {
    credentials: Credentials,
    region: String,
    service: String,
}

impl AwsSigner {
    /// Reads credentials and signing scope from the environment, following
    /// the AWS SDK conventions (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// optional `AWS_SESSION_TOKEN`).
    pub fn from_env() -> anyhow::Result<Self> {
        let access_key_id = env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID is not set")?;
        let secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY is not set")?;
        let session_token = env::var("AWS_SESSION_TOKEN").ok();

        let region = env_or(REGION_ENV_VAR, || {
            env_or(FALLBACK_REGION_ENV_VAR, || DEFAULT_REGION.to_owned())
        });
        let service = env_or(SERVICE_ENV_VAR, || DEFAULT_SERVICE.to_owned());

        info!(%region, %service, "SigV4 request signing enabled");

        Ok(Self {
            credentials: Credentials::new(access_key_id, secret_access_key, session_token, None, "environment"),
            region,
            service,
        })
    }

    #[doc(hidden)]
    pub fn mock(access_key_id: &str, secret_access_key: &str, region: &str, service: &str) -> Self {
        Self {
            credentials: Credentials::new(access_key_id, secret_access_key, None, None, "mock"),
            region: region.to_owned(),
            service: service.to_owned(),
        }
    }

    /// Computes the SigV4 headers over the fully transformed request and
    /// applies them in place.
    pub fn sign(&self, request: &mut http::Request<Bytes>) -> anyhow::Result<()> {
        let identity = self.credentials.clone().into();

        let params: SigningParams<'_> = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(&self.service)
            .time(SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .context("couldn't assemble signing parameters")?
            .into();

        let mut headers = Vec::with_capacity(request.headers().len());

        for (name, value) in request.headers() {
            let value = value.to_str().context("non-ASCII header value can't be signed")?;
            headers.push((name.as_str(), value));
        }

        let signable = SignableRequest::new(
            request.method().as_str(),
            request.uri().to_string(),
            headers.into_iter(),
            SignableBody::Bytes(request.body()),
        )
        .context("request is not signable")?;

        let (instructions, _signature) = aws_sigv4::http_request::sign(signable, &params)
            .context("signing failed")?
            .into_parts();

        instructions.apply_to_request_http1x(request);

        Ok(())
    }
}

fn env_or(key: &str, fallback: impl FnOnce() -> String) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => fallback(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn sample_request() -> http::Request<Bytes> {
        http::Request::builder()
            .method(http::Method::GET)
            .uri("https://aps-workspaces.us-east-1.amazonaws.com/workspaces/ws-1/api/v1/query?query=up")
            .header("x-forwarded-host", "prom.proxy")
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn signing_adds_an_authorization_header() {
        let signer = AwsSigner::mock("AKIDEXAMPLE", "secret", "us-east-1", "aps");
        let mut request = sample_request();

        signer.sign(&mut request).unwrap();

        let authorization = request.headers().get("authorization").unwrap().to_str().unwrap();
        assert!(authorization.starts_with("AWS4-HMAC-SHA256"));
        assert!(authorization.contains("Credential=AKIDEXAMPLE"));
        assert!(authorization.contains("/us-east-1/aps/aws4_request"));
        assert!(request.headers().contains_key("x-amz-date"));
    }

    #[test]
    fn signature_covers_the_rewritten_query() {
        let signer = AwsSigner::mock("AKIDEXAMPLE", "secret", "us-east-1", "aps");

        let mut first = sample_request();
        signer.sign(&mut first).unwrap();

        let mut second = http::Request::builder()
            .method(http::Method::GET)
            .uri("https://aps-workspaces.us-east-1.amazonaws.com/workspaces/ws-1/api/v1/query?query=down")
            .header("x-forwarded-host", "prom.proxy")
            .body(Bytes::new())
            .unwrap();
        signer.sign(&mut second).unwrap();

        // Different canonical requests must not produce the same signature.
        assert_ne!(
            first.headers().get("authorization"),
            second.headers().get("authorization")
        );
    }
}
