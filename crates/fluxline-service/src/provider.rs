//! HTTP-backed provider/processor caller.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use fluxline_engine::error::codes;
use fluxline_engine::{ProviderCallError, ProviderCaller};

/// Error payload the provider gateway returns on failure.
#[derive(Debug, Deserialize)]
struct WireError {
    code: Option<String>,
    message: String,
    details: Option<Value>,
}

/// Calls providers/processors over HTTP.
///
/// Each step is a POST to `{base}/providers/{ref}/invoke` carrying the
/// resolved input as JSON. The engine owns timeouts, so the client here
/// carries none of its own.
pub struct HttpProviderCaller {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProviderCaller {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn invoke_url(&self, provider_ref: &str) -> String {
        format!("{}/providers/{}/invoke", self.base_url, provider_ref)
    }
}

#[async_trait]
impl ProviderCaller for HttpProviderCaller {
    async fn call(&self, provider_ref: &str, input: &Value) -> Result<Value, ProviderCallError> {
        let url = self.invoke_url(provider_ref);
        let response = self
            .client
            .post(&url)
            .json(input)
            .send()
            .await
            .map_err(|e| ProviderCallError::new(format!("request to '{}' failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Gateways that speak our error shape keep their code and details.
            if let Ok(wire) = serde_json::from_str::<WireError>(&body) {
                let mut err = ProviderCallError::new(wire.message)
                    .with_code(wire.code.unwrap_or_else(|| codes::PROVIDER_ERROR.to_string()));
                if let Some(details) = wire.details {
                    err = err.with_details(details);
                }
                return Err(err);
            }
            return Err(ProviderCallError::new(format!(
                "provider '{}' returned HTTP {}",
                provider_ref, status
            ))
            .with_details(json!({ "body": body })));
        }

        response.json::<Value>().await.map_err(|e| {
            ProviderCallError::new(format!("invalid response from '{}': {}", provider_ref, e))
                .with_code(codes::BAD_RESPONSE)
        })
    }
}
