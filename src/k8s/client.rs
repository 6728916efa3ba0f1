// Client creation with custom user-agent support for kube 2.x
use super::USER_AGENT_ENV;
use crate::error::{Error, Result};
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::warn;

/// Resolve the user agent: the environment override wins over the caller's choice
fn resolve_user_agent(custom_user_agent: Option<&str>) -> Option<String> {
    std::env::var(USER_AGENT_ENV)
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(|| custom_user_agent.map(str::to_string))
}

/// Validate a user agent as an HTTP header value
///
/// # Errors
///
/// Will return `Err` if the string contains characters not allowed in a header
pub fn user_agent_header(user_agent: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(user_agent)
        .map_err(|e| Error::Custom(format!("invalid user agent {user_agent:?}: {e}")))
}

async fn build(custom_user_agent: Option<&str>, strict: bool) -> Result<Client> {
    let mut config = Config::infer().await?;

    if let Some(user_agent) = resolve_user_agent(custom_user_agent) {
        match user_agent_header(&user_agent) {
            Ok(header_value) => {
                config
                    .headers
                    .push((HeaderName::from_static("user-agent"), header_value));
            }
            Err(e) if strict => return Err(e),
            // Fall back to kube's default user agent
            Err(e) => warn!("Ignoring user agent: {}", e),
        }
    }

    let client = Client::try_from(config)?;

    Ok(client)
}

/// Create a new k8s client to interact with k8s cluster api
///
/// # Errors
///
/// Will return `Err` if no cluster configuration can be inferred
pub async fn new(custom_user_agent: Option<&str>) -> Result<Client> {
    build(custom_user_agent, false).await
}

/// Like [`new`], but an invalid user agent is an error
///
/// # Errors
///
/// Will return `Err` if the user agent is not a valid header value or no
/// cluster configuration can be inferred
pub async fn new_strict(custom_user_agent: Option<&str>) -> Result<Client> {
    build(custom_user_agent, true).await
}
