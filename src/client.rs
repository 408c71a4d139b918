//! Builds the `reqwest::Client` shared by every backend worker connection.
//!
//! Workers are trusted infrastructure on the operator's own network (see
//! `SPEC_FULL.md` §6, Non-goals: no mTLS/auth to workers), so this is a much
//! smaller surface than a general-purpose HTTP client factory: custom headers
//! and connection pool tuning, nothing else.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use tracing::info;

use crate::connection_pool::PoolConfig;
use crate::utils::parse_headers_with_escapes;

/// Configuration for building the backend HTTP client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub custom_headers: Option<String>,
    pub pool_config: Option<PoolConfig>,
}

/// Result of building the client, includes parsed headers for logging.
pub struct ClientBuildResult {
    pub client: reqwest::Client,
    pub parsed_headers: HeaderMap,
}

/// Builds the reqwest HTTP client used to talk to backend workers.
pub fn build_client(
    config: &ClientConfig,
) -> Result<ClientBuildResult, Box<dyn std::error::Error + Send + Sync>> {
    let mut client_builder = reqwest::Client::builder();

    let parsed_headers = configure_custom_headers(config.custom_headers.as_deref())?;
    if !parsed_headers.is_empty() {
        client_builder = client_builder.default_headers(parsed_headers.clone());
        info!(count = parsed_headers.len(), "configured custom default headers");
    }

    let pool_config = config.pool_config.clone().unwrap_or_default();
    client_builder = pool_config.apply_to_builder(client_builder);
    info!(
        max_idle_per_host = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "connection pool configured"
    );

    let client = client_builder.build()?;

    Ok(ClientBuildResult {
        client,
        parsed_headers,
    })
}

fn configure_custom_headers(
    custom_headers_str: Option<&str>,
) -> Result<HeaderMap, Box<dyn std::error::Error + Send + Sync>> {
    let mut parsed_headers = HeaderMap::new();

    let headers_str = match custom_headers_str {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(parsed_headers),
    };

    let header_pairs = parse_headers_with_escapes(headers_str);

    for header_pair_str in header_pairs {
        let header_pair_str_trimmed = header_pair_str.trim();
        if header_pair_str_trimmed.is_empty() {
            continue;
        }

        let parts: Vec<&str> = header_pair_str_trimmed.splitn(2, ':').collect();
        if parts.len() != 2 {
            return Err(format!(
                "Invalid header format in CUSTOM_HEADERS: '{}'. Expected 'Name:Value'.",
                header_pair_str_trimmed
            )
            .into());
        }

        let name_str = parts[0].trim();
        let value_str = parts[1].trim();

        if name_str.is_empty() {
            return Err(format!(
                "Invalid header format: Header name cannot be empty in '{}'.",
                header_pair_str_trimmed
            )
            .into());
        }

        let unescaped_value = value_str.replace("\\,", ",");

        let header_name = HeaderName::from_str(name_str)
            .map_err(|e| format!("Invalid header name: {}. Name: '{}'", e, name_str))?;
        let header_value = HeaderValue::from_str(&unescaped_value).map_err(|e| {
            format!(
                "Invalid header value for '{}': {}. Value: '{}'",
                name_str, e, unescaped_value
            )
        })?;

        parsed_headers.insert(header_name, header_value);
    }

    Ok(parsed_headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_defaults() {
        let config = ClientConfig::default();
        let result = build_client(&config).unwrap();
        assert!(result.parsed_headers.is_empty());
    }

    #[test]
    fn test_build_client_custom_headers() {
        let config = ClientConfig {
            custom_headers: Some("X-Test:value1,X-Other:value2".to_string()),
            pool_config: None,
        };
        let result = build_client(&config).unwrap();
        assert_eq!(result.parsed_headers.len(), 2);
        assert_eq!(result.parsed_headers["X-Test"], "value1");
    }

    #[test]
    fn test_build_client_invalid_header() {
        let config = ClientConfig {
            custom_headers: Some("not-a-valid-header".to_string()),
            pool_config: None,
        };
        assert!(build_client(&config).is_err());
    }
}
