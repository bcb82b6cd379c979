use std::time::Duration;

use regex::Regex;
use tracing::debug;

use super::RegistryError;

const ROSTER_TIMEOUT: Duration = Duration::from_secs(200);

/// Downloads the remote roster document and extracts the endpoints it
/// marks as available.
pub(super) async fn fetch_roster(
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<String>, RegistryError> {
    let response = client
        .get(url)
        .header(
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        )
        .timeout(ROSTER_TIMEOUT)
        .send()
        .await
        .map_err(|err| RegistryError::Discovery(err.to_string()))?;

    if !response.status().is_success() {
        return Err(RegistryError::Discovery(format!(
            "roster returned HTTP {}",
            response.status()
        )));
    }

    let content = response
        .text()
        .await
        .map_err(|err| RegistryError::Discovery(err.to_string()))?;
    Ok(parse_roster(&content))
}

/// Extracts endpoint base URLs from roster lines of the form
/// `[name](https://host) | :white_check_mark: | ✅`.
pub fn parse_roster(content: &str) -> Vec<String> {
    let pattern = Regex::new(
        r"\[(.*?)\]\((https?://[^)]+)\)[^\n]*\|\s*:white_check_mark:\s*\|\s*✅",
    )
    .expect("valid regex");

    let mut endpoints = Vec::new();
    for capture in pattern.captures_iter(content) {
        let url = capture[2].trim_end_matches('/').to_string();
        debug!(endpoint = %url, "roster endpoint found");
        endpoints.push(url);
    }
    endpoints
}
