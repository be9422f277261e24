use std::time::Duration;

use reqwest::{Client, Method, StatusCode};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Status code `url` answers with. Servers that reject `HEAD` are asked
/// again with `GET`; unreachable servers report `503`.
pub async fn probe(http: &Client, url: &str) -> u16 {
    match request_status(http, Method::HEAD, url).await {
        Ok(StatusCode::METHOD_NOT_ALLOWED) => request_status(http, Method::GET, url)
            .await
            .map(|status| status.as_u16())
            .unwrap_or_else(|err| unreachable_status(url, err)),
        Ok(status) => status.as_u16(),
        Err(err) => unreachable_status(url, err),
    }
}

async fn request_status(
    http: &Client,
    method: Method,
    url: &str,
) -> Result<StatusCode, reqwest::Error> {
    let response = http
        .request(method, url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await?;
    Ok(response.status())
}

fn unreachable_status(url: &str, err: reqwest::Error) -> u16 {
    tracing::debug!(url, error = %err, "status probe failed");
    StatusCode::SERVICE_UNAVAILABLE.as_u16()
}
