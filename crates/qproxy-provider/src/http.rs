use base64::Engine as _;

use qproxy_common::UPSTREAM_TIMEOUT;

use crate::{ProviderError, ProviderResult};

pub(crate) fn build_client() -> ProviderResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .map_err(|err| ProviderError::Network(err.to_string()))
}

pub(crate) async fn ensure_success(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Upstream {
        status: status.as_u16(),
        body,
    })
}

/// `data:<mime>;base64,<payload>` URLs decode inline without a fetch.
pub(crate) fn parse_data_url(url: &str) -> Option<(String, String)> {
    let url = url.strip_prefix("data:")?;
    let (meta, data) = url.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

/// Download an image and return `(mime_type, base64_payload)`.
pub(crate) async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
) -> ProviderResult<(String, String)> {
    if let Some(inline) = parse_data_url(url) {
        return Ok(inline);
    }
    let response = ensure_success(client.get(url).send().await?).await?;
    let mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "image/jpeg".to_string());
    let bytes = response.bytes().await?;
    Ok((
        mime,
        base64::engine::general_purpose::STANDARD.encode(&bytes),
    ))
}
