use crate::ProviderError;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

const ERROR_BODY_LIMIT: usize = 300;

/// Maps a non-success response onto the provider error taxonomy.
pub(crate) async fn expect_success(
    response: Response,
    context: &str,
) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let message = format!("{context} failed with status {status}: {detail}");

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(message),
        StatusCode::NOT_FOUND | StatusCode::GONE => ProviderError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Connection(message),
        status if status.is_server_error() => ProviderError::Connection(message),
        _ => ProviderError::Data(message),
    })
}

pub(crate) async fn read_json<T>(response: Response, context: &str) -> Result<T, ProviderError>
where
    T: DeserializeOwned,
{
    let response = expect_success(response, context).await?;
    Ok(response.json::<T>().await?)
}
