//! HTTP Basic 认证

use axum::http::{header, HeaderMap};
use data_encoding::BASE64;

use crate::{error::ApiError, state::AppState};

/// 解析 `Authorization: Basic base64(user:pass)`
pub(crate) fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim().as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

/// 未配置认证时直接放行
pub(crate) async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(credentials) = &state.credentials else {
        return Ok(());
    };
    let Some((username, password)) = basic_credentials(headers) else {
        return Err(ApiError::unauthorized());
    };
    if credentials.check_user(&username, &password).await {
        Ok(())
    } else {
        tracing::warn!(username = %username, "HTTP 认证失败");
        Err(ApiError::unauthorized())
    }
}
