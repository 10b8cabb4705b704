use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use domain::{GroupMembership, SendMessageCommand, StableId};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use application::resource::{read_all, write_all};
use application::RESOURCE_PREFIX;

use crate::{
    auth::authorize,
    error::{ApiError, ApiResponse},
    state::AppState,
};

#[derive(Debug, Deserialize)]
struct ResourceQuery {
    #[serde(default)]
    resource: String,
}

#[derive(Debug, Deserialize)]
struct GroupQuery {
    #[serde(default)]
    gid: String,
}

#[derive(Debug, Serialize)]
struct MemberDto {
    gid: String,
    uid: String,
    nickname: String,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
}

impl From<GroupMembership> for MemberDto {
    fn from(value: GroupMembership) -> Self {
        Self {
            gid: value.group_id.to_string(),
            uid: value.user_id.to_string(),
            nickname: value.nickname,
            joined_at: value.joined_at,
            left_at: value.left_at,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_size;
    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/resource", get(resource))
        .route("/msg/send", post(send_message))
        .route("/group", get(group))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.platform.is_alive() {
        (StatusCode::OK, "UP")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DOWN")
    }
}

/// multipart 字段 `file`，可选字段 `filename` 覆盖原文件名
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    authorize(&state, &headers).await?;

    let mut filename: Option<String> = None;
    let mut file: Option<(Option<String>, bytes::Bytes)> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return Err(multipart_error(&state, err.status(), &err.body_text())),
        };
        match field.name() {
            Some("filename") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| multipart_error(&state, err.status(), &err.body_text()))?;
                filename = Some(text);
            }
            Some("file") => {
                let original = field.file_name().map(str::to_owned);
                let content = field
                    .bytes()
                    .await
                    .map_err(|err| multipart_error(&state, err.status(), &err.body_text()))?;
                file = Some((original, content));
            }
            _ => {}
        }
    }

    let Some((original, content)) = file else {
        return Err(ApiError::bad_request("Error retrieving the file."));
    };
    let name = filename
        .filter(|name| !name.trim().is_empty())
        .or(original)
        .ok_or_else(|| ApiError::bad_request("Missing filename."))?;

    let path = write_all(state.resources.as_ref(), &name, &content).await?;
    tracing::info!(path = %path, size = content.len(), "资源已上传");
    Ok(ApiResponse::ok(format!("{RESOURCE_PREFIX}{path}")))
}

fn multipart_error(state: &AppState, status: StatusCode, detail: &str) -> ApiError {
    tracing::warn!(status = %status, detail, "解析上传内容失败");
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::payload_too_large(format!(
            "File is too large, maximum allowed size is {}.",
            human_size(state.max_upload_size)
        ));
    }
    ApiError::bad_request("Error parsing request body.")
}

fn human_size(size: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size}B")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

async fn resource(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ResourceQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers).await?;

    let path = query
        .resource
        .strip_prefix(RESOURCE_PREFIX)
        .unwrap_or(&query.resource);
    if path.is_empty() {
        return Err(ApiError::bad_request("Invalid resource"));
    }
    let content = read_all(state.resources.as_ref(), path).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content,
    )
        .into_response())
}

/// 支持 JSON 和表单两种请求体
async fn send_message(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<ApiResponse<&'static str>>, ApiError> {
    authorize(&state, request.headers()).await?;

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let command = if content_type.starts_with("application/json") {
        let Json(command) = Json::<SendMessageCommand>::from_request(request, &state)
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "解析 JSON 请求体失败");
                ApiError::bad_request("Error parsing request body.")
            })?;
        command
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(command) = Form::<SendMessageCommand>::from_request(request, &state)
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "解析表单请求体失败");
                ApiError::bad_request("Error parsing request body.")
            })?;
        command
    } else {
        return Err(ApiError::unsupported_media_type());
    };

    state.sender.send(&command).await?;
    Ok(ApiResponse::ok("OK"))
}

async fn group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<GroupQuery>,
) -> Result<Json<ApiResponse<Vec<MemberDto>>>, ApiError> {
    if query.gid.trim().is_empty() {
        return Err(ApiError::bad_request("Invalid gid"));
    }
    authorize(&state, &headers).await?;

    let members = state
        .memberships
        .list_by_group(&StableId::from(query.gid.as_str()))
        .await
        .map_err(application::ApplicationError::from)?;
    Ok(ApiResponse::ok(
        members.into_iter().map(MemberDto::from).collect(),
    ))
}
