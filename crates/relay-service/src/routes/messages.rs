use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Serialize;
use svckit_http::{ApiError, ApiResponse, PageQuery, Paginated};
use tracing::instrument;

use crate::{AppState, consumer::last_message_key, repository::ReceivedMessage};

#[derive(Debug, Serialize)]
pub struct PublishedMessage {
    pub topic: String,
}

#[instrument(skip(state, body))]
pub async fn publish_message(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<ApiResponse<PublishedMessage>, ApiError> {
    state
        .publisher
        .publish(&state.shutdown, &topic, &body, &state.retry)
        .await?;

    Ok(ApiResponse::accepted(PublishedMessage { topic }))
}

#[instrument(skip(state))]
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Paginated<ReceivedMessage> {
    Paginated::from_items(state.message_log.newest_first(), query)
}

#[instrument(skip(state))]
pub async fn last_message(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<ApiResponse<ReceivedMessage>, ApiError> {
    let cache = state
        .cache
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("last-message lookup requires a cache".into()))?;

    let message = cache
        .get_json::<ReceivedMessage>(&last_message_key(&topic))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no message seen for topic '{topic}'")))?;

    Ok(ApiResponse::ok(message))
}
