//! HTTP route handlers

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Extension, Json, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::error::Error;
use crate::server::AppState;
use crate::types::{lenient_u32, GroupId, SlotId, TransactionId};

/// Allocation request (`GET /?groupId=2`)
#[derive(Debug, Deserialize)]
pub struct AllocateParams {
    #[serde(rename = "groupId")]
    pub group_id: u32,
}

/// Allocation response
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocateResponse {
    #[serde(rename = "folderId")]
    pub folder_id: u32,
    #[serde(rename = "processId")]
    pub process_id: String,
}

/// Completion request body
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(rename = "folderId", deserialize_with = "lenient_u32")]
    pub folder_id: u32,
    #[serde(rename = "processId")]
    pub process_id: String,
    #[serde(rename = "groupId", deserialize_with = "lenient_u32")]
    pub group_id: u32,
}

/// Completion response
#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub success: bool,
    #[serde(rename = "folderId", skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<u32>,
    #[serde(rename = "processId", skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(rename = "groupId", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// HTTP status for a core error
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::UnknownGroup(_) => StatusCode::NOT_FOUND,
        Error::Validation { .. } | Error::ExhaustedSlot { .. } => StatusCode::CONFLICT,
        Error::SlotOutOfRange { .. } | Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::StorageUnavailable(_)
        | Error::Storage(_)
        | Error::Serialization(_)
        | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": message,
        })),
    )
        .into_response()
}

/// Allocate a folder for a group
#[instrument(skip(state, params))]
pub async fn allocate(
    Extension(state): Extension<Arc<AppState>>,
    params: Result<Query<AllocateParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(p) => p,
        Err(rejection) => {
            warn!(error = %rejection, "Bad allocation request");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    let group = GroupId(params.group_id);
    info!(group = %group, "Received allocation request");

    match state.service.allocate(group).await {
        Ok(allocation) => Json(AllocateResponse {
            folder_id: allocation.slot.0,
            process_id: allocation.transaction_id.to_string(),
        })
        .into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                error!(error = %e, group = %group, "Allocation failed");
            } else {
                warn!(error = %e, group = %group, "Allocation rejected");
            }
            error_response(status, e.to_string())
        }
    }
}

/// Complete an allocation
#[instrument(skip(state, payload))]
pub async fn complete(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => {
            warn!(error = %rejection, "Bad completion request");
            return error_response(rejection.status(), rejection.body_text());
        }
    };
    info!(
        group = request.group_id,
        folder = request.folder_id,
        transaction = %request.process_id,
        "Received completion"
    );

    let transaction_id = TransactionId::from(request.process_id.clone());
    let result = state
        .service
        .complete(
            GroupId(request.group_id),
            SlotId(request.folder_id),
            &transaction_id,
        )
        .await;

    let (status, error) = match &result {
        Ok(_) => (StatusCode::OK, None),
        Err(e) => (status_for(e), Some(e.to_string())),
    };

    (
        status,
        Json(CompleteResponse {
            success: result.is_ok(),
            folder_id: Some(request.folder_id),
            process_id: Some(request.process_id),
            group_id: Some(request.group_id),
            error,
        }),
    )
        .into_response()
}

/// Per-group usage summary
#[instrument(skip(state))]
pub async fn status(Extension(state): Extension<Arc<AppState>>) -> Response {
    match state.service.status().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to build status report");
            error_response(status_for(&e), e.to_string())
        }
    }
}

/// Health check
pub async fn health_check() -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics() -> Response {
    crate::metrics::export_metrics().into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectReason;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::UnknownGroup(GroupId(1))), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&Error::Validation {
                transaction_id: TransactionId::from("x"),
                reason: RejectReason::AlreadyCompleted,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::SlotOutOfRange {
                group: GroupId(1),
                slot: SlotId(9),
                slots: 3
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::Storage("disk full".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_complete_request_accepts_strings() {
        let body: CompleteRequest =
            serde_json::from_str(r#"{"folderId":"4","processId":"abc","groupId":2}"#).unwrap();
        assert_eq!(body.folder_id, 4);
        assert_eq!(body.group_id, 2);
        assert_eq!(body.process_id, "abc");
    }
}
