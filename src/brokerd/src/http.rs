// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The broker's HTTP surface.
//!
//! Every endpoint renders errors as `{"error": ...}` JSON; the status-code
//! mapping for [`BrokerError`] lives here and nowhere else.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use strand_broker::{Broker, BrokerError, ProduceRequest, Record, DEFAULT_TOPIC};

/// Builds the broker's route table.
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/produce", post(handle_produce))
        .route("/consume", get(handle_consume))
        .route("/topics", get(handle_topics))
        .route("/metadata/leader", get(handle_leader))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/internal/replicate", post(handle_replicate))
        .with_state(broker)
}

/// A [`BrokerError`] with its HTTP rendering.
struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> ApiError {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            BrokerError::NotLeader { leader_id } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Not the leader", "leader_id": leader_id }),
            ),
            BrokerError::NoLeader => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "No leader elected yet" }),
            ),
            BrokerError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            BrokerError::UnknownPartition { .. } => {
                (StatusCode::NOT_FOUND, json!({ "error": self.0.to_string() }))
            }
            BrokerError::ReplicationFailed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": self.0.to_string() }),
            ),
            BrokerError::Coord(_) | BrokerError::Storage(_) | BrokerError::Internal(_) => {
                error!("request failed: {}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn bad_request(msg: String) -> ApiError {
    ApiError(BrokerError::InvalidRequest(msg))
}

async fn handle_produce(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<ProduceRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(broker.produce(req).await?))
}

#[derive(Debug, Deserialize)]
struct ConsumeParams {
    topic: Option<String>,
    partition: Option<i64>,
    offset: Option<i64>,
}

async fn handle_consume(
    State(broker): State<Arc<Broker>>,
    params: Result<Query<ConsumeParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params.map_err(|e| bad_request(e.to_string()))?;
    let topic = params.topic.as_deref().unwrap_or(DEFAULT_TOPIC);
    let partition = params.partition.unwrap_or(0);
    let partition = u32::try_from(partition)
        .map_err(|_| bad_request(format!("invalid partition: {}", partition)))?;
    let offset = params.offset.unwrap_or(0);
    let offset =
        u64::try_from(offset).map_err(|_| bad_request(format!("invalid offset: {}", offset)))?;
    Ok(Json(broker.consume(topic, partition, offset).await?))
}

async fn handle_topics(State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    Json(broker.topics())
}

async fn handle_leader(State(broker): State<Arc<Broker>>) -> Result<Response, ApiError> {
    match broker.leader_status().await? {
        Some(status) => Ok(Json(status).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No leader elected" })),
        )
            .into_response()),
    }
}

async fn handle_health(State(broker): State<Arc<Broker>>) -> Response {
    let health = broker.health().await;
    let status = if health.coordination_connected {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(health)).into_response()
}

async fn handle_metrics(State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    Json(broker.metrics_snapshot())
}

async fn handle_replicate(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<Record>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(record) = body.map_err(|e| bad_request(e.to_string()))?;
    broker.apply_replicated(record).await?;
    Ok(Json(json!({ "status": "ack" })))
}
