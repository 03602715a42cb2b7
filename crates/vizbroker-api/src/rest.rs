//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;
use vizbroker_core::{AllocatedItem, BrokerError, GroupId, Node, RequestItem, Resource, UserId};
use vizbroker_scheduler::{Allocation, Broker, BrokerStatus};

/// Application state shared across handlers
pub struct AppState {
    pub broker: Arc<Broker>,
}

/// Create the API router
pub fn create_router(broker: Arc<Broker>) -> Router {
    let state = Arc::new(AppState { broker });

    Router::new()
        .route(
            "/api/v1/allocations",
            post(create_allocation).get(list_allocations),
        )
        .route(
            "/api/v1/allocations/:id",
            get(get_allocation).delete(delete_allocation),
        )
        .route("/api/v1/resources", get(list_resources))
        .route("/api/v1/resources/search", post(search_resources))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map a broker error onto an HTTP status
fn error_response(e: BrokerError) -> (StatusCode, String) {
    let status = match &e {
        BrokerError::MalformedRequest(_) | BrokerError::Unsatisfiable(_) => StatusCode::BAD_REQUEST,
        BrokerError::ResourceUnknown(_) | BrokerError::AllocationNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        BrokerError::ResourceUnavailable(_) | BrokerError::ResourceBusy(_) => StatusCode::CONFLICT,
        BrokerError::AccessDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Request to allocate resources
#[derive(Debug, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub group_id: GroupId,
    /// Restrict matching to these nodes; empty means any node
    #[serde(default)]
    pub include_nodes: Vec<String>,
    pub request: Vec<RequestItem>,
}

/// Launcher bound to a grant
#[derive(Debug, Serialize, Deserialize)]
pub struct LauncherResponse {
    pub id: Uuid,
    pub backend: String,
    pub hosts: Vec<String>,
}

/// Response for an allocation
#[derive(Debug, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub id: Uuid,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub created_at: String,
    pub hosts: Vec<String>,
    pub items: Vec<AllocatedItem>,
    pub launchers: Vec<LauncherResponse>,
}

impl From<Allocation> for AllocationResponse {
    fn from(allocation: Allocation) -> Self {
        Self {
            id: allocation.id,
            user_id: allocation.user,
            group_id: allocation.group,
            created_at: allocation.created_at.to_rfc3339(),
            hosts: allocation.hosts(),
            launchers: allocation
                .launchers
                .iter()
                .map(|l| LauncherResponse {
                    id: l.id(),
                    backend: l.backend().to_string(),
                    hosts: l.hosts().to_vec(),
                })
                .collect(),
            items: allocation.items,
        }
    }
}

/// Allocate resources
async fn create_allocation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AllocateRequest>,
) -> Result<(StatusCode, Json<AllocationResponse>), (StatusCode, String)> {
    info!(
        user = req.user_id,
        group = req.group_id,
        items = req.request.len(),
        "Allocation request received"
    );

    let allocation = state
        .broker
        .allocate(&req.request, &req.include_nodes, req.user_id, req.group_id)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(AllocationResponse::from(allocation))))
}

/// List all allocations
async fn list_allocations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AllocationResponse>>, (StatusCode, String)> {
    let allocations = state.broker.allocations().await;
    Ok(Json(
        allocations
            .into_iter()
            .map(AllocationResponse::from)
            .collect(),
    ))
}

/// Get a specific allocation
async fn get_allocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AllocationResponse>, (StatusCode, String)> {
    let allocation = state.broker.allocation(id).await.map_err(error_response)?;
    Ok(Json(AllocationResponse::from(allocation)))
}

/// Release an allocation
async fn delete_allocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    info!(allocation_id = %id, "Releasing allocation");

    state
        .broker
        .deallocate_by_id(id)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn list_resources(State(state): State<Arc<AppState>>) -> Json<Vec<Resource>> {
    Json(state.broker.resources().await)
}

/// Resources matching a template
async fn search_resources(
    State(state): State<Arc<AppState>>,
    Json(template): Json<Resource>,
) -> Json<Vec<Resource>> {
    Json(state.broker.search(&template).await)
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<Node>> {
    Json(state.broker.nodes().await)
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub broker: BrokerStatus,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        broker: state.broker.status().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use vizbroker_runtime::{Backend, LocalBackend};
    use vizbroker_scheduler::Registry;

    fn router() -> Router {
        let registry = Registry::new(
            vec![Node::new("viz1", 0)],
            vec![
                Resource::gpu().with_index(0).on_host("viz1"),
                Resource::server().with_index(0).on_host("viz1"),
            ],
        )
        .unwrap();
        let backends: Vec<Arc<dyn Backend>> =
            vec![Arc::new(LocalBackend::new(vec!["viz1".to_string()]))];
        create_router(Arc::new(Broker::new(registry, backends)))
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn test_error_mapping() {
        let cases = [
            (BrokerError::MalformedRequest(String::new()), StatusCode::BAD_REQUEST),
            (BrokerError::Unsatisfiable(String::new()), StatusCode::BAD_REQUEST),
            (BrokerError::ResourceUnknown(String::new()), StatusCode::NOT_FOUND),
            (BrokerError::ResourceBusy(String::new()), StatusCode::CONFLICT),
            (BrokerError::AccessDenied(String::new()), StatusCode::FORBIDDEN),
            (BrokerError::Internal(String::new()), StatusCode::INTERNAL_SERVER_ERROR),
            (BrokerError::Backend(String::new()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(error_response(error).0, expected);
        }
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let router = router();
        let body = r#"{"user_id": 1000, "request": [{"resource": {"class": "gpu"}}]}"#;
        let (status, text) = send(&router, "POST", "/api/v1/allocations", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);

        let grant: AllocationResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(grant.hosts, vec!["viz1".to_string()]);
        assert_eq!(grant.launchers.len(), 1);
        assert_eq!(grant.launchers[0].backend, "local");

        let uri = format!("/api/v1/allocations/{}", grant.id);
        let (status, _) = send(&router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&router, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&router, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_busy_resource_conflicts() {
        let router = router();
        let body = r#"{"user_id": 1000, "request": [{"resource": {"class": "gpu", "index": 0, "host_name": "viz1"}}]}"#;
        let (status, _) = send(&router, "POST", "/api/v1/allocations", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(&router, "POST", "/api/v1/allocations", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_queries() {
        let router = router();
        let (status, text) = send(&router, "GET", "/api/v1/resources", None).await;
        assert_eq!(status, StatusCode::OK);
        let resources: Vec<Resource> = serde_json::from_str(&text).unwrap();
        assert_eq!(resources.len(), 2);

        let (_, text) = send(&router, "POST", "/api/v1/resources/search", Some(r#"{"class": "server"}"#)).await;
        let servers: Vec<Resource> = serde_json::from_str(&text).unwrap();
        assert_eq!(servers.len(), 1);

        let (_, text) = send(&router, "GET", "/api/v1/nodes", None).await;
        let nodes: Vec<Node> = serde_json::from_str(&text).unwrap();
        assert_eq!(nodes[0].host_name, "viz1");

        let (_, text) = send(&router, "GET", "/api/v1/status", None).await;
        let status: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(status["resources"], 2);
        assert_eq!(status["allocations"], 0);
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let router = router();
        let (status, _) = send(
            &router,
            "POST",
            "/api/v1/allocations",
            Some(r#"{"user_id": 1000, "request": []}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
