use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::connection::AppState;
use crate::api::handlers::{connection, history, metadata, query};
use crate::app::AppServices;

/// Create router with application state
pub fn create_router_with_state(services: Arc<AppServices>) -> Router {
    let state = AppState { services };

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/connections",
            get(connection::list_connections).post(connection::create_connection),
        )
        .route(
            "/api/connections/{name}",
            get(connection::get_connection)
                .patch(connection::update_connection)
                .delete(connection::delete_connection),
        )
        .route(
            "/api/connections/{name}/metadata",
            get(metadata::get_metadata),
        )
        .route(
            "/api/connections/{name}/query",
            post(query::execute_query),
        )
        .route(
            "/api/connections/{name}/query/natural",
            post(query::execute_natural_language_query),
        )
        .route(
            "/api/connections/{name}/suggested-queries",
            get(query::suggested_queries),
        )
        .route(
            "/api/connections/{name}/history",
            get(history::list_history).delete(history::delete_history),
        )
        .route(
            "/api/connections/{name}/history/summary",
            get(history::history_summary),
        )
        .route(
            "/api/connections/{name}/history/{id}",
            delete(history::delete_history_item),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::test_config;
    use crate::services::testing::{rows, FakeFactory, FakeGenerator, Scripted};
    use crate::storage::SqliteStorage;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn router() -> (Router, Arc<AppServices>) {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let factory = Arc::new(
            FakeFactory::default()
                .on(
                    "FROM t",
                    Scripted::Rows(rows(&["id"], vec![vec![json!(1)], vec![json!(2)]])),
                )
                .on(
                    "FROM missing",
                    Scripted::Fail("relation \"missing\" does not exist".to_string()),
                ),
        );
        let generator = Arc::new(FakeGenerator::returning("SELECT id FROM t").suggesting(&[
            ("All ids", "SELECT id FROM t"),
            ("Drop it", "DROP TABLE t"),
            ("Largest id", "SELECT MAX(id) FROM t"),
        ]));
        let services = Arc::new(AppServices::with_components(
            test_config(),
            storage,
            factory,
            generator,
        ));
        (create_router_with_state(services.clone()), services)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn create_demo(app: &Router) -> Value {
        let (status, body) = send(
            app,
            "POST",
            "/api/connections",
            Some(json!({"name": "demo", "url": "postgresql://app:secret@db:5432/demo"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = router().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let (app, services) = router().await;
        let created = create_demo(&app).await;
        assert_eq!(created["url"], json!("postgresql://***:***@db:5432/demo"));
        assert_eq!(created["dialect"], json!("postgresql"));

        let (status, listed) = send(&app, "GET", "/api/connections", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["connections"].as_array().unwrap().len(), 1);

        let (status, _) = send(
            &app,
            "POST",
            "/api/connections",
            Some(json!({"name": "demo", "url": "postgresql://app:secret@db:5432/demo"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, renamed) = send(
            &app,
            "PATCH",
            "/api/connections/demo",
            Some(json!({"name": "renamed", "active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(renamed["name"], json!("renamed"));
        assert_eq!(renamed["active"], json!(false));

        let (status, _) = send(&app, "DELETE", "/api/connections/renamed", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "GET", "/api/connections/renamed", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], json!("NOT_FOUND"));
        services.close().await;
    }

    #[tokio::test]
    async fn test_query_and_history_routes() {
        let (app, services) = router().await;
        create_demo(&app).await;

        let (status, result) = send(
            &app,
            "POST",
            "/api/connections/demo/query",
            Some(json!({"sql": "SELECT id FROM t"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["executed_sql"], json!("SELECT id FROM t LIMIT 1000"));
        assert_eq!(result["row_count"], json!(2));
        assert_eq!(result["has_limit"], json!(true));

        let (status, body) = send(
            &app,
            "POST",
            "/api/connections/demo/query",
            Some(json!({"sql": "DROP TABLE t"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], json!("INVALID_STATEMENT_TYPE"));

        let (status, page) = send(&app, "GET", "/api/connections/demo/history?page=1&page_size=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total_count"], json!(2));
        assert_eq!(page["page_size"], json!(10));

        let (status, summary) = send(&app, "GET", "/api/connections/demo/history/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["recent_success_count"], json!(1));
        assert_eq!(summary["recent_error_count"], json!(1));

        let first_id = page["items"][0]["id"].as_i64().unwrap();
        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/connections/demo/history/{}", first_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/connections/demo/history/{}", first_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, deleted) = send(&app, "DELETE", "/api/connections/demo/history", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["deleted"], json!(1));
        services.close().await;
    }

    #[tokio::test]
    async fn test_driver_failure_is_server_error() {
        let (app, services) = router().await;
        create_demo(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/connections/demo/query",
            Some(json!({"sql": "SELECT * FROM missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], json!("EXECUTION_FAILED"));
        assert_eq!(
            body["error"]["details"],
            json!("relation \"missing\" does not exist")
        );
        services.close().await;
    }

    #[tokio::test]
    async fn test_natural_query_route() {
        let (app, services) = router().await;
        create_demo(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/connections/demo/query/natural",
            Some(json!({"prompt": "list ids"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generated_sql"], json!("SELECT id FROM t"));
        assert_eq!(body["result"]["row_count"], json!(2));

        let (status, _) = send(
            &app,
            "POST",
            "/api/connections/demo/query/natural",
            Some(json!({"prompt": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        services.close().await;
    }

    #[tokio::test]
    async fn test_suggested_queries_route() {
        let (app, services) = router().await;
        create_demo(&app).await;

        let (status, body) = send(
            &app,
            "GET",
            "/api/connections/demo/suggested-queries?limit=3&seed=5&exclude=All%20ids",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["suggestions"],
            json!([{"description": "Largest id", "sql": "SELECT MAX(id) FROM t"}])
        );

        let (status, _) = send(&app, "GET", "/api/connections/demo/suggested-queries?limit=50", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "GET", "/api/connections/missing/suggested-queries", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        services.close().await;
    }
}
