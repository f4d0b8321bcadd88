//! Route configuration for the engine API.

use std::sync::Arc;

use axum::routing::{delete, get, post, Router};
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::handlers::{
    create_silence, expire_silence, health_check, list_alerts, list_failed_notifications,
    list_rules, list_silences, list_targets, metrics, query, reload,
};

/// Create the engine API router.
pub fn create_router(engine: Arc<Engine>) -> Router {
    let api_routes = Router::new()
        .route("/alerts", get(list_alerts))
        .route("/rules", get(list_rules))
        .route("/targets", get(list_targets))
        .route("/notifications/failed", get(list_failed_notifications))
        .route("/silences", get(list_silences).post(create_silence))
        .route("/silences/{id}", delete(expire_silence))
        .route("/query", get(query));

    Router::new()
        .route("/-/healthy", get(health_check))
        .route("/-/reload", post(reload))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api_routes)
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{engine_from, CONFIG};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use lookout_metrics::{Labels, MetricIdentity, MetricName};
    use tower::ServiceExt;

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    mod status {
        use super::*;

        #[tokio::test]
        async fn health_endpoint() {
            let app = create_router(engine_from(CONFIG));
            let (status, json) = send(app, get_request("/-/healthy")).await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["status"], "ok");
            assert_eq!(json["generation"], 1);
        }

        #[tokio::test]
        async fn metrics_endpoint_is_exposition_text() {
            let engine = engine_from(CONFIG);
            engine.metrics().record_reload(true);
            let app = create_router(engine);

            let response = app.oneshot(get_request("/metrics")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/plain"));

            let body = response.into_body().collect().await.unwrap().to_bytes();
            let text = String::from_utf8(body.to_vec()).unwrap();
            assert!(text.contains("lookout_config_reloads_total"));
        }

        #[tokio::test]
        async fn reload_without_file_is_rejected() {
            let app = create_router(engine_from(CONFIG));
            let request = Request::builder()
                .method("POST")
                .uri("/-/reload")
                .body(Body::empty())
                .unwrap();
            let (status, json) = send(app, request).await;

            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert_eq!(json["error"], "reload_rejected");
        }

        #[tokio::test]
        async fn unknown_route_is_404() {
            let app = create_router(engine_from(CONFIG));
            let (status, _) = send(app, get_request("/api/v1/nope")).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
    }

    mod listing {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn rules_and_targets_after_start() {
            let engine = engine_from(CONFIG);
            engine.start().await.unwrap();

            let (status, rules) =
                send(create_router(engine.clone()), get_request("/api/v1/rules")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(rules[0]["name"], "AppDown");
            assert_eq!(rules[0]["expr"], "up == 0");

            let (_, targets) =
                send(create_router(engine.clone()), get_request("/api/v1/targets")).await;
            assert_eq!(targets[0]["target"]["job"], "app");
            assert_eq!(targets[0]["url"], "http://localhost:8080/metrics");

            engine.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn empty_alerts_and_failed_lists() {
            let engine = engine_from(CONFIG);

            let (_, alerts) =
                send(create_router(engine.clone()), get_request("/api/v1/alerts")).await;
            assert_eq!(alerts, serde_json::json!([]));

            let (_, failed) = send(
                create_router(engine),
                get_request("/api/v1/notifications/failed"),
            )
            .await;
            assert_eq!(failed, serde_json::json!([]));
        }
    }

    mod silences {
        use super::*;

        #[tokio::test]
        async fn create_list_and_expire() {
            let engine = engine_from(CONFIG);
            let body = serde_json::json!({
                "matchers": ["job=\"batch\""],
                "ends_at": "2099-01-01T00:00:00Z",
                "comment": "maintenance",
            });

            let (status, created) = send(
                create_router(engine.clone()),
                json_request("POST", "/api/v1/silences", &body),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            let id = created["id"].as_str().unwrap().to_string();

            let (_, listed) =
                send(create_router(engine.clone()), get_request("/api/v1/silences")).await;
            assert_eq!(listed[0]["id"], id.as_str());
            assert_eq!(listed[0]["created_by"], "api");
            assert_eq!(listed[0]["source"], "api");

            let request = Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/silences/{id}"))
                .body(Body::empty())
                .unwrap();
            let (status, expired) = send(create_router(engine.clone()), request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(expired["id"], id.as_str());

            let now = lookout_alerts::to_datetime(engine.clock().now_millis());
            assert!(engine.router().silences().active(now).is_empty());
        }

        #[tokio::test]
        async fn bad_matcher_is_rejected() {
            let body = serde_json::json!({
                "matchers": ["job=batch"],
                "ends_at": "2099-01-01T00:00:00Z",
            });
            let (status, json) = send(
                create_router(engine_from(CONFIG)),
                json_request("POST", "/api/v1/silences", &body),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["error"], "invalid_request");
        }

        #[tokio::test]
        async fn reversed_window_is_rejected() {
            let body = serde_json::json!({
                "matchers": ["job=\"batch\""],
                "starts_at": "2099-01-02T00:00:00Z",
                "ends_at": "2099-01-01T00:00:00Z",
            });
            let (status, _) = send(
                create_router(engine_from(CONFIG)),
                json_request("POST", "/api/v1/silences", &body),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn expiring_unknown_silence_is_404() {
            let request = Request::builder()
                .method("DELETE")
                .uri("/api/v1/silences/missing")
                .body(Body::empty())
                .unwrap();
            let (status, json) = send(create_router(engine_from(CONFIG)), request).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(json["message"], "silence not found: missing");
        }
    }

    mod query {
        use super::*;

        #[tokio::test]
        async fn evaluates_against_store() {
            let engine = engine_from(CONFIG);
            let now = engine.clock().now_millis();
            let identity = MetricIdentity::new(
                MetricName::new("up").unwrap(),
                Labels::new().with("job", "app").with("instance", "localhost:8080"),
            );
            engine.store().write(&identity, now, 0.0).unwrap();

            let (status, json) = send(
                create_router(engine),
                get_request("/api/v1/query?expr=up%20%3D%3D%200"),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["expr"], "up == 0");
            assert_eq!(json["result"][0]["labels"]["job"], "app");
            assert_eq!(json["result"][0]["value"], 0.0);
        }

        #[tokio::test]
        async fn malformed_expression_is_400() {
            let (status, json) = send(
                create_router(engine_from(CONFIG)),
                get_request("/api/v1/query?expr=up%7B"),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["error"], "invalid_request");
        }

        #[tokio::test]
        async fn missing_expr_is_400() {
            let (status, _) =
                send(create_router(engine_from(CONFIG)), get_request("/api/v1/query")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
    }
}
