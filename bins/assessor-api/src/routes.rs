//! Router assembly: public and admin APIs, health, metrics, CORS and HTTP
//! tracing.

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::handlers::{self, admin, public};
use crate::state::AppState;

fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/exercises", get(public::list_exercises))
        .route("/exercises/:id/challenges", get(public::list_challenges))
        .route("/challenges/:id", get(public::get_challenge))
        .route("/challenges/:id/start", post(public::start_challenge))
        .route("/steps/:id/load", get(public::load_step))
        .route("/steps/:id/save", post(public::save_step))
        .route("/steps/:id/test", post(public::test_step))
        .route("/steps/:id/submit", post(public::submit_step))
        .route("/languages", get(public::list_languages))
}

fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/exercises",
            get(admin::list_exercises).post(admin::create_exercise),
        )
        .route(
            "/exercises/:id",
            get(admin::get_exercise)
                .put(admin::update_exercise)
                .delete(admin::delete_exercise),
        )
        .route(
            "/exercises/:id/challenges",
            get(admin::list_challenges).post(admin::create_challenge),
        )
        .route(
            "/challenges/:id",
            get(admin::get_challenge)
                .put(admin::update_challenge)
                .delete(admin::delete_challenge),
        )
        .route(
            "/challenges/:id/steps",
            get(admin::list_steps).post(admin::create_step),
        )
        .route(
            "/steps/:id",
            get(admin::get_step)
                .put(admin::update_step)
                .delete(admin::delete_step),
        )
        .route(
            "/steps/:id/testcases",
            get(admin::list_testcases).post(admin::create_testcase),
        )
        .route("/steps/:id/testcases/import", post(admin::import_testcases))
        .route("/steps/:id/test", post(admin::dry_run))
        .route("/steps/:id/validate", post(admin::validate_step))
        .route(
            "/testcases/:id",
            get(admin::get_testcase)
                .put(admin::update_testcase)
                .delete(admin::delete_testcase),
        )
        .route(
            "/user-challenges/:id/steps/:step_id/reviews",
            post(admin::resolve_review),
        )
        .route("/catalog/export", get(admin::export_catalog))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .nest("/api", public_routes())
        .nest("/api/admin", admin_routes())
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Parts;
    use assessor_common::config::Config;
    use assessor_engine::catalog::{Catalog, CatalogDocument};
    use assessor_engine::clock::SystemClock;
    use assessor_engine::languages::LanguageRegistry;
    use assessor_engine::sandbox::ScriptedSandbox;
    use assessor_engine::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const CHALLENGE: &str = "6f1c2f0e-1111-4a4a-9c9c-000000000001";
    const STEP: &str = "6f1c2f0e-2222-4a4a-9c9c-000000000002";
    const DRAFT_EXERCISE: &str = "6f1c2f0e-3333-4a4a-9c9c-000000000003";

    fn catalog() -> Catalog {
        let doc: CatalogDocument = serde_json::from_value(json!({
            "exercises": [
                {
                    "title": "Factorial service",
                    "category": "developer",
                    "difficulty": "beginner",
                    "estimated_duration_minutes": 20,
                    "status": "published",
                    "challenges": [{
                        "id": CHALLENGE,
                        "title": "Echo",
                        "status": "published",
                        "execution_environment": "code_executor",
                        "order_index": 0,
                        "steps": [{
                            "id": STEP,
                            "title": "Echo stdin",
                            "order_index": 0,
                            "is_final_step": true,
                            "solution_code": "echo",
                            "test_cases": [
                                {"testcase_type": "unit_test", "order_index": 0, "input": "1", "expected_output": "1"},
                                {"testcase_type": "unit_test", "order_index": 1, "input": "2", "expected_output": "2"},
                                {"testcase_type": "unit_test", "order_index": 2, "input": "secret-7", "expected_output": "secret-7", "is_hidden": true}
                            ]
                        }]
                    }]
                },
                {
                    "id": DRAFT_EXERCISE,
                    "title": "Unreleased",
                    "category": "data_analyst",
                    "difficulty": "advanced",
                    "estimated_duration_minutes": 60,
                    "status": "draft"
                }
            ]
        }))
        .unwrap();
        Catalog::from_document(doc).unwrap()
    }

    fn app() -> Router {
        let config = Config::from_lookup(|_| None).unwrap();
        let state = AppState::from_parts(
            Parts {
                catalog: Arc::new(catalog()),
                store: Arc::new(MemoryStore::new()),
                sandbox: Arc::new(ScriptedSandbox::echo()),
                languages: Arc::new(LanguageRegistry::builtin()),
                clock: Arc::new(SystemClock),
            },
            &config,
        );
        build_router(state)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("x-session-token", token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_public_list_hides_drafts() {
        let app = app();
        let (status, body) = send(&app, get("/api/exercises?per_page=10")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["total"], 1);
        assert_eq!(body["data"][0]["title"], "Factorial service");

        let (status, body) = send(&app, get(&format!("/api/exercises/{DRAFT_EXERCISE}/challenges"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");

        let (_, body) = send(&app, get("/api/admin/exercises")).await;
        assert_eq!(body["pagination"]["total"], 2);
    }

    #[tokio::test]
    async fn test_start_and_submit_flow() {
        let app = app();
        let (status, started) = send(
            &app,
            post(&format!("/api/challenges/{CHALLENGE}/start"), None, json!({"anonymousIdentifier": "cand-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["anonymous_identifier"], "cand-1");
        let token = started["session_token"].as_str().unwrap().to_string();

        let submission = json!({"source_code": "echo", "language": "python"});
        let (status, body) = send(&app, post(&format!("/api/steps/{STEP}/submit"), None, submission.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "session_invalid");

        let (status, body) = send(&app, post(&format!("/api/steps/{STEP}/submit"), Some(&token), submission)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["passed"], 3);
        assert_eq!(body["summary"]["total"], 3);
        assert_eq!(body["summary"]["success_rate"], 100.0);
        assert_eq!(body["summary"]["all_passed"], true);
        assert_eq!(body["user_challenge"]["status"], "completed");
        assert!(!body.to_string().contains("secret-7"));

        let response = app.clone().oneshot(get("/metrics")).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("assessor_submissions_total"));
    }

    #[tokio::test]
    async fn test_unknown_language_is_validation_error() {
        let app = app();
        let (_, started) = send(&app, post(&format!("/api/challenges/{CHALLENGE}/start"), None, json!({}))).await;
        let token = started["session_token"].as_str().unwrap().to_string();
        let (status, body) = send(
            &app,
            post(
                &format!("/api/steps/{STEP}/test"),
                Some(&token),
                json!({"code": "x", "language": "brainfuck"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "validation_error");
    }

    #[tokio::test]
    async fn test_admin_import_reports_rows() {
        let app = app();
        let rows = json!({"rows": [
            {"testcase_type": "unit_test", "input": "3", "expected_output": "3"},
            {"testcase_type": "sql_query_test", "expected_rows": []}
        ]});
        let (status, body) = send(&app, post(&format!("/api/admin/steps/{STEP}/testcases/import"), None, rows)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["rows"][0]["index"], 1);

        let (_, cases) = send(&app, get(&format!("/api/admin/steps/{STEP}/testcases"))).await;
        assert_eq!(cases.as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn test_admin_validate_shows_hidden() {
        let app = app();
        let (status, report) = send(&app, post(&format!("/api/admin/steps/{STEP}/validate"), None, json!({}))).await;
        // No language is configured for the solution in this catalog.
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(report["error"]["code"], "validation_error");

        let (status, report) = send(
            &app,
            post(
                &format!("/api/admin/steps/{STEP}/test"),
                None,
                json!({"code": "echo", "language": "python"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(report.to_string().contains("secret-7"));
        assert_eq!(report["step_completed"], true);
    }
}
