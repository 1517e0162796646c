use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeDelta, Utc};
use serde_json::json;
use tower::ServiceExt;

use crate::integration::common::{
    TestApp, json_body, setup_test_app, setup_test_app_no_auth,
};

async fn create_active_channel(app: &TestApp, name: &str) -> String {
    let (status, channel) = app
        .call(
            "POST",
            "/v1/channels",
            Some(json!({ "name": name, "credential_scope": format!("oauth/{name}") })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = channel["id"].as_str().unwrap().to_string();

    let (status, _) = app
        .call("POST", &format!("/v1/channels/{id}/activate"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    id
}

async fn submit(app: &TestApp, channel_ids: &[&str]) -> serde_json::Value {
    let (status, body) = app
        .call(
            "POST",
            "/v1/items",
            Some(json!({
                "source_ref": "https://videos.example/v/42",
                "channel_ids": channel_ids,
                "priority": 5
            })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "ok");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(Request::get("/v1/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_token_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::get("/v1/jobs")
                .header("authorization", "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth().await;

    let response = app
        .router
        .oneshot(
            Request::get("/v1/jobs")
                .header("authorization", "Bearer any-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = json_body(response).await;
    assert_eq!(json["error"], "forbidden");
}

#[tokio::test]
async fn submit_item_queues_discovery() {
    let app = setup_test_app().await;

    let body = submit(&app, &[]).await;
    assert_eq!(body["item"]["stage"], "discovered");
    assert_eq!(body["job"]["stage"], "discovery");
    assert_eq!(body["job"]["status"], "queued");
    assert_eq!(body["job"]["priority"], 5);

    let item_id = body["item"]["id"].as_str().unwrap();
    let (status, detail) = app.call("GET", &format!("/v1/items/{item_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["jobs"].as_array().unwrap().len(), 1);

    let job_id = body["job"]["id"].as_str().unwrap();
    let (status, job) = app.call("GET", &format!("/v1/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["item_id"], item_id);
}

#[tokio::test]
async fn submit_with_empty_source_is_rejected() {
    let app = setup_test_app().await;

    let (status, body) = app
        .call("POST", "/v1/items", Some(json!({ "source_ref": "  " })))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn submit_with_unknown_channel_is_not_found() {
    let app = setup_test_app().await;

    let (status, body) = app
        .call(
            "POST",
            "/v1/items",
            Some(json!({
                "source_ref": "https://videos.example/v/1",
                "channel_ids": [uuid::Uuid::new_v4()]
            })),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn unknown_job_is_404() {
    let app = setup_test_app().await;

    let (status, body) = app
        .call("GET", &format!("/v1/jobs/{}", uuid::Uuid::new_v4()), None)
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn list_jobs_filters_and_rejects_bad_status() {
    let app = setup_test_app().await;
    submit(&app, &[]).await;
    submit(&app, &[]).await;

    let (status, body) = app
        .call("GET", "/v1/jobs?status=queued&stage=discovery", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);

    let (status, body) = app.call("GET", "/v1/jobs?status=dead", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);

    let (status, _) = app.call("GET", "/v1/jobs?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn retrying_a_live_job_conflicts() {
    let app = setup_test_app().await;
    let body = submit(&app, &[]).await;
    let job_id = body["job"]["id"].as_str().unwrap();

    let (status, body) = app
        .call("POST", &format!("/v1/jobs/{job_id}/retry"), None)
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}

#[tokio::test]
async fn failing_an_item_discards_its_jobs() {
    let app = setup_test_app().await;
    let body = submit(&app, &[]).await;
    let item_id = body["item"]["id"].as_str().unwrap();

    let (status, item) = app
        .call(
            "POST",
            &format!("/v1/items/{item_id}/fail"),
            Some(json!({ "reason": "takedown request" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["stage"], "failed");
    assert_eq!(item["failure_reason"], "takedown request");

    let (_, detail) = app.call("GET", &format!("/v1/items/{item_id}"), None).await;
    assert!(
        detail["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .all(|j| j["status"] != "queued")
    );

    let (status, _) = app
        .call(
            "POST",
            &format!("/v1/items/{item_id}/fail"),
            Some(json!({ "reason": "again" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn channel_lifecycle() {
    let app = setup_test_app().await;

    let (status, created) = app
        .call(
            "POST",
            "/v1/channels",
            Some(json!({
                "name": "clips-de",
                "credential_scope": "oauth/clips-de",
                "schedule": {
                    "timezone": "Europe/Berlin",
                    "windows": [{ "start": "09:00:00", "end": "11:00:00" }],
                    "min_interval_secs": 900
                },
                "rate_budget": { "capacity": 3, "window_secs": 3600, "publish_cost": 1 }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["active"], false);
    assert_eq!(created["schedule"]["timezone"], "Europe/Berlin");
    assert_eq!(created["rate_budget"]["capacity"], 3);
    let id = created["id"].as_str().unwrap();

    let (_, eligibility) = app
        .call("GET", &format!("/v1/channels/{id}/eligibility"), None)
        .await;
    assert_eq!(eligibility["eligible"], false);
    assert_eq!(eligibility["reason"], "channel inactive");

    let (status, activated) = app
        .call("POST", &format!("/v1/channels/{id}/activate"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(activated["active"], true);

    let (status, updated) = app
        .call(
            "PUT",
            &format!("/v1/channels/{id}/schedule"),
            Some(json!({
                "schedule": {},
                "rate_budget": { "capacity": 10, "window_secs": 86400, "publish_cost": 1 }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["rate_budget"]["capacity"], 10);

    let (_, eligibility) = app
        .call("GET", &format!("/v1/channels/{id}/eligibility"), None)
        .await;
    assert_eq!(eligibility["eligible"], true);

    let (status, _) = app
        .call("POST", &format!("/v1/channels/{id}/deactivate"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, list) = app.call("GET", "/v1/channels", None).await;
    assert_eq!(list["channels"].as_array().unwrap().len(), 1);
    assert_eq!(list["channels"][0]["active"], false);
}

#[tokio::test]
async fn duplicate_credential_scope_is_rejected() {
    let app = setup_test_app().await;
    let request = json!({ "name": "a", "credential_scope": "oauth/shared" });

    let (status, _) = app.call("POST", "/v1/channels", Some(request.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = app.call("POST", "/v1/channels", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn out_of_range_rate_window_is_rejected() {
    let app = setup_test_app().await;
    let (status, body) = app
        .call(
            "POST",
            "/v1/channels",
            Some(json!({
                "name": "forever",
                "credential_scope": "oauth/forever",
                "rate_budget": { "capacity": 1, "window_secs": i64::MAX, "publish_cost": 1 }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (_, list) = app.call("GET", "/v1/channels", None).await;
    assert!(list["channels"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn wave_schedule_and_status() {
    let app = setup_test_app().await;
    let channel = create_active_channel(&app, "clips").await;
    let item = submit(&app, &[&channel]).await;
    let item_id = item["item"]["id"].as_str().unwrap();
    let target = Utc::now() + TimeDelta::hours(1);

    let (status, wave) = app
        .call(
            "POST",
            "/v1/waves",
            Some(json!({
                "target_time": target,
                "label": "premiere",
                "members": [{ "item_id": item_id, "channel_id": channel }]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(wave["label"], "premiere");
    assert_eq!(wave["members"].as_array().unwrap().len(), 1);
    assert_eq!(wave["status"]["total"], 1);
    assert_eq!(wave["status"]["pending"], 1);
    assert_eq!(wave["status"]["settled"], false);

    let wave_id = wave["id"].as_str().unwrap();
    let (status, fetched) = app.call("GET", &format!("/v1/waves/{wave_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], wave_id);

    let (status, body) = app
        .call(
            "POST",
            &format!("/v1/waves/{wave_id}/members"),
            Some(json!({ "members": [{ "item_id": item_id, "channel_id": channel }] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn wave_with_past_target_is_unprocessable() {
    let app = setup_test_app().await;
    let channel = create_active_channel(&app, "clips").await;
    let item = submit(&app, &[&channel]).await;

    let (status, body) = app
        .call(
            "POST",
            "/v1/waves",
            Some(json!({
                "target_time": Utc::now() - TimeDelta::minutes(1),
                "members": [{ "item_id": item["item"]["id"], "channel_id": channel }]
            })),
        )
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_target");
}

#[tokio::test]
async fn unknown_wave_is_404() {
    let app = setup_test_app().await;

    let (status, _) = app
        .call("GET", &format!("/v1/waves/{}", uuid::Uuid::new_v4()), None)
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pause_and_resume() {
    let app = setup_test_app().await;

    let (status, body) = app.call("POST", "/v1/orchestrator/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "paused");

    let (_, body) = app.call("GET", "/v1/orchestrator", None).await;
    assert_eq!(body["state"], "paused");
    let state = app.db.state_repo();
    assert_eq!(
        wavecast_core::OrchestratorControl::state(&state).await.unwrap(),
        wavecast_core::OrchestratorState::Paused
    );

    let (status, body) = app.call("POST", "/v1/orchestrator/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "running");
}
