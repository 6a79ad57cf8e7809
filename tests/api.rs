use std::sync::Arc;

use actix_web::http::{header, StatusCode};
use actix_web::{test, App};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use agentdesk::store::MemoryStore;
use agentdesk::{configure, AppConfig, AppState};

const SECRET: &str = "integration-secret";

fn state_for(backend: &MockServer) -> Arc<AppState> {
    Arc::new(AppState::new(
        AppConfig::local(&backend.uri(), SECRET),
        Arc::new(MemoryStore::new()),
        None,
        None,
    ))
}

fn bearer(state: &AppState, user_id: &str) -> (header::HeaderName, String) {
    let token = state
        .keys
        .sign(user_id, &format!("{}@acme.co", user_id), Some("Ann"), true)
        .unwrap();
    (header::AUTHORIZATION, format!("Bearer {}", token))
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(App::new().configure(configure($state.clone()))).await
    };
}

/// Creates workspace `acme` and an agent in it, returning the agent id.
macro_rules! workspace_and_agent {
    ($app:expr, $auth:expr) => {{
        let req = test::TestRequest::post()
            .uri("/workspaces")
            .insert_header($auth.clone())
            .set_json(json!({ "name": "Acme", "url": "acme" }))
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = test::TestRequest::post()
            .uri("/w/acme/agents")
            .insert_header($auth.clone())
            .set_json(json!({ "name": "Support" }))
            .to_request();
        let agent: Value = test::call_and_read_body_json(&$app, req).await;
        agent["id"].as_str().unwrap().to_string()
    }};
}

#[actix_web::test]
async fn faq_is_listed_after_ingestion() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/knowledge-base/store-faq"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": { "qdrantId": "vec-1", "chunks_created": 1 }
        })))
        .expect(1)
        .mount(&backend)
        .await;

    let state = state_for(&backend);
    let app = app!(state);
    let auth = bearer(&state, "u1");
    let agent_id = workspace_and_agent!(app, auth);

    let req = test::TestRequest::post()
        .uri(&format!("/w/acme/agents/{}/knowledge", agent_id))
        .insert_header(auth.clone())
        .set_json(json!({
            "type": "faq",
            "question": "What are your hours?",
            "answer": "9-5 Mon-Fri"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let req = test::TestRequest::get()
        .uri(&format!("/w/acme/agents/{}/knowledge", agent_id))
        .insert_header(auth.clone())
        .to_request();
    let items: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["type"], "faq");
    assert_eq!(items[0]["title"], "What are your hours?");
    assert_eq!(items[0]["content"], "Q: What are your hours?\n\nA: 9-5 Mon-Fri");
}

#[actix_web::test]
async fn invalid_submission_never_reaches_the_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(0)
        .mount(&backend)
        .await;

    let state = state_for(&backend);
    let app = app!(state);
    let auth = bearer(&state, "u1");
    let agent_id = workspace_and_agent!(app, auth);

    let req = test::TestRequest::post()
        .uri(&format!("/w/acme/agents/{}/knowledge", agent_id))
        .insert_header(auth.clone())
        .set_json(json!({ "type": "faq", "question": "What are your hours?" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let req = test::TestRequest::get()
        .uri(&format!("/w/acme/agents/{}/knowledge", agent_id))
        .insert_header(auth.clone())
        .to_request();
    let items: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert!(items.is_empty());
}

#[actix_web::test]
async fn unknown_workspace_redirects_to_current_one() {
    let backend = MockServer::start().await;
    let state = state_for(&backend);
    let app = app!(state);
    let auth = bearer(&state, "u1");
    workspace_and_agent!(app, auth);

    let req = test::TestRequest::get()
        .uri("/w/nope/agents?tab=all")
        .insert_header(auth.clone())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        resp.headers().get(header::LOCATION).unwrap(),
        "/w/acme/agents?tab=all"
    );

    // A workspace the caller does not belong to looks the same.
    let stranger = bearer(&state, "u2");
    let req = test::TestRequest::get()
        .uri("/w/acme/agents")
        .insert_header(stranger)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/");
}

#[actix_web::test]
async fn taken_slug_is_a_conflict() {
    let backend = MockServer::start().await;
    let state = state_for(&backend);
    let app = app!(state);
    let auth = bearer(&state, "u1");
    workspace_and_agent!(app, auth);

    let req = test::TestRequest::post()
        .uri("/workspaces")
        .insert_header(bearer(&state, "u2"))
        .set_json(json!({ "name": "Acme Two", "url": "acme" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let req = test::TestRequest::get()
        .uri("/workspaces/check-url?url=acme")
        .insert_header(auth)
        .to_request();
    let availability: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(availability["available"], false);
}

#[actix_web::test]
async fn anonymous_requests_are_rejected() {
    let backend = MockServer::start().await;
    let state = state_for(&backend);
    let app = app!(state);

    let req = test::TestRequest::get().uri("/w/acme/agents").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn crawl_commit_streams_progress_lines() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/crawler/save-chunks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(3)
        .mount(&backend)
        .await;

    let state = state_for(&backend);
    let app = app!(state);
    let auth = bearer(&state, "u1");
    let agent_id = workspace_and_agent!(app, auth);

    let chunks: Vec<Value> = (0..120).map(|i| json!({ "text": format!("chunk {}", i) })).collect();
    let req = test::TestRequest::post()
        .uri(&format!("/w/acme/agents/{}/crawl/commit", agent_id))
        .insert_header(auth.clone())
        .set_json(json!({
            "url": "https://acme.co",
            "title": "Acme site",
            "crawlMethod": "sitemap",
            "totalPages": 12,
            "chunks": chunks
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body = test::read_body(resp).await;
    let events: Vec<Value> = std::str::from_utf8(&body)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let committed: Vec<u64> = events
        .iter()
        .filter(|e| e["event"] == "progress")
        .map(|e| e["committed"].as_u64().unwrap())
        .collect();
    assert_eq!(committed, vec![50, 100, 120]);

    let last = events.last().unwrap();
    assert_eq!(last["event"], "done");
    assert_eq!(last["chunksSaved"], 120);
    assert_eq!(last["item"]["type"], "website");
}

/// Waits for a transactional email with the given template to reach the mock.
async fn delivered(server: &MockServer, template: &str) -> Option<Value> {
    for _ in 0..50 {
        let requests = server.received_requests().await.unwrap_or_default();
        let found = requests
            .iter()
            .filter(|r| r.url.path() == "/transactional")
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .find(|body| body["transactionalId"] == template);
        if found.is_some() {
            return found;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    None
}

#[actix_web::test]
async fn collected_lead_is_listed_and_mailed_to_the_owner() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transactional"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = AppConfig::local(&backend.uri(), SECRET);
    config.email_api_url = backend.uri();
    config.loops_api_key = Some("key".to_string());
    let state = Arc::new(AppState::new(config, Arc::new(MemoryStore::new()), None, None));
    let app = app!(state);
    let auth = bearer(&state, "u1");
    let agent_id = workspace_and_agent!(app, auth);

    let req = test::TestRequest::post()
        .uri(&format!("/w/acme/agents/{}/actions", agent_id))
        .insert_header(auth.clone())
        .set_json(json!({ "type": "collect-leads", "name": "Collect leads" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let action: Value = test::read_body_json(resp).await;
    let action_id = action["id"].as_str().unwrap().to_string();
    assert_eq!(action["status"], "draft");

    let req = test::TestRequest::patch()
        .uri(&format!("/w/acme/agents/{}/actions/{}", agent_id, action_id))
        .insert_header(auth.clone())
        .set_json(json!({ "status": "active" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri(&format!("/public/agents/{}/actions?type=collect-leads", agent_id))
        .to_request();
    let offered: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(offered.len(), 1);

    let req = test::TestRequest::post()
        .uri(&format!("/public/actions/{}/leads", action_id))
        .set_json(json!({ "data": { "name": "Bob", "email": "bob@example.com" } }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let req = test::TestRequest::get()
        .uri(&format!("/w/acme/agents/{}/leads", agent_id))
        .insert_header(auth.clone())
        .to_request();
    let leads: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0]["data"]["email"], "bob@example.com");

    let email = delivered(&backend, "lead-collected").await.expect("lead email sent");
    assert_eq!(email["email"], "u1@acme.co");
    assert_eq!(email["dataVariables"]["leadName"], "Bob");
}

#[actix_web::test]
async fn first_widget_announces_the_agent() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transactional"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = AppConfig::local(&backend.uri(), SECRET);
    config.email_api_url = backend.uri();
    config.loops_api_key = Some("key".to_string());
    let state = Arc::new(AppState::new(config, Arc::new(MemoryStore::new()), None, None));
    let app = app!(state);
    let auth = bearer(&state, "u1");
    let agent_id = workspace_and_agent!(app, auth);

    let req = test::TestRequest::post()
        .uri(&format!("/w/acme/agents/{}/widgets", agent_id))
        .insert_header(auth.clone())
        .set_json(json!({ "name": "Site chat" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let email = delivered(&backend, "agent-deployed").await.expect("deploy email sent");
    assert_eq!(email["dataVariables"]["agentName"], "Support");
    assert_eq!(
        email["dataVariables"]["dashboardLink"],
        format!("http://localhost:3000/dashboard/acme/agents/{}", agent_id)
    );
}
