//! Router-level tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fhirpulse_server::{AppConfig, AppState, build_app, build_state_with_callbacks};
use fhirpulse_subscriptions::InProcessCallbackRuntime;

const FHIR_JSON: &str = "application/fhir+json";

async fn app() -> (Router, AppState) {
    let mut cfg = AppConfig::default();
    cfg.subscriptions.poll_interval_ms = 10;
    cfg.subscriptions.webhook_timeout_ms = 5_000;
    cfg.subscriptions.connect_timeout_ms = 1_000;
    let state = build_state_with_callbacks(&cfg, Arc::new(InProcessCallbackRuntime::new()))
        .await
        .expect("state builds");
    (build_app(&cfg, state.clone()), state)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let res = app.clone().oneshot(req).await.expect("infallible");
    let status = res.status();
    let headers = res.headers().clone();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, headers, body)
}

fn post(uri: &str, tenant: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, FHIR_JSON);
    if let Some(tenant) = tenant {
        builder = builder.header("x-tenant", tenant);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn patient(family: &str, birth_date: &str, gender: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "name": [{ "family": family }],
        "birthDate": birth_date,
        "gender": gender,
    })
}

#[tokio::test]
async fn healthz_echoes_request_id() {
    let (app, _) = app().await;
    let req = Request::get("/healthz")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(headers["x-request-id"], "req-42");
}

#[tokio::test]
async fn crud_round_trip_with_versioning() {
    let (app, _) = app().await;

    let (status, headers, created) =
        send(&app, post("/Patient", None, patient("Smith", "1990-01-01", "female"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers[header::CONTENT_TYPE], FHIR_JSON);
    let id = created["id"].as_str().expect("assigned id").to_string();
    let version = created["meta"]["versionId"].as_str().unwrap().to_string();
    assert_eq!(headers[header::ETAG], format!("W/\"{version}\"").as_str());
    assert!(
        headers[header::LOCATION]
            .to_str()
            .unwrap()
            .starts_with(&format!("Patient/{id}/_history/"))
    );

    let (status, _, read) = send(&app, get(&format!("/Patient/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read["name"][0]["family"], "Smith");

    let mut changed = read.clone();
    changed["gender"] = json!("other");
    let stale = Request::put(format!("/Patient/{id}"))
        .header(header::CONTENT_TYPE, FHIR_JSON)
        .header(header::IF_MATCH, "W/\"does-not-exist\"")
        .body(Body::from(changed.to_string()))
        .unwrap();
    let (status, _, outcome) = send(&app, stale).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(outcome["resourceType"], "OperationOutcome");

    let fresh = Request::put(format!("/Patient/{id}"))
        .header(header::CONTENT_TYPE, FHIR_JSON)
        .header(header::IF_MATCH, format!("W/\"{version}\""))
        .body(Body::from(changed.to_string()))
        .unwrap();
    let (status, _, updated) = send(&app, fresh).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["gender"], "other");
    assert_ne!(updated["meta"]["versionId"], json!(version));

    let delete = Request::delete(format!("/Patient/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, outcome) = send(&app, get(&format!("/Patient/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(outcome["issue"][0]["code"], "not-found");
}

#[tokio::test]
async fn create_rejects_mismatched_type_and_media_type() {
    let (app, _) = app().await;

    let (status, _, _) = send(
        &app,
        post("/Patient", None, json!({ "resourceType": "Observation" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let plain = Request::post("/Patient")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("hello"))
        .unwrap();
    let (status, _, _) = send(&app, plain).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn search_filters_sorts_and_pages() {
    let (app, _) = app().await;
    for (family, born, gender) in [
        ("Adams", "1995-04-01", "female"),
        ("Baker", "2003-07-12", "male"),
        ("Clark", "2001-02-03", "female"),
    ] {
        let (status, _, _) = send(&app, post("/Patient", None, patient(family, born, gender))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, _, bundle) = send(
        &app,
        get("/Patient?birthdate=gt2000-01-01&_sort=-birthdate&_count=1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bundle["resourceType"], "Bundle");
    assert_eq!(bundle["type"], "searchset");
    assert_eq!(bundle["total"], 2);
    let entries = bundle["entry"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["resource"]["name"][0]["family"], "Baker");
    assert_eq!(entries[0]["search"]["mode"], "match");
    let next = bundle["link"]
        .as_array()
        .unwrap()
        .iter()
        .find(|l| l["relation"] == "next")
        .expect("next link");
    assert!(next["url"].as_str().unwrap().contains("_page=1"));

    let (_, _, page_two) = send(
        &app,
        get("/Patient?birthdate=gt2000-01-01&_sort=-birthdate&_count=1&_page=1"),
    )
    .await;
    assert_eq!(page_two["entry"][0]["resource"]["name"][0]["family"], "Clark");

    let (_, _, projected) = send(&app, get("/Patient?gender=male&_fields=gender&_total=none")).await;
    assert!(projected.get("total").is_none());
    let resource = &projected["entry"][0]["resource"];
    assert_eq!(resource["gender"], "male");
    assert!(resource.get("name").is_none());
    assert!(resource.get("id").is_some());

    let (_, _, summary) = send(&app, get("/Patient?_count=0")).await;
    assert_eq!(summary["total"], 3);
    assert!(summary.get("entry").is_none());
    let relations: Vec<_> = summary["link"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["relation"].as_str().unwrap())
        .collect();
    assert_eq!(relations, vec!["self"]);
}

#[tokio::test]
async fn malformed_search_is_bad_request() {
    let (app, _) = app().await;
    let (status, _, outcome) = send(&app, get("/Patient?_count=ten")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(outcome["issue"][0]["code"], "invalid");
}

#[tokio::test]
async fn tenant_header_scopes_writes_and_search() {
    let (app, _) = app().await;
    let (_, _, created) = send(
        &app,
        post("/Patient", Some("t1"), patient("Evans", "1980-01-01", "male")),
    )
    .await;
    assert_eq!(created["meta"]["tenant"], "t1");
    send(
        &app,
        post("/Patient", Some("t2"), patient("Fox", "1981-01-01", "male")),
    )
    .await;

    let req = Request::get("/Patient")
        .header("x-tenant", "t1")
        .body(Body::empty())
        .unwrap();
    let (_, _, bundle) = send(&app, req).await;
    assert_eq!(bundle["total"], 1);
    assert_eq!(bundle["entry"][0]["resource"]["name"][0]["family"], "Evans");
}

#[tokio::test]
async fn update_without_tenant_keeps_the_stored_tenant() {
    let (app, _) = app().await;
    let (_, _, created) = send(
        &app,
        post("/Patient", Some("t1"), patient("Green", "1970-01-01", "female")),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();

    let mut changed = created.clone();
    changed["meta"].as_object_mut().unwrap().remove("tenant");
    changed["gender"] = json!("other");
    let put = Request::put(format!("/Patient/{id}"))
        .header(header::CONTENT_TYPE, FHIR_JSON)
        .body(Body::from(changed.to_string()))
        .unwrap();
    let (status, _, updated) = send(&app, put).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["meta"]["tenant"], "t1");

    let req = Request::get("/Patient?gender=other")
        .header("x-tenant", "t1")
        .body(Body::empty())
        .unwrap();
    let (_, _, bundle) = send(&app, req).await;
    assert_eq!(bundle["total"], 1);
}

#[tokio::test]
async fn audit_of_unknown_subscription_is_not_found() {
    let (app, _) = app().await;
    let (status, _, _) = send(&app, get("/Subscription/missing/$audit")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn matching_write_is_delivered_and_audited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (app, state) = app().await;
    let subscription = json!({
        "resourceType": "Subscription",
        "status": "active",
        "reason": "female patients",
        "criteria": "Patient?gender=female",
        "channel": { "type": "rest-hook", "endpoint": format!("{}/hook", server.uri()) }
    });
    let (status, _, sub) = send(&app, post("/Subscription", Some("t1"), subscription)).await;
    assert_eq!(status, StatusCode::CREATED);
    let sub_id = sub["id"].as_str().unwrap().to_string();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let processor = tokio::spawn(
        state
            .subscriptions
            .as_ref()
            .expect("subscriptions enabled")
            .processor()
            .run(shutdown_rx),
    );

    send(
        &app,
        post("/Patient", Some("t1"), patient("Green", "1970-01-01", "male")),
    )
    .await;
    send(
        &app,
        post("/Patient", Some("t1"), patient("Hill", "1971-01-01", "female")),
    )
    .await;

    let audit_uri = format!("/Subscription/{sub_id}/$audit");
    let mut audit = Value::Null;
    for _ in 0..200 {
        let (status, _, body) = send(&app, get(&audit_uri)).await;
        assert_eq!(status, StatusCode::OK);
        if body["entry"].as_array().is_some_and(|e| !e.is_empty()) {
            audit = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    processor.await.unwrap().unwrap();

    let entries = audit["entry"].as_array().expect("audit recorded");
    assert_eq!(entries.len(), 1);
    let event = &entries[0]["resource"];
    assert_eq!(event["resourceType"], "AuditEvent");
    assert_eq!(event["outcome"], "0");
    assert!(event["outcomeDesc"].as_str().unwrap().contains("Success"));
    assert_eq!(event["meta"]["tenant"], "t1");
    assert_eq!(
        event["entity"][0]["what"]["reference"],
        format!("Subscription/{sub_id}")
    );
    server.verify().await;
}
