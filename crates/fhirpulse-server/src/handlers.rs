use axum::{
    Json,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Map, Value};

use fhirpulse_search::{
    Criteria, SearchParameterRegistry, TotalMode, format_criteria, matches_criteria,
    parse_criteria, sort_resources,
};
use fhirpulse_storage::StoredResource;

use crate::api::{ApiError, Bundle, BundleEntry, BundleLink, audit_event, fhir_json};
use crate::state::AppState;

pub const TENANT_HEADER: &str = "x-tenant";

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

pub async fn create_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
    Json(mut payload): Json<Value>,
) -> Result<Response, ApiError> {
    prepare_body(&mut payload, &resource_type, None, &headers)?;
    let stored = state.storage.create(&payload).await?;
    tracing::debug!(reference = %stored.reference(), "resource created");

    let mut response = resource_response(StatusCode::CREATED, &stored);
    let location = format!("{}/_history/{}", stored.reference(), stored.version_id);
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}

pub async fn read_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let stored = state
        .storage
        .read(&resource_type, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("{resource_type}/{id}")))?;
    Ok(resource_response(StatusCode::OK, &stored))
}

pub async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(mut payload): Json<Value>,
) -> Result<Response, ApiError> {
    prepare_body(&mut payload, &resource_type, Some(&id), &headers)?;
    if payload.pointer("/meta/tenant").is_none()
        && let Some(tenant) = state
            .storage
            .read(&resource_type, &id)
            .await?
            .and_then(|previous| previous.resource.pointer("/meta/tenant").cloned())
    {
        set_meta_tenant(&mut payload, tenant)?;
    }
    let if_match = headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(parse_etag);
    let stored = state.storage.update(&payload, if_match).await?;
    tracing::debug!(reference = %stored.reference(), version = %stored.version_id, "resource updated");
    Ok(resource_response(StatusCode::OK, &stored))
}

pub async fn delete_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let deleted = state.storage.delete(&resource_type, &id).await?;
    tracing::debug!(reference = %deleted.reference(), "resource deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn search_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let criteria = parse_criteria(&resource_type, query.as_deref(), &state.search)?;
    let tenant = tenant_header(&headers);

    let mut resources: Vec<Value> = state
        .storage
        .list(&criteria.resource_type, tenant.as_deref())
        .await?
        .into_iter()
        .map(|stored| stored.resource)
        .filter(|resource| matches_criteria(&criteria, resource, &state.search))
        .collect();
    sort_resources(
        &mut resources,
        &criteria.sort_rules,
        &criteria.resource_type,
        &state.search,
    );

    let total = resources.len();
    let count = criteria
        .count
        .map(|c| c as usize)
        .unwrap_or(state.search_settings.default_count)
        .min(state.search_settings.max_count);
    let page = criteria.page.unwrap_or(0) as usize;

    let entries = resources
        .into_iter()
        .skip(page.saturating_mul(count))
        .take(count)
        .map(|resource| {
            let full_url = format!(
                "{}/{}",
                criteria.resource_type,
                resource.get("id").and_then(Value::as_str).unwrap_or_default()
            );
            BundleEntry::matched(full_url, project_fields(resource, &criteria.fields))
        })
        .collect();

    let mut links = vec![BundleLink {
        relation: "self",
        url: self_link(&criteria, query.as_deref()),
    }];
    if count > 0 && (page + 1).saturating_mul(count) < total {
        links.push(BundleLink {
            relation: "next",
            url: page_link(&criteria, page + 1, count, &state.search),
        });
    }

    let total = match criteria.total {
        Some(TotalMode::None) => None,
        _ => Some(total as u64),
    };
    Ok(fhir_json(
        StatusCode::OK,
        &Bundle::searchset(total, entries, links),
    ))
}

/// Delivery audit records for one subscription, as `AuditEvent`s.
pub async fn subscription_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let subscriptions = state
        .subscriptions
        .as_ref()
        .ok_or_else(|| ApiError::not_implemented("subscription delivery is disabled"))?;
    if state.storage.read("Subscription", &id).await?.is_none() {
        return Err(ApiError::not_found(format!("Subscription/{id}")));
    }

    let records = subscriptions.audit().list_for_subscription(&id).await?;
    let entries = records
        .iter()
        .map(|record| BundleEntry {
            full_url: Some(format!("AuditEvent/{}", record.id)),
            resource: audit_event(record),
            search: None,
        })
        .collect();
    Ok(fhir_json(StatusCode::OK, &Bundle::collection(entries)))
}

fn resource_response(status: StatusCode, stored: &StoredResource) -> Response {
    let mut response = fhir_json(status, &stored.resource);
    if let Ok(etag) = HeaderValue::from_str(&format!("W/\"{}\"", stored.version_id)) {
        response.headers_mut().insert(header::ETAG, etag);
    }
    response
}

/// Check the body against the route and apply the `X-Tenant` header.
fn prepare_body(
    payload: &mut Value,
    resource_type: &str,
    id: Option<&str>,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let Some(body) = payload.as_object_mut() else {
        return Err(ApiError::bad_request("resource must be a JSON object"));
    };

    match body.get("resourceType").and_then(Value::as_str) {
        Some(rt) if rt != resource_type => {
            return Err(ApiError::bad_request(format!(
                "resourceType {rt} does not match endpoint {resource_type}"
            )));
        }
        Some(_) => {}
        None => {
            body.insert("resourceType".into(), Value::String(resource_type.into()));
        }
    }

    if let Some(id) = id {
        match body.get("id").and_then(Value::as_str) {
            Some(body_id) if body_id != id => {
                return Err(ApiError::bad_request(format!(
                    "resource id {body_id} does not match {id}"
                )));
            }
            Some(_) => {}
            None => {
                body.insert("id".into(), Value::String(id.into()));
            }
        }
    }

    if let Some(tenant) = tenant_header(headers) {
        set_meta_tenant(payload, Value::String(tenant))?;
    }
    Ok(())
}

fn set_meta_tenant(payload: &mut Value, tenant: Value) -> Result<(), ApiError> {
    let meta = payload
        .as_object_mut()
        .ok_or_else(|| ApiError::bad_request("resource must be a JSON object"))?
        .entry("meta")
        .or_insert_with(|| Value::Object(Map::new()));
    match meta.as_object_mut() {
        Some(meta) => {
            meta.insert("tenant".into(), tenant);
            Ok(())
        }
        None => Err(ApiError::bad_request("meta must be a JSON object")),
    }
}

fn tenant_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `W/"3"` and `"3"` both name version `3`.
fn parse_etag(raw: &str) -> &str {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"')
}

/// Keep only the requested top-level elements plus the mandatory ones.
fn project_fields(resource: Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return resource;
    }
    let Value::Object(map) = resource else {
        return resource;
    };
    let projected: Map<String, Value> = map
        .into_iter()
        .filter(|(key, _)| {
            matches!(key.as_str(), "resourceType" | "id" | "meta")
                || fields.iter().any(|f| f == key)
        })
        .collect();
    Value::Object(projected)
}

fn self_link(criteria: &Criteria, query: Option<&str>) -> String {
    match query.filter(|q| !q.is_empty()) {
        Some(q) => format!("{}?{q}", criteria.resource_type),
        None => criteria.resource_type.clone(),
    }
}

fn page_link(
    criteria: &Criteria,
    page: usize,
    count: usize,
    registry: &SearchParameterRegistry,
) -> String {
    let mut next = criteria.clone();
    next.page = u32::try_from(page).ok();
    next.count = u32::try_from(count).ok();
    format!(
        "{}{}",
        criteria.resource_type,
        format_criteria(&next, registry)
    )
}
