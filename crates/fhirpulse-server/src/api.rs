//! FHIR-shaped API errors and response bodies.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use fhirpulse_search::SearchError;
use fhirpulse_storage::StorageError;
use fhirpulse_subscriptions::{AuditRecord, SubscriptionError};

pub const FHIR_JSON: &str = "application/fhir+json";

/// Minimal FHIR OperationOutcome representation for API error responses
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationOutcome {
    #[serde(rename = "resourceType")]
    pub resource_type: &'static str,
    pub issue: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationOutcomeIssue {
    /// fatal | error | warning | information
    pub severity: &'static str,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl OperationOutcome {
    pub fn single(
        severity: &'static str,
        code: &'static str,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: "OperationOutcome",
            issue: vec![OperationOutcomeIssue {
                severity,
                code,
                diagnostics: Some(diagnostics.into()),
            }],
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_operation_outcome(&self) -> OperationOutcome {
        match self {
            ApiError::BadRequest(msg) => OperationOutcome::single("error", "invalid", msg),
            ApiError::NotFound(msg) => OperationOutcome::single("error", "not-found", msg),
            ApiError::Conflict(msg) => OperationOutcome::single("error", "conflict", msg),
            ApiError::PreconditionFailed(msg) => OperationOutcome::single("error", "conflict", msg),
            ApiError::NotImplemented(msg) => {
                OperationOutcome::single("error", "not-supported", msg)
            }
            ApiError::Internal(msg) => OperationOutcome::single("fatal", "exception", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        fhir_json(status, &self.to_operation_outcome())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::NotFound { .. } => ApiError::not_found(err.to_string()),
            StorageError::VersionConflict { .. } => ApiError::precondition_failed(err.to_string()),
            StorageError::AlreadyExists { .. } => ApiError::conflict(err.to_string()),
            StorageError::InvalidResource { .. } => ApiError::bad_request(err.to_string()),
            StorageError::ChangeNotification { .. } | StorageError::Internal { .. } => {
                ApiError::internal(err.to_string())
            }
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Storage(e) => e.into(),
            SubscriptionError::InvalidCriteria(e) => e.into(),
            SubscriptionError::InvalidSubscription(msg) => ApiError::bad_request(msg),
            other => ApiError::internal(other.to_string()),
        }
    }
}

/// Serialize `body` with the FHIR JSON content type.
pub fn fhir_json<T: Serialize>(status: StatusCode, body: &T) -> Response {
    let bytes = match serde_json::to_vec(body) {
        Ok(b) => b,
        Err(_) => {
            let fallback = OperationOutcome::single("fatal", "exception", "Serialization failure");
            serde_json::to_vec(&fallback).unwrap_or_else(|_| b"{}".to_vec())
        }
    };
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON))],
        bytes,
    )
        .into_response()
}

/// A searchset or collection Bundle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Bundle {
    #[serde(rename = "resourceType")]
    pub resource_type: &'static str,
    #[serde(rename = "type")]
    pub bundle_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub link: Vec<BundleLink>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub entry: Vec<BundleEntry>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BundleLink {
    pub relation: &'static str,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BundleEntry {
    #[serde(rename = "fullUrl", skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    pub resource: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<BundleEntrySearch>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BundleEntrySearch {
    pub mode: &'static str,
}

impl Bundle {
    pub fn searchset(total: Option<u64>, entries: Vec<BundleEntry>, links: Vec<BundleLink>) -> Self {
        Self {
            resource_type: "Bundle",
            bundle_type: "searchset",
            total,
            link: links,
            entry: entries,
        }
    }

    pub fn collection(entries: Vec<BundleEntry>) -> Self {
        Self {
            resource_type: "Bundle",
            bundle_type: "collection",
            total: None,
            link: Vec::new(),
            entry: entries,
        }
    }
}

impl BundleEntry {
    pub fn matched(full_url: impl Into<String>, resource: Value) -> Self {
        Self {
            full_url: Some(full_url.into()),
            resource,
            search: Some(BundleEntrySearch { mode: "match" }),
        }
    }
}

/// Render a delivery audit record as an `AuditEvent` resource.
pub fn audit_event(record: &AuditRecord) -> Value {
    let mut meta = json!({ "tenant": record.tenant_id });
    if let Some(compartment) = &record.compartment {
        meta["compartment"] = json!({ "reference": compartment });
    }
    let mut event = json!({
        "resourceType": "AuditEvent",
        "id": record.id,
        "meta": meta,
        "type": {
            "system": "http://dicom.nema.org/resources/ontology/DCM",
            "code": "110100",
            "display": "Application Activity",
        },
        "subtype": [{ "code": record.channel }],
        "recorded": record.recorded_at
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default(),
        "outcome": record.outcome,
        "outcomeDesc": record.outcome_desc,
        "entity": [
            { "what": { "reference": format!("Subscription/{}", record.subscription_id) } },
            { "what": { "reference": record.entity } },
        ],
        "extension": [{
            "url": "https://fhirpulse.dev/fhir/StructureDefinition/delivery-attempt",
            "valueInteger": record.attempt,
        }],
    });
    if let Some(status) = record.http_status
        && let Some(ext) = event["extension"].as_array_mut()
    {
        ext.push(json!({
            "url": "https://fhirpulse.dev/fhir/StructureDefinition/http-status",
            "valueInteger": status,
        }));
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_statuses() {
        let cases = [
            (StorageError::not_found("Patient", "1"), StatusCode::NOT_FOUND),
            (StorageError::version_conflict("1", "2"), StatusCode::PRECONDITION_FAILED),
            (StorageError::already_exists("Patient", "1"), StatusCode::CONFLICT),
            (StorageError::invalid_resource("bad"), StatusCode::BAD_REQUEST),
            (StorageError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn malformed_query_is_bad_request() {
        let err = ApiError::from(SearchError::malformed("_count", "ten"));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        let outcome = err.to_operation_outcome();
        assert_eq!(outcome.issue[0].code, "invalid");
    }

    #[test]
    fn operation_outcome_serializes_fhir_shape() {
        let body = serde_json::to_value(OperationOutcome::single("error", "not-found", "gone"))
            .unwrap();
        assert_eq!(body["resourceType"], "OperationOutcome");
        assert_eq!(body["issue"][0]["diagnostics"], "gone");
    }

    #[test]
    fn searchset_omits_total_when_absent() {
        let bundle = serde_json::to_value(Bundle::searchset(None, vec![], vec![])).unwrap();
        assert_eq!(bundle["type"], "searchset");
        assert!(bundle.get("total").is_none());
        assert!(bundle.get("entry").is_none());
    }
}
