//! Evaluation of criteria against resource snapshots.
//!
//! Each filter code is resolved through the registry to one or more element
//! paths (`name.family`, `effectivePeriod.start`); arrays are flattened along
//! the way. Codes the registry does not know are read as the top-level
//! element of the same name and compared as tokens.
//!
//! Comma-separated filter values are alternatives. Negated operators (`ne`,
//! `:not`, `:not-in`) hold when no alternative matches.

use std::cmp::Ordering;

use serde_json::Value;

use crate::criteria::{Criteria, Filter, SortRule};
use crate::parameters::{Operator, SearchParameterType};
use crate::registry::SearchParameterRegistry;

/// Whether `resource` satisfies the resource type and every filter.
pub fn matches_criteria(
    criteria: &Criteria,
    resource: &Value,
    registry: &SearchParameterRegistry,
) -> bool {
    let resource_type = resource.get("resourceType").and_then(Value::as_str);
    if resource_type != Some(criteria.resource_type.as_str()) {
        return false;
    }
    criteria
        .filters
        .iter()
        .all(|filter| matches_filter(&criteria.resource_type, filter, resource, registry))
}

pub fn matches_filter(
    resource_type: &str,
    filter: &Filter,
    resource: &Value,
    registry: &SearchParameterRegistry,
) -> bool {
    let (kind, paths) = match registry.get(resource_type, filter.base_code()) {
        Some(def) => (Some(def.kind), def.paths),
        None => (None, vec![filter.base_code().to_string()]),
    };
    let values = resolve_first(resource, &paths);

    if filter.operator == Operator::Missing {
        let want_missing = filter.value.eq_ignore_ascii_case("true");
        return values.is_empty() == want_missing;
    }

    let any = filter.value.split(',').any(|query| {
        values
            .iter()
            .any(|value| test_value(kind, filter.operator, value, query))
    });

    if filter.operator.is_negated() { !any } else { any }
}

/// Sort resources by the given rules. Resources without a value sort last.
pub fn sort_resources(
    resources: &mut [Value],
    rules: &[SortRule],
    resource_type: &str,
    registry: &SearchParameterRegistry,
) {
    if rules.is_empty() {
        return;
    }
    let paths: Vec<Vec<String>> = rules
        .iter()
        .map(|rule| match registry.get(resource_type, &rule.code) {
            Some(def) => def.paths,
            None => vec![rule.code.clone()],
        })
        .collect();

    resources.sort_by(|a, b| {
        for (rule, paths) in rules.iter().zip(&paths) {
            let ka = sort_key(a, paths);
            let kb = sort_key(b, paths);
            let ord = match (ka, kb) {
                (Some(x), Some(y)) => {
                    let ord = x.compare(&y);
                    if rule.descending { ord.reverse() } else { ord }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

enum SortKey {
    Number(f64),
    Text(String),
}

impl SortKey {
    fn compare(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
            (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
        }
    }
}

fn sort_key(resource: &Value, paths: &[String]) -> Option<SortKey> {
    let values = resolve_first(resource, paths);
    let first = values.first()?;
    if let Some(n) = number_of(first) {
        return Some(SortKey::Number(n));
    }
    let mut leaves = Vec::new();
    string_leaves(first, &mut leaves);
    leaves
        .first()
        .map(|s| SortKey::Text(s.to_lowercase()))
}

fn resolve_first<'v>(resource: &'v Value, paths: &[String]) -> Vec<&'v Value> {
    paths
        .iter()
        .map(|path| resolve(resource, path))
        .find(|values| !values.is_empty())
        .unwrap_or_default()
}

fn resolve<'v>(resource: &'v Value, path: &str) -> Vec<&'v Value> {
    let mut current = vec![resource];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            if let Some(child) = value.get(segment) {
                flatten(child, &mut next);
            }
        }
        current = next;
    }
    current
}

fn flatten<'v>(value: &'v Value, out: &mut Vec<&'v Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        Value::Null => {}
        other => out.push(other),
    }
}

fn test_value(kind: Option<SearchParameterType>, op: Operator, value: &Value, query: &str) -> bool {
    match op {
        Operator::Equals
        | Operator::NotEquals
        | Operator::Not
        | Operator::In
        | Operator::NotIn => equals(kind, value, query),
        Operator::GreaterThan | Operator::StartsAfter => {
            ordering(kind, value, query) == Some(Ordering::Greater)
        }
        Operator::LessThan | Operator::EndsBefore => {
            ordering(kind, value, query) == Some(Ordering::Less)
        }
        Operator::GreaterThanOrEquals => matches!(
            ordering(kind, value, query),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::LessThanOrEquals => matches!(
            ordering(kind, value, query),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Approximately => approximately(kind, value, query),
        Operator::Contains | Operator::Text => {
            let needle = query.to_lowercase();
            let mut leaves = Vec::new();
            string_leaves(value, &mut leaves);
            leaves.iter().any(|s| s.to_lowercase().contains(&needle))
        }
        Operator::Exact => {
            let mut leaves = Vec::new();
            string_leaves(value, &mut leaves);
            leaves.iter().any(|s| *s == query)
        }
        Operator::Above => plain_strings(kind, value)
            .iter()
            .any(|candidate| query.starts_with(candidate.as_str())),
        Operator::Below => plain_strings(kind, value)
            .iter()
            .any(|candidate| candidate.starts_with(query)),
        Operator::Identifier => value
            .get("identifier")
            .is_some_and(|identifier| token_equals(identifier, query)),
        Operator::OfType => of_type(value, query),
        Operator::Missing => false,
    }
}

fn equals(kind: Option<SearchParameterType>, value: &Value, query: &str) -> bool {
    use SearchParameterType as T;

    match kind {
        Some(T::String) => {
            let needle = query.to_lowercase();
            let mut leaves = Vec::new();
            string_leaves(value, &mut leaves);
            leaves.iter().any(|s| s.to_lowercase().starts_with(&needle))
        }
        Some(T::Number) => number_matches(value, query),
        Some(T::Quantity) => quantity_matches(value, query),
        Some(T::Date) => {
            date_text(value).is_some_and(|date| date_cmp(date, query) == Ordering::Equal)
        }
        Some(T::Reference) => reference_equals(value, query),
        Some(T::Uri) => value.as_str() == Some(query),
        Some(T::Token) | None => token_equals(value, query),
        Some(T::Composite) | Some(T::Special) => {
            let mut leaves = Vec::new();
            string_leaves(value, &mut leaves);
            leaves.contains(&query)
        }
    }
}

fn ordering(kind: Option<SearchParameterType>, value: &Value, query: &str) -> Option<Ordering> {
    use SearchParameterType as T;

    match kind {
        Some(T::Number) | Some(T::Quantity) => {
            let query = query.split('|').next().unwrap_or(query);
            number_of(value)?.partial_cmp(&query.parse::<f64>().ok()?)
        }
        Some(T::Date) => Some(date_cmp(date_text(value)?, query)),
        _ => {
            let mut leaves = Vec::new();
            string_leaves(value, &mut leaves);
            let first = leaves.first()?;
            Some(first.to_lowercase().cmp(&query.to_lowercase()))
        }
    }
}

fn approximately(kind: Option<SearchParameterType>, value: &Value, query: &str) -> bool {
    match kind {
        Some(SearchParameterType::Date) => {
            date_text(value).is_some_and(|date| date_cmp(date, query) == Ordering::Equal)
        }
        _ => {
            let query = query.split('|').next().unwrap_or(query);
            match (number_of(value), query.parse::<f64>()) {
                (Some(actual), Ok(target)) => (actual - target).abs() <= target.abs() * 0.1,
                _ => false,
            }
        }
    }
}

/// Numbers match within half a unit of the query's last significant digit.
fn number_matches(value: &Value, query: &str) -> bool {
    let Some(actual) = number_of(value) else {
        return false;
    };
    let Ok(target) = query.parse::<f64>() else {
        return false;
    };
    let decimals = query
        .split_once('.')
        .map_or(0, |(_, fraction)| fraction.len() as i32);
    let tolerance = 0.5 * 10f64.powi(-decimals);
    (actual - target).abs() <= tolerance + f64::EPSILON
}

/// `number|system|code` where system and code are optional.
fn quantity_matches(value: &Value, query: &str) -> bool {
    let mut parts = query.splitn(3, '|');
    let number = parts.next().unwrap_or_default();
    let system = parts.next().filter(|s| !s.is_empty());
    let code = parts.next().filter(|s| !s.is_empty());

    if !number_matches(value, number) {
        return false;
    }
    if let Some(system) = system
        && value.get("system").and_then(Value::as_str) != Some(system)
    {
        return false;
    }
    if let Some(code) = code {
        let unit_code = value.get("code").and_then(Value::as_str);
        let unit = value.get("unit").and_then(Value::as_str);
        if unit_code != Some(code) && unit != Some(code) {
            return false;
        }
    }
    true
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Object(obj) => obj.get("value").and_then(number_of),
        _ => None,
    }
}

fn date_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Object(obj) => obj.get("start").and_then(Value::as_str),
        _ => None,
    }
}

/// Compare two ISO-8601 texts at the precision of the less precise one.
fn date_cmp(actual: &str, query: &str) -> Ordering {
    let mut n = actual.len().min(query.len());
    while !(actual.is_char_boundary(n) && query.is_char_boundary(n)) {
        n -= 1;
    }
    actual[..n].cmp(&query[..n])
}

fn string_leaves<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| string_leaves(item, out)),
        Value::Object(obj) => obj.values().for_each(|item| string_leaves(item, out)),
        _ => {}
    }
}

struct TokenCandidate<'v> {
    system: Option<&'v str>,
    code: String,
}

fn token_candidates(value: &Value) -> Vec<TokenCandidate<'_>> {
    let mut out = Vec::new();
    match value {
        Value::String(s) => out.push(TokenCandidate {
            system: None,
            code: s.clone(),
        }),
        Value::Bool(b) => out.push(TokenCandidate {
            system: None,
            code: b.to_string(),
        }),
        Value::Number(n) => out.push(TokenCandidate {
            system: None,
            code: n.to_string(),
        }),
        Value::Object(obj) => {
            let system = obj.get("system").and_then(Value::as_str);
            if let Some(codings) = obj.get("coding").and_then(Value::as_array) {
                for coding in codings {
                    out.extend(token_candidates(coding));
                }
            }
            for key in ["code", "value"] {
                if let Some(code) = obj.get(key).and_then(Value::as_str) {
                    out.push(TokenCandidate {
                        system,
                        code: code.to_string(),
                    });
                }
            }
        }
        _ => {}
    }
    out
}

fn token_equals(value: &Value, query: &str) -> bool {
    let candidates = token_candidates(value);
    match query.split_once('|') {
        Some(("", code)) => candidates
            .iter()
            .any(|c| c.system.is_none() && c.code == code),
        Some((system, "")) => candidates.iter().any(|c| c.system == Some(system)),
        Some((system, code)) => candidates
            .iter()
            .any(|c| c.system == Some(system) && c.code == code),
        None => candidates.iter().any(|c| c.code == query),
    }
}

fn reference_equals(value: &Value, query: &str) -> bool {
    let reference = match value {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => match obj.get("reference").and_then(Value::as_str) {
            Some(r) => r,
            None => return false,
        },
        _ => return false,
    };
    reference == query || reference.ends_with(&format!("/{query}"))
}

fn plain_strings(kind: Option<SearchParameterType>, value: &Value) -> Vec<String> {
    match kind {
        Some(SearchParameterType::Token) => {
            token_candidates(value).into_iter().map(|c| c.code).collect()
        }
        Some(SearchParameterType::Reference) => value
            .get("reference")
            .and_then(Value::as_str)
            .map(|r| vec![r.to_string()])
            .unwrap_or_default(),
        _ => {
            let mut leaves = Vec::new();
            string_leaves(value, &mut leaves);
            leaves.into_iter().map(str::to_string).collect()
        }
    }
}

/// `system|code|value` on an Identifier's type and value.
fn of_type(value: &Value, query: &str) -> bool {
    let parts: Vec<&str> = query.splitn(3, '|').collect();
    let [system, code, expected] = parts.as_slice() else {
        return false;
    };
    if value.get("value").and_then(Value::as_str) != Some(*expected) {
        return false;
    }
    value
        .get("type")
        .and_then(|t| t.get("coding"))
        .and_then(Value::as_array)
        .is_some_and(|codings| {
            codings.iter().any(|coding| {
                coding.get("system").and_then(Value::as_str) == Some(*system)
                    && coding.get("code").and_then(Value::as_str) == Some(*code)
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_criteria_string;
    use serde_json::json;

    fn matches(criteria: &str, resource: &Value) -> bool {
        let registry = SearchParameterRegistry::with_defaults();
        let criteria = parse_criteria_string(criteria, &registry).unwrap();
        matches_criteria(&criteria, resource, &registry)
    }

    fn alice() -> Value {
        json!({
            "resourceType": "Patient",
            "id": "p1",
            "active": true,
            "gender": "female",
            "birthDate": "1990-04-12",
            "name": [{ "given": ["Alice"], "family": "Smith" }],
            "identifier": [{ "system": "http://acme.org/mrn", "value": "123" }],
            "managingOrganization": { "reference": "Organization/o1" }
        })
    }

    #[test]
    fn resource_type_only_matches_everything_of_that_type() {
        assert!(matches("Patient", &alice()));
        assert!(!matches("Observation", &alice()));
    }

    #[test]
    fn string_equals_is_case_insensitive_prefix() {
        assert!(matches("Patient?name=ali", &alice()));
        assert!(matches("Patient?family=SMITH", &alice()));
        assert!(!matches("Patient?name=bob", &alice()));
        assert!(matches("Patient?name:contains=mit", &alice()));
        assert!(!matches("Patient?name:exact=alice", &alice()));
        assert!(matches("Patient?name:exact=Alice", &alice()));
    }

    #[test]
    fn tokens_match_code_and_system() {
        assert!(matches("Patient?gender=female", &alice()));
        assert!(matches("Patient?gender=male,female", &alice()));
        assert!(matches("Patient?active=true", &alice()));
        assert!(matches("Patient?identifier=http://acme.org/mrn|123", &alice()));
        assert!(matches("Patient?identifier=123", &alice()));
        assert!(!matches("Patient?identifier=http://other.org|123", &alice()));
        assert!(matches("Patient?gender:not=male", &alice()));
        assert!(!matches("Patient?gender:not=female", &alice()));
        assert!(matches("Patient?_id=p1", &alice()));
    }

    #[test]
    fn dates_compare_at_query_precision() {
        assert!(matches("Patient?birthdate=1990", &alice()));
        assert!(matches("Patient?birthdate=1990-04-12", &alice()));
        assert!(matches("Patient?birthdate=gt1989-12-31", &alice()));
        assert!(!matches("Patient?birthdate=gt1990", &alice()));
        assert!(matches("Patient?birthdate=ge1990", &alice()));
        assert!(matches("Patient?birthdate=lt2000-01-01", &alice()));
        assert!(matches("Patient?birthdate=ne1991", &alice()));
    }

    #[test]
    fn references_match_full_or_bare_id() {
        assert!(matches("Patient?organization=Organization/o1", &alice()));
        assert!(matches("Patient?organization=o1", &alice()));
        assert!(!matches("Patient?organization=o2", &alice()));
    }

    #[test]
    fn missing_checks_presence() {
        assert!(matches("Patient?birthdate:missing=false", &alice()));
        assert!(matches("Patient?address-city:missing=true", &alice()));
        assert!(!matches("Patient?gender:missing=true", &alice()));
    }

    #[test]
    fn numbers_and_quantities() {
        let risk = json!({
            "resourceType": "RiskAssessment",
            "prediction": [{ "probabilityDecimal": 0.8 }]
        });
        assert!(matches("RiskAssessment?probability=gt0.5", &risk));
        assert!(!matches("RiskAssessment?probability=lt0.5", &risk));
        assert!(matches("RiskAssessment?probability=0.8", &risk));
        assert!(matches("RiskAssessment?probability=ap0.75", &risk));

        let obs = json!({
            "resourceType": "Observation",
            "status": "final",
            "valueQuantity": { "value": 5.4, "system": "http://unitsofmeasure.org", "code": "mg" }
        });
        assert!(matches("Observation?value-quantity=5.4|http://unitsofmeasure.org|mg", &obs));
        assert!(matches("Observation?value-quantity=ge5", &obs));
        assert!(!matches("Observation?value-quantity=5.4||kg", &obs));
    }

    #[test]
    fn all_filters_must_hold() {
        let obs = json!({ "resourceType": "Observation", "status": "preliminary" });
        assert!(!matches("Observation?status=final", &obs));
        assert!(matches("Observation?status=preliminary", &obs));
        assert!(!matches("Observation?status=preliminary&code=1234-5", &obs));
    }

    #[test]
    fn unknown_codes_read_top_level_elements() {
        let task = json!({ "resourceType": "Task", "status": "ready", "priority": "urgent" });
        assert!(matches("Task?priority=urgent", &task));
        assert!(!matches("Task?priority=routine", &task));
    }

    #[test]
    fn uri_above_and_below() {
        let vs = json!({ "resourceType": "ValueSet", "url": "http://acme.org/fhir/ValueSet/1" });
        assert!(matches("ValueSet?url:below=http://acme.org", &vs));
        assert!(!matches("ValueSet?url:below=http://other.org", &vs));
        assert!(matches(
            "ValueSet?url:above=http://acme.org/fhir/ValueSet/1/extra",
            &vs
        ));
    }

    #[test]
    fn sorts_by_rules_with_missing_last() {
        let registry = SearchParameterRegistry::with_defaults();
        let mut patients = vec![
            json!({ "resourceType": "Patient", "id": "a", "birthDate": "2001-01-01" }),
            json!({ "resourceType": "Patient", "id": "b" }),
            json!({ "resourceType": "Patient", "id": "c", "birthDate": "1999-01-01" }),
        ];
        sort_resources(
            &mut patients,
            &[SortRule::descending("birthdate")],
            "Patient",
            &registry,
        );
        let ids: Vec<_> = patients.iter().map(|p| p["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }
}
