//! Search parameter vocabulary.
//!
//! Maps `(resource_type, code)` to a parameter definition. The parser uses
//! it to decide whether a value may carry an ordinal prefix, the evaluator to
//! find the element a code refers to. Parameters registered as common apply
//! to every resource type.
//!
//! The registry is an explicit shared component: callers hold it behind an
//! `Arc` and may add or remove parameters at runtime; lookups always see the
//! current set.

use dashmap::DashMap;

use crate::parameters::{SearchParameterDefinition, SearchParameterType};

#[derive(Debug, Default)]
pub struct SearchParameterRegistry {
    /// Parameters indexed by (resource_type, code) as composite key
    by_resource: DashMap<(String, String), SearchParameterDefinition>,
    /// Common parameters (apply to all resources)
    common: DashMap<String, SearchParameterDefinition>,
}

impl SearchParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in vocabulary.
    pub fn with_defaults() -> Self {
        use SearchParameterType::*;

        let registry = Self::new();
        registry.register_common(SearchParameterDefinition::new("_id", Token, "id"));
        registry.register_common(SearchParameterDefinition::new(
            "_lastUpdated",
            Date,
            "meta.lastUpdated",
        ));
        registry.register_common(SearchParameterDefinition::new("_tag", Token, "meta.tag"));
        registry.register_common(SearchParameterDefinition::new(
            "_profile",
            Uri,
            "meta.profile",
        ));

        let defs: &[(&str, &str, SearchParameterType, &[&str])] = &[
            ("Patient", "name", String, &["name"]),
            ("Patient", "family", String, &["name.family"]),
            ("Patient", "given", String, &["name.given"]),
            ("Patient", "birthdate", Date, &["birthDate"]),
            ("Patient", "gender", Token, &["gender"]),
            ("Patient", "identifier", Token, &["identifier"]),
            ("Patient", "active", Token, &["active"]),
            ("Patient", "email", Token, &["telecom"]),
            ("Patient", "address-city", String, &["address.city"]),
            ("Patient", "organization", Reference, &["managingOrganization"]),
            ("Patient", "general-practitioner", Reference, &["generalPractitioner"]),
            ("Practitioner", "name", String, &["name"]),
            ("Practitioner", "identifier", Token, &["identifier"]),
            ("Organization", "name", String, &["name"]),
            ("Organization", "identifier", Token, &["identifier"]),
            ("Observation", "status", Token, &["status"]),
            ("Observation", "code", Token, &["code"]),
            ("Observation", "category", Token, &["category"]),
            ("Observation", "subject", Reference, &["subject"]),
            ("Observation", "patient", Reference, &["subject"]),
            (
                "Observation",
                "date",
                Date,
                &["effectiveDateTime", "effectivePeriod.start", "effectiveInstant"],
            ),
            ("Observation", "value-quantity", Quantity, &["valueQuantity"]),
            ("Observation", "value-string", String, &["valueString"]),
            ("RiskAssessment", "probability", Number, &["prediction.probabilityDecimal"]),
            ("RiskAssessment", "subject", Reference, &["subject"]),
            ("RiskAssessment", "status", Token, &["status"]),
            ("Encounter", "status", Token, &["status"]),
            ("Encounter", "class", Token, &["class"]),
            ("Encounter", "subject", Reference, &["subject"]),
            ("Encounter", "patient", Reference, &["subject"]),
            ("Encounter", "date", Date, &["period.start"]),
            ("Appointment", "status", Token, &["status"]),
            ("Appointment", "date", Date, &["start"]),
            ("Appointment", "actor", Reference, &["participant.actor"]),
            ("Appointment", "patient", Reference, &["participant.actor"]),
            ("ValueSet", "url", Uri, &["url"]),
            ("ValueSet", "name", String, &["name"]),
            ("ValueSet", "status", Token, &["status"]),
            ("CodeSystem", "url", Uri, &["url"]),
            ("StructureDefinition", "url", Uri, &["url"]),
            ("Subscription", "status", Token, &["status"]),
            ("Subscription", "criteria", String, &["criteria"]),
            ("Subscription", "type", Token, &["channel.type"]),
            ("Subscription", "url", Uri, &["channel.endpoint"]),
        ];
        for (resource_type, code, kind, paths) in defs {
            let mut def = SearchParameterDefinition::new(*code, *kind, paths[0]);
            for path in &paths[1..] {
                def = def.with_path(*path);
            }
            registry.register(resource_type, def);
        }

        registry
    }

    /// Add or replace a parameter for one resource type.
    pub fn register(&self, resource_type: &str, def: SearchParameterDefinition) {
        self.by_resource
            .insert((resource_type.to_string(), def.code.clone()), def);
    }

    /// Add or replace a parameter for every resource type.
    pub fn register_common(&self, def: SearchParameterDefinition) {
        self.common.insert(def.code.clone(), def);
    }

    /// Remove a resource-specific parameter. Returns the removed definition.
    pub fn remove(&self, resource_type: &str, code: &str) -> Option<SearchParameterDefinition> {
        self.by_resource
            .remove(&(resource_type.to_string(), code.to_string()))
            .map(|(_, def)| def)
    }

    /// Look up a parameter; resource-specific definitions shadow common ones.
    pub fn get(&self, resource_type: &str, code: &str) -> Option<SearchParameterDefinition> {
        if let Some(def) = self
            .by_resource
            .get(&(resource_type.to_string(), code.to_string()))
        {
            return Some(def.value().clone());
        }
        self.common.get(code).map(|def| def.value().clone())
    }

    pub fn param_type(&self, resource_type: &str, code: &str) -> Option<SearchParameterType> {
        self.get(resource_type, code).map(|def| def.kind)
    }

    /// Whether values of this parameter accept an ordinal prefix.
    ///
    /// Unknown parameters are treated as non-ordinal.
    pub fn is_ordinal(&self, resource_type: &str, code: &str) -> bool {
        self.param_type(resource_type, code)
            .is_some_and(|kind| kind.is_ordinal())
    }

    pub fn len(&self) -> usize {
        self.by_resource.len() + self.common.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
