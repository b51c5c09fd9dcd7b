//! Parsed criteria representation.

use serde::{Deserialize, Serialize};

use crate::parameters::Operator;

/// A single field condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Field code; keeps an unrecognised `:suffix` verbatim.
    pub code: String,
    pub operator: Operator,
    pub value: String,
}

impl Filter {
    pub fn new(code: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            operator,
            value: value.into(),
        }
    }

    /// The code without any `:suffix`.
    pub fn base_code(&self) -> &str {
        self.code
            .split_once(':')
            .map_or(self.code.as_str(), |(base, _)| base)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortRule {
    pub code: String,
    pub descending: bool,
}

impl SortRule {
    pub fn ascending(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            descending: false,
        }
    }

    pub fn descending(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            descending: true,
        }
    }
}

/// `_total` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalMode {
    None,
    Estimate,
    Accurate,
}

impl TotalMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "estimate" => Some(Self::Estimate),
            "accurate" => Some(Self::Accurate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Estimate => "estimate",
            Self::Accurate => "accurate",
        }
    }
}

/// A parsed search or subscription criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    pub resource_type: String,
    /// Conjunctive: every filter must match.
    pub filters: Vec<Filter>,
    pub fields: Vec<String>,
    pub sort_rules: Vec<SortRule>,
    pub page: Option<u32>,
    pub count: Option<u32>,
    pub total: Option<TotalMode>,
}

impl Criteria {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}
