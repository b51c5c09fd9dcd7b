use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterType {
    Number,
    Date,
    String,
    Token,
    Reference,
    Composite,
    Quantity,
    Uri,
    Special,
}

impl SearchParameterType {
    /// Parse a search parameter type from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "number" => Some(Self::Number),
            "date" => Some(Self::Date),
            "string" => Some(Self::String),
            "token" => Some(Self::Token),
            "reference" => Some(Self::Reference),
            "composite" => Some(Self::Composite),
            "quantity" => Some(Self::Quantity),
            "uri" => Some(Self::Uri),
            "special" => Some(Self::Special),
            _ => None,
        }
    }

    /// Types whose values accept a comparison prefix.
    pub fn is_ordinal(&self) -> bool {
        matches!(self, Self::Number | Self::Date | Self::Quantity)
    }
}

/// Modifiers applied as suffix to a parameter code: `name:modifier`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchModifier {
    Exact,
    Contains,
    Text,
    In,
    NotIn,
    Below,
    Above,
    Not,
    Identifier,
    Missing,
    OfType,
}

impl SearchModifier {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing" => Some(Self::Missing),
            "exact" => Some(Self::Exact),
            "contains" => Some(Self::Contains),
            "not" => Some(Self::Not),
            "text" => Some(Self::Text),
            "in" => Some(Self::In),
            "not-in" => Some(Self::NotIn),
            "below" => Some(Self::Below),
            "above" => Some(Self::Above),
            "identifier" => Some(Self::Identifier),
            "of-type" | "ofType" => Some(Self::OfType),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Contains => "contains",
            Self::Text => "text",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::Below => "below",
            Self::Above => "above",
            Self::Not => "not",
            Self::Identifier => "identifier",
            Self::Missing => "missing",
            Self::OfType => "of-type",
        }
    }
}

/// Prefixes for number/date search values
/// e.g., `ge2020-01-01`, `lt5.0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchPrefix {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Sa, // starts after
    Eb, // ends before
    Ap, // approximately
}

impl fmt::Display for SearchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchPrefix::Eq => "eq",
            SearchPrefix::Ne => "ne",
            SearchPrefix::Gt => "gt",
            SearchPrefix::Lt => "lt",
            SearchPrefix::Ge => "ge",
            SearchPrefix::Le => "le",
            SearchPrefix::Sa => "sa",
            SearchPrefix::Eb => "eb",
            SearchPrefix::Ap => "ap",
        };
        f.write_str(s)
    }
}

impl SearchPrefix {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "lt" => Some(Self::Lt),
            "ge" => Some(Self::Ge),
            "le" => Some(Self::Le),
            "sa" => Some(Self::Sa),
            "eb" => Some(Self::Eb),
            "ap" => Some(Self::Ap),
            _ => None,
        }
    }

    /// Split a leading two-letter prefix off `value`.
    pub fn split(value: &str) -> Option<(Self, &str)> {
        let head = value.get(..2)?;
        Self::parse(head).map(|prefix| (prefix, &value[2..]))
    }
}

/// Comparison applied by a [`crate::Filter`].
///
/// Ordinal operators are written as a value prefix, the rest as a code
/// modifier. `Equals` is the default and is written as neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEquals,
    LessThanOrEquals,
    StartsAfter,
    EndsBefore,
    Approximately,
    Contains,
    Exact,
    Not,
    Above,
    Below,
    In,
    NotIn,
    Missing,
    Text,
    Identifier,
    OfType,
}

impl Operator {
    pub fn from_prefix(prefix: SearchPrefix) -> Self {
        match prefix {
            SearchPrefix::Eq => Self::Equals,
            SearchPrefix::Ne => Self::NotEquals,
            SearchPrefix::Gt => Self::GreaterThan,
            SearchPrefix::Lt => Self::LessThan,
            SearchPrefix::Ge => Self::GreaterThanOrEquals,
            SearchPrefix::Le => Self::LessThanOrEquals,
            SearchPrefix::Sa => Self::StartsAfter,
            SearchPrefix::Eb => Self::EndsBefore,
            SearchPrefix::Ap => Self::Approximately,
        }
    }

    pub fn from_modifier(modifier: SearchModifier) -> Self {
        match modifier {
            SearchModifier::Exact => Self::Exact,
            SearchModifier::Contains => Self::Contains,
            SearchModifier::Text => Self::Text,
            SearchModifier::In => Self::In,
            SearchModifier::NotIn => Self::NotIn,
            SearchModifier::Below => Self::Below,
            SearchModifier::Above => Self::Above,
            SearchModifier::Not => Self::Not,
            SearchModifier::Identifier => Self::Identifier,
            SearchModifier::Missing => Self::Missing,
            SearchModifier::OfType => Self::OfType,
        }
    }

    /// The value prefix for non-default ordinal operators.
    pub fn prefix(&self) -> Option<SearchPrefix> {
        match self {
            Self::NotEquals => Some(SearchPrefix::Ne),
            Self::GreaterThan => Some(SearchPrefix::Gt),
            Self::LessThan => Some(SearchPrefix::Lt),
            Self::GreaterThanOrEquals => Some(SearchPrefix::Ge),
            Self::LessThanOrEquals => Some(SearchPrefix::Le),
            Self::StartsAfter => Some(SearchPrefix::Sa),
            Self::EndsBefore => Some(SearchPrefix::Eb),
            Self::Approximately => Some(SearchPrefix::Ap),
            _ => None,
        }
    }

    /// The code modifier for modifier operators.
    pub fn modifier(&self) -> Option<SearchModifier> {
        match self {
            Self::Contains => Some(SearchModifier::Contains),
            Self::Exact => Some(SearchModifier::Exact),
            Self::Not => Some(SearchModifier::Not),
            Self::Above => Some(SearchModifier::Above),
            Self::Below => Some(SearchModifier::Below),
            Self::In => Some(SearchModifier::In),
            Self::NotIn => Some(SearchModifier::NotIn),
            Self::Missing => Some(SearchModifier::Missing),
            Self::Text => Some(SearchModifier::Text),
            Self::Identifier => Some(SearchModifier::Identifier),
            Self::OfType => Some(SearchModifier::OfType),
            _ => None,
        }
    }

    /// Operators that hold when no value matches.
    pub fn is_negated(&self) -> bool {
        matches!(self, Self::NotEquals | Self::Not | Self::NotIn)
    }
}

/// A search parameter known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParameterDefinition {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: SearchParameterType,
    /// Dot-separated element paths; the first one that yields values wins.
    pub paths: Vec<String>,
    pub description: Option<String>,
}

impl SearchParameterDefinition {
    pub fn new(code: impl Into<String>, kind: SearchParameterType, path: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            kind,
            paths: vec![path.into()],
            description: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_split_requires_two_ascii_letters() {
        assert_eq!(SearchPrefix::split("gt5"), Some((SearchPrefix::Gt, "5")));
        assert_eq!(SearchPrefix::split("le"), Some((SearchPrefix::Le, "")));
        assert_eq!(SearchPrefix::split("g"), None);
        assert_eq!(SearchPrefix::split("leslie").map(|(p, _)| p), Some(SearchPrefix::Le));
        assert_eq!(SearchPrefix::split("éa"), None);
    }

    #[test]
    fn operators_map_to_exactly_one_encoding() {
        let all = [
            Operator::Equals,
            Operator::NotEquals,
            Operator::GreaterThan,
            Operator::LessThan,
            Operator::GreaterThanOrEquals,
            Operator::LessThanOrEquals,
            Operator::StartsAfter,
            Operator::EndsBefore,
            Operator::Approximately,
            Operator::Contains,
            Operator::Exact,
            Operator::Not,
            Operator::Above,
            Operator::Below,
            Operator::In,
            Operator::NotIn,
            Operator::Missing,
            Operator::Text,
            Operator::Identifier,
            Operator::OfType,
        ];
        for op in all {
            assert!(
                !(op.prefix().is_some() && op.modifier().is_some()),
                "{op:?} has two encodings"
            );
            if let Some(prefix) = op.prefix() {
                assert_eq!(Operator::from_prefix(prefix), op);
            }
            if let Some(modifier) = op.modifier() {
                assert_eq!(Operator::from_modifier(modifier), op);
                assert_eq!(SearchModifier::parse(modifier.as_str()), Some(modifier));
            }
        }
    }

    #[test]
    fn ordinal_types() {
        assert!(SearchParameterType::Number.is_ordinal());
        assert!(SearchParameterType::Date.is_ordinal());
        assert!(SearchParameterType::Quantity.is_ordinal());
        assert!(!SearchParameterType::String.is_ordinal());
        assert!(!SearchParameterType::Token.is_ordinal());
    }
}
