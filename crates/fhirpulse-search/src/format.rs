//! Canonical query string formatting.
//!
//! Structural parameters come first in alphabetical order (`_count`,
//! `_fields`, `_page`, `_sort`, `_total`), then filters in their original
//! order. Values are percent-encoded.

use crate::criteria::{Criteria, Filter};
use crate::parameters::{Operator, SearchPrefix};
use crate::registry::SearchParameterRegistry;

#[derive(Debug, Clone, Copy)]
pub struct CriteriaFormatter<'a> {
    registry: &'a SearchParameterRegistry,
}

impl<'a> CriteriaFormatter<'a> {
    pub fn new(registry: &'a SearchParameterRegistry) -> Self {
        Self { registry }
    }

    /// Format the query part, including the leading `?`.
    ///
    /// Returns an empty string when there is nothing to encode.
    pub fn format(&self, criteria: &Criteria) -> String {
        let mut params: Vec<String> = Vec::new();

        if let Some(count) = criteria.count {
            params.push(format!("_count={count}"));
        }
        if !criteria.fields.is_empty() {
            let fields: Vec<_> = criteria.fields.iter().map(|f| encode(f)).collect();
            params.push(format!("_fields={}", fields.join(",")));
        }
        if let Some(page) = criteria.page {
            params.push(format!("_page={page}"));
        }
        if !criteria.sort_rules.is_empty() {
            let rules: Vec<_> = criteria
                .sort_rules
                .iter()
                .map(|rule| {
                    let sign = if rule.descending { "-" } else { "" };
                    format!("{sign}{}", encode(&rule.code))
                })
                .collect();
            params.push(format!("_sort={}", rules.join(",")));
        }
        if let Some(total) = criteria.total {
            params.push(format!("_total={}", total.as_str()));
        }
        for filter in &criteria.filters {
            params.push(self.format_filter(&criteria.resource_type, filter));
        }

        if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        }
    }

    fn format_filter(&self, resource_type: &str, filter: &Filter) -> String {
        let code = filter
            .code
            .split(':')
            .map(encode)
            .collect::<Vec<_>>()
            .join(":");
        let key = match filter.operator.modifier() {
            Some(modifier) => format!("{code}:{}", modifier.as_str()),
            None => code,
        };

        let value = encode(&filter.value);
        let value = match filter.operator.prefix() {
            Some(prefix) => format!("{prefix}{value}"),
            None if filter.operator == Operator::Equals
                && self.registry.is_ordinal(resource_type, filter.base_code())
                && SearchPrefix::split(&filter.value).is_some() =>
            {
                // Otherwise the value's own leading letters would be read back as a prefix.
                format!("{}{value}", SearchPrefix::Eq)
            }
            None => value,
        };

        format!("{key}={value}")
    }
}

pub fn format_criteria(criteria: &Criteria, registry: &SearchParameterRegistry) -> String {
    CriteriaFormatter::new(registry).format(criteria)
}

fn encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}
