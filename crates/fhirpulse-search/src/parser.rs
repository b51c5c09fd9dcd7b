use std::borrow::Cow;

use url::form_urlencoded;

use crate::criteria::{Criteria, Filter, SortRule, TotalMode};
use crate::error::SearchError;
use crate::parameters::{Operator, SearchModifier, SearchPrefix};
use crate::registry::SearchParameterRegistry;

/// Parses criteria strings against a parameter vocabulary.
#[derive(Debug, Clone, Copy)]
pub struct CriteriaParser<'a> {
    registry: &'a SearchParameterRegistry,
}

impl<'a> CriteriaParser<'a> {
    pub fn new(registry: &'a SearchParameterRegistry) -> Self {
        Self { registry }
    }

    /// Parse a path (supplying the resource type) and an optional query.
    pub fn parse(&self, path: &str, query: Option<&str>) -> Result<Criteria, SearchError> {
        let resource_type = path
            .split('/')
            .rev()
            .find(|segment| !segment.is_empty())
            .ok_or_else(|| SearchError::MissingResourceType(path.to_string()))?;

        let mut criteria = Criteria::new(resource_type);
        let Some(query) = query else {
            return Ok(criteria);
        };

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if key.is_empty() {
                continue;
            }
            match key.as_ref() {
                "_fields" => {
                    if criteria.fields.is_empty() {
                        criteria.fields = split_list(&value).map(str::to_string).collect();
                    }
                }
                "_sort" => {
                    if criteria.sort_rules.is_empty() {
                        criteria.sort_rules = split_list(&value).map(parse_sort_rule).collect();
                    }
                }
                "_page" => {
                    let page = parse_u32("_page", &value)?;
                    criteria.page.get_or_insert(page);
                }
                "_count" => {
                    let count = parse_u32("_count", &value)?;
                    criteria.count.get_or_insert(count);
                }
                "_total" => {
                    let total = TotalMode::parse(&value).ok_or_else(|| {
                        SearchError::malformed("_total", format!("unknown mode {value:?}"))
                    })?;
                    criteria.total.get_or_insert(total);
                }
                _ => {
                    let filter = self.parse_filter(&criteria.resource_type, key, value);
                    criteria.filters.push(filter);
                }
            }
        }

        Ok(criteria)
    }

    /// Parse `Type?query` as used by subscription criteria.
    pub fn parse_criteria_string(&self, criteria: &str) -> Result<Criteria, SearchError> {
        match criteria.split_once('?') {
            Some((path, query)) => self.parse(path, Some(query)),
            None => self.parse(criteria, None),
        }
    }

    fn parse_filter(&self, resource_type: &str, key: Cow<'_, str>, value: Cow<'_, str>) -> Filter {
        if let Some((name, suffix)) = key.split_once(':')
            && let Some(modifier) = SearchModifier::parse(suffix)
        {
            return Filter::new(name, Operator::from_modifier(modifier), value);
        }

        // An unrecognised suffix stays part of the code; prefixes are looked
        // up on the base name.
        let base = key.split_once(':').map_or(key.as_ref(), |(name, _)| name);
        if self.registry.is_ordinal(resource_type, base)
            && let Some((prefix, rest)) = SearchPrefix::split(&value)
        {
            return Filter::new(key, Operator::from_prefix(prefix), rest);
        }

        Filter::new(key, Operator::Equals, value)
    }
}

/// Parse a path and optional query string.
pub fn parse_criteria(
    path: &str,
    query: Option<&str>,
    registry: &SearchParameterRegistry,
) -> Result<Criteria, SearchError> {
    CriteriaParser::new(registry).parse(path, query)
}

/// Parse a `Type?query` criteria string.
pub fn parse_criteria_string(
    criteria: &str,
    registry: &SearchParameterRegistry,
) -> Result<Criteria, SearchError> {
    CriteriaParser::new(registry).parse_criteria_string(criteria)
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_sort_rule(token: &str) -> SortRule {
    match token.strip_prefix('-') {
        Some(code) => SortRule::descending(code),
        None => SortRule::ascending(token),
    }
}

fn parse_u32(param: &str, value: &str) -> Result<u32, SearchError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|e| SearchError::malformed(param, format!("{value:?}: {e}")))
}


#[cfg(test)]
mod tests_filters {
    use super::*;

    fn filters(query: &str) -> Vec<Filter> {
        let registry = SearchParameterRegistry::with_defaults();
        parse_criteria("Patient", Some(query), &registry)
            .unwrap()
            .filters
    }

    #[test]
    fn modifier_maps_to_operator() {
        let f = filters("name:contains=alice");
        assert_eq!(f, vec![Filter::new("name", Operator::Contains, "alice")]);
    }

    #[test]
    fn ordinal_prefix_is_stripped_on_date_field() {
        let f = filters("birthdate=gt2000-01-01");
        assert_eq!(
            f,
            vec![Filter::new("birthdate", Operator::GreaterThan, "2000-01-01")]
        );
    }

    #[test]
    fn string_field_keeps_prefix_like_text() {
        let f = filters("name=leslie");
        assert_eq!(f, vec![Filter::new("name", Operator::Equals, "leslie")]);
    }

    #[test]
    fn unknown_field_never_gets_a_prefix() {
        let f = filters("nickname=gtx");
        assert_eq!(f, vec![Filter::new("nickname", Operator::Equals, "gtx")]);
    }

    #[test]
    fn unknown_modifier_stays_in_code() {
        let f = filters("general-practitioner:Practitioner=123");
        match &f[0] {
            Filter {
                code,
                operator: Operator::Equals,
                value,
            } => {
                assert_eq!(code, "general-practitioner:Practitioner");
                assert_eq!(value, "123");
            }
            other => panic!("unexpected filter: {other:?}"),
        }
    }

    #[test]
    fn repeated_keys_produce_multiple_filters() {
        let f = filters("birthdate=ge2000-01-01&birthdate=lt2010-01-01&_id=abc");
        assert_eq!(f.len(), 3);
        assert_eq!(f[0].operator, Operator::GreaterThanOrEquals);
        assert_eq!(f[1].operator, Operator::LessThan);
        assert_eq!(f[2], Filter::new("_id", Operator::Equals, "abc"));
    }

    #[test]
    fn values_are_percent_decoded() {
        let f = filters("identifier=http%3A%2F%2Facme.org%7C123");
        assert_eq!(f[0].value, "http://acme.org|123");
    }
}
