use fhirpulse_search::{
    Criteria, Filter, Operator, SearchParameterRegistry, SortRule, TotalMode, format_criteria,
    parse_criteria,
};

const QUERIES: &[&str] = &[
    "",
    "name=leslie",
    "name:contains=alice",
    "birthdate=gt2000-01-01",
    "birthdate=eqgt5",
    "birthdate=eq",
    "birthdate=2000",
    "_count=5&_fields=id,name&_page=2&name=alice",
    "_sort=-birthdate,name&_total=estimate",
    "_total=accurate&_fields=,id,,",
    "gender=male,female&gender:not=other",
    "general-practitioner:Practitioner=123",
    "identifier=http%3A%2F%2Facme.org%7C123",
    "name=a+b&name=%26%3D",
    "value=gt5&_id=abc&=ignored",
    "_count=7&_count=9&active=true",
    "address-city:missing=true&birthdate=le2020-12-31T23%3A59%3A59Z",
];

fn round_trip(path: &str, query: &str) {
    let registry = SearchParameterRegistry::with_defaults();
    let first = parse_criteria(path, Some(query), &registry)
        .unwrap_or_else(|e| panic!("failed to parse {query:?}: {e}"));
    let formatted = format_criteria(&first, &registry);
    let second = parse_criteria(path, formatted.strip_prefix('?'), &registry)
        .unwrap_or_else(|e| panic!("failed to reparse {formatted:?}: {e}"));
    assert_eq!(first, second, "{query:?} formatted as {formatted:?}");
}

#[test]
fn parse_format_parse_is_a_fixed_point() {
    for query in QUERIES {
        round_trip("Patient", query);
    }
    round_trip("RiskAssessment", "probability=ne0.5&probability=ap1");
    round_trip("ValueSet", "url:below=http%3A%2F%2Facme.org&url:above=x");
}

#[test]
fn trailing_slash_is_ignored() {
    let registry = SearchParameterRegistry::with_defaults();
    let with = parse_criteria("Patient/", Some("name=x"), &registry).unwrap();
    let without = parse_criteria("Patient", Some("name=x"), &registry).unwrap();
    assert_eq!(with, without);
}

#[test]
fn parses_search_request_like_the_api_does() -> anyhow::Result<()> {
    let registry = SearchParameterRegistry::with_defaults();
    let criteria = parse_criteria(
        "/x/y/Patient/",
        Some("_fields=id,name,birthDate&_sort=-birthDate&_total=accurate&birthdate=gt2000-01-01"),
        &registry,
    )?;

    assert_eq!(
        criteria,
        Criteria {
            resource_type: "Patient".into(),
            filters: vec![Filter::new("birthdate", Operator::GreaterThan, "2000-01-01")],
            fields: vec!["id".into(), "name".into(), "birthDate".into()],
            sort_rules: vec![SortRule::descending("birthDate")],
            page: None,
            count: None,
            total: Some(TotalMode::Accurate),
        }
    );
    Ok(())
}

#[test]
fn prefix_interpretation_depends_on_field_type() {
    let registry = SearchParameterRegistry::with_defaults();
    let criteria = parse_criteria(
        "Patient",
        Some("name=leslie&birthdate=le2000&given=gtx"),
        &registry,
    )
    .unwrap();
    assert_eq!(
        criteria.filters,
        vec![
            Filter::new("name", Operator::Equals, "leslie"),
            Filter::new("birthdate", Operator::LessThanOrEquals, "2000"),
            Filter::new("given", Operator::Equals, "gtx"),
        ]
    );
}
