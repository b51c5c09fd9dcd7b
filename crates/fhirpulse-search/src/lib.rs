//! Criteria language for search and subscription matching.
//!
//! A criteria string such as `Observation?status=final&_count=10` is parsed
//! into a [`Criteria`], formatted back into a canonical query string, and
//! evaluated against resource snapshots. Parsing and formatting consult a
//! [`SearchParameterRegistry`] so that ordinal prefixes (`gt`, `le`, ...) are
//! only recognised on number, date and quantity parameters.

pub mod criteria;
pub mod error;
pub mod evaluate;
pub mod format;
pub mod parameters;
pub mod parser;
pub mod registry;

pub use criteria::{Criteria, Filter, SortRule, TotalMode};
pub use error::SearchError;
pub use evaluate::{matches_criteria, matches_filter, sort_resources};
pub use format::{CriteriaFormatter, format_criteria};
pub use parameters::{
    Operator, SearchModifier, SearchParameterDefinition, SearchParameterType, SearchPrefix,
};
pub use parser::{CriteriaParser, parse_criteria, parse_criteria_string};
pub use registry::SearchParameterRegistry;
