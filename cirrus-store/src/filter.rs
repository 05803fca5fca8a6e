//! Query filters for list and get operations.
//!
//! A [`Filter`] is a conjunction of [`FilterStat`]s. Each stat addresses one
//! value of the stored document: a base field, a tag, or a kind-specific
//! ("extra") field.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::entity::Status;
use crate::error::{Result, StoreError};

/// Base field names addressable with [`FilterScope::Field`].
const BASE_FIELDS: &[&str] = &[
    "id",
    "name",
    "organizationId",
    "createdTime",
    "modifiedTime",
    "revision",
    "status",
    "reason",
    "tags",
    "delete",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    /// A base field shared by all kinds
    Field,
    /// An entry of the `tags` map
    Tag,
    /// A kind-specific field
    Extra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerb {
    Equal,
    /// Object is an array; matches if the value equals any element
    In,
    /// Timestamp strictly earlier than the object
    Before,
    /// Timestamp strictly later than the object
    After,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterStat {
    pub scope: FilterScope,
    pub subject: String,
    pub verb: FilterVerb,
    pub object: Value,
}

impl FilterStat {
    pub fn new(
        scope: FilterScope,
        subject: impl Into<String>,
        verb: FilterVerb,
        object: impl Into<Value>,
    ) -> Self {
        Self {
            scope,
            subject: subject.into(),
            verb,
            object: object.into(),
        }
    }

    pub fn field(subject: &str, verb: FilterVerb, object: impl Into<Value>) -> Self {
        Self::new(FilterScope::Field, subject, verb, object)
    }

    pub fn extra(subject: &str, verb: FilterVerb, object: impl Into<Value>) -> Self {
        Self::new(FilterScope::Extra, subject, verb, object)
    }

    pub fn tag(key: &str, value: &str) -> Self {
        Self::new(FilterScope::Tag, key, FilterVerb::Equal, value)
    }

    pub fn status_in(statuses: &[Status]) -> Self {
        let object: Vec<Value> = statuses.iter().copied().map(Value::from).collect();
        Self::field("status", FilterVerb::In, object)
    }

    pub fn modified_before(time: DateTime<Utc>) -> Self {
        Self::field("modifiedTime", FilterVerb::Before, time.to_rfc3339())
    }

    fn validate(&self) -> Result<()> {
        if self.subject.is_empty() {
            return Err(StoreError::InvalidFilter("empty subject".to_string()));
        }
        if self.scope == FilterScope::Field && !BASE_FIELDS.contains(&self.subject.as_str()) {
            return Err(StoreError::InvalidFilter(format!(
                "unknown field {:?}",
                self.subject
            )));
        }
        if self.verb == FilterVerb::In && !self.object.is_array() {
            return Err(StoreError::InvalidFilter(format!(
                "IN on {:?} needs an array",
                self.subject
            )));
        }
        Ok(())
    }

    fn matches(&self, document: &Value) -> Result<bool> {
        self.validate()?;
        let value = match self.scope {
            FilterScope::Field | FilterScope::Extra => document.get(&self.subject),
            FilterScope::Tag => document.get("tags").and_then(|tags| tags.get(&self.subject)),
        };
        let Some(value) = value else {
            return Ok(false);
        };

        match self.verb {
            FilterVerb::Equal => Ok(value == &self.object),
            FilterVerb::In => Ok(self
                .object
                .as_array()
                .is_some_and(|candidates| candidates.contains(value))),
            FilterVerb::Before | FilterVerb::After => {
                let Some(lhs) = parse_time(value) else {
                    return Ok(false);
                };
                let rhs = parse_time(&self.object).ok_or_else(|| {
                    StoreError::InvalidFilter(format!(
                        "{:?} is not an RFC 3339 timestamp",
                        self.object
                    ))
                })?;
                Ok(match self.verb {
                    FilterVerb::Before => lhs < rhs,
                    _ => lhs > rhs,
                })
            }
        }
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Conjunction of filter statements. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    stats: Vec<FilterStat>,
}

impl Filter {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Entities not marked for deletion.
    pub fn exists() -> Self {
        Self::default().add(FilterStat::field("delete", FilterVerb::Equal, false))
    }

    pub fn add(mut self, stat: FilterStat) -> Self {
        self.stats.push(stat);
        self
    }

    pub fn with_tag(self, key: &str, value: &str) -> Self {
        self.add(FilterStat::tag(key, value))
    }

    pub fn stats(&self) -> &[FilterStat] {
        &self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Evaluate against a serialized entity document.
    pub fn matches(&self, document: &Value) -> Result<bool> {
        for stat in &self.stats {
            if !stat.matches(document)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Per-call options for store reads.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub filter: Option<Filter>,
}

impl Options {
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
        }
    }

    pub(crate) fn matches(&self, document: &Value) -> Result<bool> {
        match &self.filter {
            Some(filter) => filter.matches(document),
            None => Ok(true),
        }
    }
}
