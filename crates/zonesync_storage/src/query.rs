//! Predicate queries over shadow records.

use crate::record::ShadowRecord;
use std::cmp::Ordering;
use zonesync_protocol::{ChangeType, RecordId, Value};

/// Filter applied to shadow records.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Predicate {
    /// Matches every record.
    #[default]
    All,
    /// Matches the record with this identity.
    RecordId(RecordId),
    /// Matches records with this change marker.
    ChangeType(ChangeType),
    /// Matches records without this change marker.
    NotChangeType(ChangeType),
    /// Matches records whose attribute equals the value.
    AttributeEquals(String, Value),
    /// Both predicates match.
    And(Box<Predicate>, Box<Predicate>),
    /// Either predicate matches.
    Or(Box<Predicate>, Box<Predicate>),
    /// The predicate does not match.
    Not(Box<Predicate>),
}

impl Predicate {
    /// Shorthand for [`Predicate::AttributeEquals`].
    pub fn attribute_eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::AttributeEquals(attribute.into(), value.into())
    }

    /// Combines with another predicate using AND.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::All, other) | (other, Predicate::All) => other,
            (left, right) => Predicate::And(Box::new(left), Box::new(right)),
        }
    }

    /// Combines with another predicate using OR.
    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// Negates the predicate.
    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Evaluates the predicate against a record.
    pub fn matches(&self, record: &ShadowRecord) -> bool {
        match self {
            Predicate::All => true,
            Predicate::RecordId(id) => &record.record_id == id,
            Predicate::ChangeType(change) => record.change_type == *change,
            Predicate::NotChangeType(change) => record.change_type != *change,
            Predicate::AttributeEquals(name, value) => record.attribute(name) == value,
            Predicate::And(left, right) => left.matches(record) && right.matches(record),
            Predicate::Or(left, right) => left.matches(record) || right.matches(record),
            Predicate::Not(inner) => !inner.matches(record),
        }
    }
}

/// Sort key for query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Attribute to sort by.
    pub attribute: String,
    /// Ascending when true.
    pub ascending: bool,
}

/// A query over the backing store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowQuery {
    /// Entities to include. `None` means every entity.
    pub entities: Option<Vec<String>>,
    /// Record filter.
    pub predicate: Predicate,
    /// Optional ordering. Without one, results come in backing-id order.
    pub sort_by: Option<SortKey>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl ShadowQuery {
    /// Query over every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Query over the named entities.
    pub fn entities(entities: Vec<String>) -> Self {
        Self {
            entities: Some(entities),
            ..Self::default()
        }
    }

    /// Adds a predicate, ANDed with any existing one.
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = std::mem::take(&mut self.predicate).and(predicate);
        self
    }

    /// Sorts by an attribute.
    pub fn sorted_by(mut self, attribute: impl Into<String>, ascending: bool) -> Self {
        self.sort_by = Some(SortKey {
            attribute: attribute.into(),
            ascending,
        });
        self
    }

    /// Limits the result count.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the record passes the entity and predicate filters.
    pub fn matches(&self, record: &ShadowRecord) -> bool {
        let entity_ok = match &self.entities {
            Some(entities) => entities.iter().any(|e| e == &record.entity),
            None => true,
        };
        entity_ok && self.predicate.matches(record)
    }

    /// Applies ordering and limit to records that already passed [`Self::matches`].
    pub fn finish<T, F>(&self, mut rows: Vec<T>, record_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &ShadowRecord,
    {
        if let Some(key) = &self.sort_by {
            rows.sort_by(|a, b| {
                let ordering = compare_values(
                    record_of(a).attribute(&key.attribute),
                    record_of(b).attribute(&key.attribute),
                );
                if key.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

/// Nulls sort first; values of different kinds compare by kind name.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a
            .partial_cmp_same_kind(b)
            .unwrap_or_else(|| a.type_name().cmp(b.type_name())),
    }
}
