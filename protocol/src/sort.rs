use serde::Deserialize;
use serde::Serialize;
use std::cmp::Ordering;

use crate::phase::ScoreDoc;

/// Pseudo-field that sorts by relevance score.
pub const SCORE_FIELD: &str = "_score";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }

    pub fn score() -> Self {
        Self::desc(SCORE_FIELD)
    }

    pub fn is_score(&self) -> bool {
        self.field == SCORE_FIELD
    }
}

/// One component of a document's sort key as reported by a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortValue {
    Null,
    Long(i64),
    Double(f64),
    Text(String),
}

impl SortValue {
    /// Missing values (and NaN) always sort after present ones, whatever the
    /// requested order.
    pub fn is_missing(&self) -> bool {
        match self {
            SortValue::Null => true,
            SortValue::Double(value) => value.is_nan(),
            SortValue::Long(_) | SortValue::Text(_) => false,
        }
    }

    /// Returns `true` if both values can be ordered against each other without
    /// falling back to the cross-type rank.
    pub fn is_comparable_with(&self, other: &SortValue) -> bool {
        match (self, other) {
            (SortValue::Null, _) | (_, SortValue::Null) => true,
            (SortValue::Text(_), SortValue::Text(_)) => true,
            (SortValue::Text(_), _) | (_, SortValue::Text(_)) => false,
            _ => true,
        }
    }

    fn natural_cmp(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Long(a), SortValue::Long(b)) => a.cmp(b),
            (SortValue::Long(a), SortValue::Double(b)) => (*a as f64).total_cmp(b),
            (SortValue::Double(a), SortValue::Long(b)) => a.total_cmp(&(*b as f64)),
            (SortValue::Double(a), SortValue::Double(b)) => a.total_cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            // Numbers rank before text when a field is mapped differently
            // across indices.
            (SortValue::Text(_), _) => Ordering::Greater,
            (_, SortValue::Text(_)) => Ordering::Less,
            (SortValue::Null, SortValue::Null) => Ordering::Equal,
            (SortValue::Null, _) => Ordering::Greater,
            (_, SortValue::Null) => Ordering::Less,
        }
    }

    pub fn cmp_with_order(&self, other: &SortValue, order: SortOrder) -> Ordering {
        match (self.is_missing(), other.is_missing()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let natural = self.natural_cmp(other);
                match order {
                    SortOrder::Asc => natural,
                    SortOrder::Desc => natural.reverse(),
                }
            }
        }
    }
}

impl From<i64> for SortValue {
    fn from(value: i64) -> Self {
        SortValue::Long(value)
    }
}

impl From<f64> for SortValue {
    fn from(value: f64) -> Self {
        SortValue::Double(value)
    }
}

impl From<&str> for SortValue {
    fn from(value: &str) -> Self {
        SortValue::Text(value.to_string())
    }
}

/// Ordering applied to shard results, derived once from the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "fields", rename_all = "snake_case")]
pub enum SortSpec {
    /// Score descending.
    Relevance,
    /// Explicit sort fields; a document's `sort_values` line up with them.
    Fields(Vec<SortField>),
}

impl SortSpec {
    pub fn from_fields(fields: &[SortField]) -> Self {
        if fields.is_empty() {
            SortSpec::Relevance
        } else {
            SortSpec::Fields(fields.to_vec())
        }
    }

    pub fn is_relevance_first(&self) -> bool {
        match self {
            SortSpec::Relevance => true,
            SortSpec::Fields(fields) => fields.first().is_none_or(SortField::is_score),
        }
    }

    pub fn field_count(&self) -> usize {
        match self {
            SortSpec::Relevance => 0,
            SortSpec::Fields(fields) => fields.len(),
        }
    }

    /// Compares two sort keys field by field. A key with fewer values than sort fields is
    /// padded with missing values.
    pub fn compare_values(&self, a: &[SortValue], b: &[SortValue]) -> Ordering {
        let SortSpec::Fields(fields) = self else {
            return Ordering::Equal;
        };
        for (position, field) in fields.iter().enumerate() {
            let left = a.get(position).unwrap_or(&SortValue::Null);
            let right = b.get(position).unwrap_or(&SortValue::Null);
            let ordering = left.cmp_with_order(right, field.order);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Primary ordering of two shard documents. Ties are left to the caller.
    pub fn compare_docs(&self, a: &ScoreDoc, b: &ScoreDoc) -> Ordering {
        match self {
            SortSpec::Relevance => compare_scores(a.score, b.score),
            SortSpec::Fields(_) => self.compare_values(&a.sort_values, &b.sort_values),
        }
    }
}

/// Score descending with NaN last.
fn compare_scores(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}
