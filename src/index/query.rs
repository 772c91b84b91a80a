//! Delete queries.
//!
//! The engine only needs enough query support to select documents for
//! deletion: exact terms, unions of terms, numeric doc-values ranges and
//! "everything".

use serde::{Deserialize, Serialize};

use crate::index::term::Term;

/// Per-segment view a query is resolved against.
pub trait QueryTarget {
    /// Number of document slots in the segment.
    fn max_doc(&self) -> u32;

    /// Sorted doc ids containing `term`.
    fn term_docs(&self, term: &Term) -> &[u32];

    /// Current numeric doc value of `field` for `doc`.
    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64>;
}

/// A query selecting documents for deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    /// Documents containing the term.
    Term(Term),
    /// Documents containing any of the terms.
    AnyOf(Vec<Term>),
    /// Documents whose numeric doc value lies in `[lower, upper]`.
    /// Missing bounds are open.
    NumericRange {
        field: String,
        lower: Option<i64>,
        upper: Option<i64>,
    },
    /// Every document.
    MatchAll,
}

impl Query {
    /// Sorted, deduplicated doc ids below `limit` that match.
    pub fn matching_docs(&self, target: &dyn QueryTarget, limit: u32) -> Vec<u32> {
        let limit = limit.min(target.max_doc());
        let mut docs: Vec<u32> = match self {
            Query::Term(term) => target
                .term_docs(term)
                .iter()
                .copied()
                .take_while(|&d| d < limit)
                .collect(),
            Query::AnyOf(terms) => {
                let mut all: Vec<u32> = terms
                    .iter()
                    .flat_map(|t| target.term_docs(t).iter().copied())
                    .filter(|&d| d < limit)
                    .collect();
                all.sort_unstable();
                all
            }
            Query::NumericRange {
                field,
                lower,
                upper,
            } => (0..limit)
                .filter(|&doc| match target.numeric_value(field, doc) {
                    Some(v) => lower.is_none_or(|lo| v >= lo) && upper.is_none_or(|hi| v <= hi),
                    None => false,
                })
                .collect(),
            Query::MatchAll => (0..limit).collect(),
        };
        docs.dedup();
        docs
    }
}

impl From<Term> for Query {
    fn from(term: Term) -> Self {
        Query::Term(term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        ids: Vec<u32>,
        tags: Vec<u32>,
        values: Vec<Option<i64>>,
    }

    impl QueryTarget for Fixture {
        fn max_doc(&self) -> u32 {
            self.values.len() as u32
        }

        fn term_docs(&self, term: &Term) -> &[u32] {
            match term.text().as_ref() {
                "a" => &self.ids,
                "b" => &self.tags,
                _ => &[],
            }
        }

        fn numeric_value(&self, _field: &str, doc: u32) -> Option<i64> {
            self.values[doc as usize]
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            ids: vec![0, 2],
            tags: vec![2, 3],
            values: vec![Some(1), None, Some(5), Some(9)],
        }
    }

    #[test]
    fn test_term_and_any_of() {
        let f = fixture();
        assert_eq!(Query::Term(Term::new("f", "a")).matching_docs(&f, 4), vec![0, 2]);
        assert_eq!(Query::Term(Term::new("f", "a")).matching_docs(&f, 2), vec![0]);
        let any = Query::AnyOf(vec![Term::new("f", "a"), Term::new("f", "b")]);
        assert_eq!(any.matching_docs(&f, 4), vec![0, 2, 3]);
        assert!(Query::Term(Term::new("f", "zzz")).matching_docs(&f, 4).is_empty());
    }

    #[test]
    fn test_numeric_range_skips_missing_values() {
        let f = fixture();
        let q = Query::NumericRange {
            field: "val".into(),
            lower: Some(2),
            upper: None,
        };
        assert_eq!(q.matching_docs(&f, 4), vec![2, 3]);
        assert_eq!(Query::MatchAll.matching_docs(&f, 3), vec![0, 1, 2]);
    }
}
