use std::collections::HashSet;

use super::FetchStage;
use super::HitContext;
use super::SegmentContext;
use crate::error::FetchError;

/// Flags each hit with the named queries it matches. Matches are looked up
/// per segment from what the shard reported.
#[derive(Debug)]
pub struct MatchedQueriesStage {
    names: Vec<String>,
    segment_matches: Vec<HashSet<u32>>,
}

impl MatchedQueriesStage {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            segment_matches: Vec::new(),
        }
    }
}

impl FetchStage for MatchedQueriesStage {
    fn name(&self) -> &'static str {
        "matched_queries"
    }

    fn set_next_reader(&mut self, segment: &SegmentContext<'_>) -> Result<(), FetchError> {
        self.segment_matches = self
            .names
            .iter()
            .map(|name| {
                segment
                    .info
                    .named_matches
                    .get(name)
                    .map(|docs| docs.iter().copied().collect())
                    .unwrap_or_default()
            })
            .collect();
        Ok(())
    }

    fn process(&self, hit: &mut HitContext) -> Result<(), FetchError> {
        let doc = hit.doc();
        for (name, matches) in self.names.iter().zip(&self.segment_matches) {
            if matches.contains(&doc) {
                hit.matched_queries.push(name.clone());
            }
        }
        Ok(())
    }
}
