use serde_json::Value;
use wildmatch::WildMatch;

use super::FetchStage;
use super::HitContext;
use super::SegmentContext;
use super::path;
use crate::error::FetchError;

/// Extracts the requested field paths (wildcards allowed) from the source.
#[derive(Debug)]
pub struct FieldsStage {
    patterns: Vec<WildMatch>,
}

impl FieldsStage {
    pub fn new(fields: &[String]) -> Self {
        Self {
            patterns: path::compile_patterns(fields),
        }
    }
}

impl FetchStage for FieldsStage {
    fn name(&self) -> &'static str {
        "fields"
    }

    fn set_next_reader(&mut self, _segment: &SegmentContext<'_>) -> Result<(), FetchError> {
        Ok(())
    }

    fn process(&self, hit: &mut HitContext) -> Result<(), FetchError> {
        let Some(source) = hit.source_value()? else {
            return Ok(());
        };
        let extracted: Vec<(String, Vec<Value>)> = path::flatten_leaves(source)
            .into_iter()
            .filter(|(path, _)| self.patterns.iter().any(|pattern| pattern.matches(path)))
            .collect();
        for (path, values) in extracted {
            hit.fields.entry(path).or_default().extend(values);
        }
        Ok(())
    }
}
