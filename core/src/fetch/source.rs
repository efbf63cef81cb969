use gather_protocol::FetchSource;
use wildmatch::WildMatch;

use super::FetchStage;
use super::HitContext;
use super::SegmentContext;
use super::path;
use crate::error::FetchError;

/// Produces the `_source` returned with each hit.
#[derive(Debug)]
pub struct SourceStage {
    has_projection: bool,
    includes: Vec<WildMatch>,
    excludes: Vec<WildMatch>,
    index: String,
    source_enabled: bool,
}

impl SourceStage {
    pub fn new(source: &FetchSource) -> Self {
        Self {
            has_projection: source.has_projection(),
            includes: path::compile_patterns(&source.includes),
            excludes: path::compile_patterns(&source.excludes),
            index: String::new(),
            source_enabled: false,
        }
    }
}

impl FetchStage for SourceStage {
    fn name(&self) -> &'static str {
        "source"
    }

    fn set_next_reader(&mut self, segment: &SegmentContext<'_>) -> Result<(), FetchError> {
        self.index.clone_from(&segment.shard_id.index);
        self.source_enabled = segment.info.source_enabled;
        Ok(())
    }

    fn process(&self, hit: &mut HitContext) -> Result<(), FetchError> {
        let needs_rewrite = self.has_projection || hit.nested().is_some();
        let raw = match hit.raw_source() {
            Some(raw) if self.source_enabled => raw.clone(),
            _ if needs_rewrite => {
                return Err(FetchError::SourceDisabled {
                    index: self.index.clone(),
                });
            }
            _ => return Ok(()),
        };

        if !needs_rewrite {
            hit.source = Some(raw);
            return Ok(());
        }

        let mut value = path::parse_source(&raw)?;
        if let Some(nested) = hit.nested() {
            value = path::extract_nested(&value, nested)?;
        }
        if self.has_projection {
            value = path::filter_source(&value, &self.includes, &self.excludes);
        }
        let bytes = path::serialize_source(&value)?;
        hit.set_filtered_source(value, bytes);
        Ok(())
    }
}
