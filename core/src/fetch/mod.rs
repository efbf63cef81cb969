//! Per-hit enrichment of the final hit list.
//!
//! A [`FetchPipeline`] is an ordered list of [`FetchStage`]s. For every
//! physical segment the pipeline calls [`FetchStage::set_next_reader`] on
//! each stage once, then [`FetchStage::process`] for every hit of that
//! segment, stage by stage.

mod factory;
mod fields;
mod matched_queries;
mod path;
mod script;
mod source;

use bytes::Bytes;
use gather_protocol::FetchResult;
use gather_protocol::NestedIdentity;
use gather_protocol::SearchRequest;
use gather_protocol::SegmentInfo;
use gather_protocol::ShardId;
use gather_protocol::ShardOrdinal;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::error::FetchError;

pub use factory::DefaultStageFactory;
pub use fields::FieldsStage;
pub use matched_queries::MatchedQueriesStage;
pub use script::CompiledScript;
pub use script::ScriptEngine;
pub use script::ScriptFieldsStage;
pub use script::SourceLookupScriptEngine;
pub use source::SourceStage;

/// The physical segment the next batch of hits comes from.
#[derive(Debug, Clone, Copy)]
pub struct SegmentContext<'a> {
    pub ordinal: ShardOrdinal,
    pub shard_id: &'a ShardId,
    pub info: &'a SegmentInfo,
}

/// A hit being enriched. Identity fields are read-only; stages only fill in
/// the auxiliary outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct HitContext {
    ordinal: ShardOrdinal,
    doc: u32,
    segment: u32,
    nested: Option<NestedIdentity>,
    raw_source: Option<Bytes>,
    stored_value: Option<Value>,
    filtered_value: Option<Value>,

    pub source: Option<Bytes>,
    pub fields: BTreeMap<String, Vec<Value>>,
    pub matched_queries: Vec<String>,
}

impl HitContext {
    pub fn new(
        ordinal: ShardOrdinal,
        doc: u32,
        segment: u32,
        nested: Option<NestedIdentity>,
        raw_source: Option<Bytes>,
    ) -> Self {
        Self {
            ordinal,
            doc,
            segment,
            nested,
            raw_source,
            stored_value: None,
            filtered_value: None,
            source: None,
            fields: BTreeMap::new(),
            matched_queries: Vec::new(),
        }
    }

    pub fn ordinal(&self) -> ShardOrdinal {
        self.ordinal
    }

    pub fn doc(&self) -> u32 {
        self.doc
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    pub fn nested(&self) -> Option<&NestedIdentity> {
        self.nested.as_ref()
    }

    pub fn raw_source(&self) -> Option<&Bytes> {
        self.raw_source.as_ref()
    }

    /// The full stored source, parsed on first use.
    pub fn stored_source(&mut self) -> Result<Option<&Value>, FetchError> {
        if self.stored_value.is_none()
            && let Some(raw) = &self.raw_source
        {
            self.stored_value = Some(path::parse_source(raw)?);
        }
        Ok(self.stored_value.as_ref())
    }

    /// The source as returned to the caller: the projected source when a
    /// projection was applied, the stored source otherwise.
    pub fn source_value(&mut self) -> Result<Option<&Value>, FetchError> {
        if self.filtered_value.is_some() {
            return Ok(self.filtered_value.as_ref());
        }
        self.stored_source()
    }

    pub fn set_filtered_source(&mut self, value: Value, bytes: Bytes) {
        self.filtered_value = Some(value);
        self.source = Some(bytes);
    }
}

pub trait FetchStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once per segment before any hit of that segment.
    fn set_next_reader(&mut self, segment: &SegmentContext<'_>) -> Result<(), FetchError>;

    fn process(&self, hit: &mut HitContext) -> Result<(), FetchError>;
}

pub trait PerHitStageFactory: Send + Sync {
    /// May return no stages at all.
    fn build(&self, request: &SearchRequest) -> Result<Vec<Box<dyn FetchStage>>, FetchError>;
}

pub struct FetchPipeline {
    stages: Vec<Box<dyn FetchStage>>,
}

impl std::fmt::Debug for FetchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchPipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl FetchPipeline {
    pub fn new(stages: Vec<Box<dyn FetchStage>>) -> Self {
        Self { stages }
    }

    pub fn build(
        factory: &dyn PerHitStageFactory,
        request: &SearchRequest,
    ) -> Result<Self, FetchError> {
        Ok(Self::new(factory.build(request)?))
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Enriches every doc of one shard's fetch result. Hits come back in the
    /// order of `result.docs`.
    pub fn run(
        &mut self,
        ordinal: ShardOrdinal,
        shard_id: &ShardId,
        result: &FetchResult,
    ) -> Result<Vec<HitContext>, FetchError> {
        let segments: HashMap<u32, &SegmentInfo> = result
            .segments
            .iter()
            .map(|segment| (segment.ord, segment))
            .collect();

        let mut hits: Vec<HitContext> = result
            .docs
            .iter()
            .map(|doc| {
                HitContext::new(
                    ordinal,
                    doc.doc,
                    doc.segment,
                    doc.nested.clone(),
                    doc.source.clone(),
                )
            })
            .collect();

        let mut order: Vec<usize> = (0..hits.len()).collect();
        order.sort_by_key(|index| (hits[*index].segment, hits[*index].doc));

        let mut current_segment: Option<u32> = None;
        for index in order {
            let hit = &mut hits[index];
            if current_segment != Some(hit.segment) {
                let info = segments
                    .get(&hit.segment)
                    .copied()
                    .ok_or(FetchError::UnknownSegment {
                        doc: hit.doc,
                        segment: hit.segment,
                    })?;
                let context = SegmentContext {
                    ordinal,
                    shard_id,
                    info,
                };
                for stage in &mut self.stages {
                    stage.set_next_reader(&context)?;
                }
                current_segment = Some(hit.segment);
            }
            for stage in &self.stages {
                stage.process(hit)?;
            }
        }
        Ok(hits)
    }
}
