use gather_protocol::SearchRequest;
use std::sync::Arc;

use super::FetchStage;
use super::FieldsStage;
use super::MatchedQueriesStage;
use super::PerHitStageFactory;
use super::ScriptEngine;
use super::ScriptFieldsStage;
use super::SourceLookupScriptEngine;
use super::SourceStage;
use crate::error::FetchError;

/// Builds the canonical stages in their fixed order: source, fields,
/// script fields, matched queries. Stages the request does not need are left
/// out entirely.
#[derive(Clone)]
pub struct DefaultStageFactory {
    script_engine: Option<Arc<dyn ScriptEngine>>,
}

impl std::fmt::Debug for DefaultStageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultStageFactory")
            .field("script_engine", &self.script_engine.is_some())
            .finish()
    }
}

impl Default for DefaultStageFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultStageFactory {
    pub fn new() -> Self {
        Self {
            script_engine: Some(Arc::new(SourceLookupScriptEngine)),
        }
    }

    pub fn with_script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.script_engine = Some(engine);
        self
    }

    pub fn without_script_engine(mut self) -> Self {
        self.script_engine = None;
        self
    }
}

impl PerHitStageFactory for DefaultStageFactory {
    fn build(&self, request: &SearchRequest) -> Result<Vec<Box<dyn FetchStage>>, FetchError> {
        let mut stages: Vec<Box<dyn FetchStage>> = Vec::new();
        if request.source.enabled {
            stages.push(Box::new(SourceStage::new(&request.source)));
        }
        if !request.fields.is_empty() {
            stages.push(Box::new(FieldsStage::new(&request.fields)));
        }
        if !request.script_fields.is_empty() {
            let engine = self
                .script_engine
                .as_deref()
                .ok_or(FetchError::ScriptEngineMissing)?;
            stages.push(Box::new(ScriptFieldsStage::compile(
                engine,
                &request.script_fields,
            )?));
        }
        if !request.named_queries.is_empty() {
            let names = request
                .named_queries
                .iter()
                .map(|query| query.name.clone())
                .collect();
            stages.push(Box::new(MatchedQueriesStage::new(names)));
        }
        Ok(stages)
    }
}
