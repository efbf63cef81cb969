use gather_protocol::ScriptField;
use serde_json::Map;
use serde_json::Value;

use super::FetchStage;
use super::HitContext;
use super::SegmentContext;
use super::path;
use crate::error::FetchError;

/// Compiles script field sources. Compilation happens once per request.
pub trait ScriptEngine: Send + Sync {
    fn compile(
        &self,
        script: &str,
        params: &Map<String, Value>,
    ) -> Result<Box<dyn CompiledScript>, String>;
}

pub trait CompiledScript: Send + Sync {
    /// `source` is the hit's full stored source, if any.
    fn execute(&self, source: Option<&Value>) -> Result<Vec<Value>, String>;
}

/// Minimal engine for scripts of the form `_source.<path>` or
/// `params.<name>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceLookupScriptEngine;

enum Lookup {
    Source(String),
    Param(Value),
}

impl CompiledScript for Lookup {
    fn execute(&self, source: Option<&Value>) -> Result<Vec<Value>, String> {
        match self {
            Lookup::Source(field) => Ok(source
                .map(|source| path::collect_values(source, field))
                .unwrap_or_default()),
            Lookup::Param(value) => Ok(vec![value.clone()]),
        }
    }
}

impl ScriptEngine for SourceLookupScriptEngine {
    fn compile(
        &self,
        script: &str,
        params: &Map<String, Value>,
    ) -> Result<Box<dyn CompiledScript>, String> {
        let script = script.trim();
        if let Some(field) = script.strip_prefix("_source.")
            && !field.is_empty()
        {
            return Ok(Box::new(Lookup::Source(field.to_string())));
        }
        if let Some(name) = script.strip_prefix("params.") {
            return match params.get(name) {
                Some(value) => Ok(Box::new(Lookup::Param(value.clone()))),
                None => Err(format!("unknown parameter [{name}]")),
            };
        }
        Err(format!("unsupported script [{script}]"))
    }
}

pub struct ScriptFieldsStage {
    scripts: Vec<(String, Box<dyn CompiledScript>)>,
}

impl std::fmt::Debug for ScriptFieldsStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.scripts.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("ScriptFieldsStage")
            .field("scripts", &names)
            .finish()
    }
}

impl ScriptFieldsStage {
    pub fn compile(
        engine: &dyn ScriptEngine,
        fields: &[ScriptField],
    ) -> Result<Self, FetchError> {
        let scripts = fields
            .iter()
            .map(|field| {
                engine
                    .compile(&field.script, &field.params)
                    .map(|compiled| (field.name.clone(), compiled))
                    .map_err(|message| FetchError::ScriptCompilation {
                        name: field.name.clone(),
                        message,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { scripts })
    }
}

impl FetchStage for ScriptFieldsStage {
    fn name(&self) -> &'static str {
        "script_fields"
    }

    fn set_next_reader(&mut self, _segment: &SegmentContext<'_>) -> Result<(), FetchError> {
        Ok(())
    }

    fn process(&self, hit: &mut HitContext) -> Result<(), FetchError> {
        let mut computed = Vec::with_capacity(self.scripts.len());
        {
            let source = hit.stored_source()?;
            for (name, script) in &self.scripts {
                let values =
                    script
                        .execute(source)
                        .map_err(|message| FetchError::ScriptExecution {
                            name: name.clone(),
                            message,
                        })?;
                computed.push((name.clone(), values));
            }
        }
        hit.fields.extend(computed);
        Ok(())
    }
}
