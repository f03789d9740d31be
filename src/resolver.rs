use std::collections::HashMap;

use crate::error::{DispatchError, Result};
use crate::model::{JobInstance, Properties};

/// Resolves the job definition an instance was submitted with, after
/// restart-parameter substitution.
pub trait JobDefinitionResolver: Send + Sync {
    fn is_restartable(&self, instance: &JobInstance, restart_parameters: &Properties)
        -> Result<bool>;
}

/// The only job-definition attribute the dispatch layer reads.
#[derive(Debug, Clone, Default)]
pub struct JobDefinition {
    /// `None` means restartable.
    pub restartable: Option<String>,
}

impl JobDefinition {
    pub fn restartable(value: impl Into<String>) -> Self {
        Self {
            restartable: Some(value.into()),
        }
    }
}

/// Definitions registered up front, keyed by definition reference.
#[derive(Debug, Clone, Default)]
pub struct StaticDefinitions {
    definitions: HashMap<String, JobDefinition>,
}

impl StaticDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition(mut self, definition_ref: impl Into<String>, definition: JobDefinition) -> Self {
        self.definitions.insert(definition_ref.into(), definition);
        self
    }
}

impl JobDefinitionResolver for StaticDefinitions {
    fn is_restartable(
        &self,
        instance: &JobInstance,
        restart_parameters: &Properties,
    ) -> Result<bool> {
        let definition = self
            .definitions
            .get(&instance.definition_ref)
            .ok_or_else(|| DispatchError::UnknownDefinition(instance.definition_ref.clone()))?;

        let Some(raw) = &definition.restartable else {
            return Ok(true);
        };
        let resolved = substitute_job_parameters(raw, restart_parameters);
        match resolved.trim().to_ascii_lowercase().as_str() {
            "" | "true" => Ok(true),
            "false" => Ok(false),
            other => Err(DispatchError::InvalidDefinition {
                definition_ref: instance.definition_ref.clone(),
                reason: format!("restartable must be true or false, got '{}'", other),
            }),
        }
    }
}

const PARAMETER_OPEN: &str = "#{jobParameters['";
const PARAMETER_CLOSE: &str = "']}";

/// Replaces every `#{jobParameters['name']}` with the named parameter, or
/// with nothing when it is absent. An unterminated reference is kept as is.
pub fn substitute_job_parameters(template: &str, parameters: &Properties) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(PARAMETER_OPEN) {
        let after_open = &rest[start + PARAMETER_OPEN.len()..];
        let Some(end) = after_open.find(PARAMETER_CLOSE) else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = &after_open[..end];
        if let Some(value) = parameters.get(name) {
            out.push_str(value);
        }
        rest = &after_open[end + PARAMETER_CLOSE.len()..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(definition_ref: &str) -> JobInstance {
        JobInstance::new(
            1,
            "payroll".to_string(),
            "alice".to_string(),
            definition_ref.to_string(),
            chrono::Utc::now(),
        )
    }

    fn params(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitution() {
        let p = params(&[("mode", "false"), ("region", "eu")]);
        assert_eq!(substitute_job_parameters("#{jobParameters['mode']}", &p), "false");
        assert_eq!(
            substitute_job_parameters("a-#{jobParameters['region']}-#{jobParameters['x']}-b", &p),
            "a-eu--b"
        );
        assert_eq!(
            substitute_job_parameters("#{jobParameters['mode'", &p),
            "#{jobParameters['mode'"
        );
    }

    #[test]
    fn absent_attribute_is_restartable() {
        let defs = StaticDefinitions::new().with_definition("payroll.xml", JobDefinition::default());
        assert!(defs.is_restartable(&instance("payroll.xml"), &Properties::new()).unwrap());
    }

    #[test]
    fn restart_parameters_decide_restartability() {
        let defs = StaticDefinitions::new().with_definition(
            "payroll.xml",
            JobDefinition::restartable("#{jobParameters['restartable']}"),
        );
        let inst = instance("payroll.xml");
        assert!(!defs
            .is_restartable(&inst, &params(&[("restartable", "false")]))
            .unwrap());
        assert!(defs
            .is_restartable(&inst, &params(&[("restartable", "TRUE")]))
            .unwrap());
    }

    #[test]
    fn unknown_and_invalid_definitions() {
        let defs = StaticDefinitions::new()
            .with_definition("bad.xml", JobDefinition::restartable("maybe"));
        assert!(matches!(
            defs.is_restartable(&instance("missing.xml"), &Properties::new()),
            Err(DispatchError::UnknownDefinition(_))
        ));
        assert!(matches!(
            defs.is_restartable(&instance("bad.xml"), &Properties::new()),
            Err(DispatchError::InvalidDefinition { .. })
        ));
    }
}
