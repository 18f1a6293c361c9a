//! Task-type to model resolution.

use super::config::{ModelRouterConfig, ModelSpec, TaskType};
use super::errors::OptimizationError;

/// Immutable router built from a validated config.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    config: ModelRouterConfig,
    fallback: ModelSpec,
}

impl ModelRouter {
    /// Build a router. A config with neither task models nor a global
    /// fallback is rejected.
    pub fn new(config: ModelRouterConfig) -> Result<Self, OptimizationError> {
        config.validate()?;
        let fallback = match &config.fallback {
            Some(f) if !f.model.trim().is_empty() => f.clone(),
            // validate() guarantees at least one task model here
            _ => {
                let mut tasks: Vec<_> = config.tasks.iter().collect();
                tasks.sort_by_key(|(t, _)| t.as_str());
                tasks
                    .first()
                    .map(|(_, spec)| (*spec).clone())
                    .ok_or(OptimizationError::InvalidConfig {
                        config_type: super::config::MODEL_ROUTER,
                        reason: "no models configured".into(),
                    })?
            }
        };
        Ok(Self { config, fallback })
    }

    /// Configured model for `task`, or the global fallback.
    pub fn get_model(&self, task: TaskType) -> &ModelSpec {
        self.config.tasks.get(&task).unwrap_or(&self.fallback)
    }

    /// Models to try in order: the task's own, its fallbacks, the global
    /// priority list, then the terminal fallback. Duplicates are dropped.
    pub fn fallback_chain(&self, task: TaskType) -> Vec<String> {
        let primary = self.get_model(task);
        let mut chain: Vec<String> = Vec::new();
        let mut push = |model: &str| {
            if !model.is_empty() && !chain.iter().any(|m| m == model) {
                chain.push(model.to_string());
            }
        };
        push(&primary.model);
        for m in &primary.fallbacks {
            push(m);
        }
        for m in &self.config.priority {
            push(m);
        }
        push(&self.fallback.model);
        chain
    }

    pub fn config(&self) -> &ModelRouterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ModelRouter {
        let config: ModelRouterConfig = serde_json::from_value(serde_json::json!({
            "tasks": {
                "routing": {"model": "small", "temperature": 0.1, "fallbacks": ["small-b"]},
                "summary": {"model": "big", "max_tokens": 2048}
            },
            "fallback": {"model": "default"},
            "priority": ["big", "mid"]
        }))
        .unwrap();
        ModelRouter::new(config).unwrap()
    }

    #[test]
    fn test_get_model_and_fallback() {
        let r = router();
        assert_eq!(r.get_model(TaskType::Routing).model, "small");
        assert_eq!(r.get_model(TaskType::Summary).max_tokens, Some(2048));
        assert_eq!(r.get_model(TaskType::Knowledge).model, "default");
    }

    #[test]
    fn test_fallback_chain_order() {
        let r = router();
        assert_eq!(
            r.fallback_chain(TaskType::Routing),
            vec!["small", "small-b", "big", "mid", "default"]
        );
        assert_eq!(
            r.fallback_chain(TaskType::Summary),
            vec!["big", "mid", "default"]
        );
    }

    #[test]
    fn test_empty_router_rejected() {
        assert!(ModelRouter::new(ModelRouterConfig::default()).is_err());
    }

    #[test]
    fn test_tasks_without_global_fallback() {
        let config: ModelRouterConfig =
            serde_json::from_value(serde_json::json!({"tasks": {"summary": {"model": "big"}}}))
                .unwrap();
        let r = ModelRouter::new(config).unwrap();
        assert_eq!(r.get_model(TaskType::Routing).model, "big");
    }
}
