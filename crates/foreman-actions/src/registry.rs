//! [`ActionRegistry`] – name-keyed action factories.
//!
//! The executor resolves every [`ActionSpec`] in a plan through the registry
//! and never looks at action names itself. Registering a factory under an
//! existing name replaces it.

use std::collections::HashMap;

use foreman_types::{ActionError, ActionSpec, ForemanError};

use crate::action::Action;

/// Builds a fresh action from its plan step.
pub type ActionFactory =
    Box<dyn Fn(&ActionSpec) -> Result<Box<dyn Action>, ActionError> + Send + Sync>;

/// Central action factory table.
#[derive(Default)]
pub struct ActionRegistry {
    factories: HashMap<String, ActionFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ActionSpec) -> Result<Box<dyn Action>, ActionError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Instantiate the action described by `spec`.
    ///
    /// # Errors
    ///
    /// * [`ForemanError::UnknownAction`] when no factory is registered.
    /// * [`ForemanError::ActionExecution`] when the factory rejects the
    ///   parameters.
    pub fn create(&self, spec: &ActionSpec) -> Result<Box<dyn Action>, ForemanError> {
        let factory = self
            .factories
            .get(&spec.action)
            .ok_or_else(|| ForemanError::UnknownAction(spec.action.clone()))?;
        factory(spec).map_err(|err| ForemanError::ActionExecution {
            action: spec.action.clone(),
            details: err.to_string(),
            recoverable: matches!(err, ActionError::Recoverable(_)),
        })
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionContext;

    struct Noop;

    impl Action for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn tick(&mut self, _ctx: &mut ActionContext<'_>) -> Result<u32, ActionError> {
            Ok(0)
        }
        fn progress(&self) -> u32 {
            0
        }
        fn total_steps(&self) -> u32 {
            0
        }
        fn is_complete(&self) -> bool {
            true
        }
        fn did_succeed(&self) -> bool {
            true
        }
    }

    #[test]
    fn create_resolves_registered_factory() -> Result<(), Box<dyn std::error::Error>> {
        let mut registry = ActionRegistry::new();
        registry.register("noop", |_spec| Ok(Box::new(Noop) as Box<dyn Action>));
        let action = registry.create(&ActionSpec::new("noop"))?;
        assert_eq!(action.name(), "noop");
        assert!(registry.contains("noop"));
        Ok(())
    }

    #[test]
    fn unknown_action_is_reported_by_name() {
        let registry = ActionRegistry::new();
        let err = registry.create(&ActionSpec::new("fly")).err();
        assert_eq!(err, Some(ForemanError::UnknownAction("fly".to_string())));
    }

    #[test]
    fn factory_rejection_maps_to_action_execution() {
        let mut registry = ActionRegistry::new();
        registry.register("picky", |spec| {
            Err(ActionError::InvalidParameters {
                action: spec.action.clone(),
                details: "missing 'x'".to_string(),
            })
        });
        match registry.create(&ActionSpec::new("picky")) {
            Err(ForemanError::ActionExecution {
                action,
                recoverable,
                ..
            }) => {
                assert_eq!(action, "picky");
                assert!(!recoverable);
            }
            other => panic!("unexpected result: {:?}", other.map(|a| a.name().to_string())),
        }
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = ActionRegistry::new();
        registry.register("wait", |_| Ok(Box::new(Noop) as Box<dyn Action>));
        registry.register("build", |_| Ok(Box::new(Noop) as Box<dyn Action>));
        assert_eq!(registry.names(), vec!["build", "wait"]);
    }
}
