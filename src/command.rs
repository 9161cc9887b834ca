use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
};

use crate::{Uuid, ValidationError};

/// The `Command` trait defines a request to change the state of one aggregate instance.
///
/// Commands are immutable. The aggregate that handles a command type is declared on the
/// aggregate side (see [`AggregateDefinition::command`]); the command itself only names the
/// instance it targets.
///
/// [`AggregateDefinition::command`]: crate::AggregateDefinition::command
///
/// ## Example
///
/// ```rust
/// use droplet_es::{Command, Uuid};
///
/// struct AddFunds {
///     account_id: Option<Uuid>,
///     funds: i64,
/// }
///
/// impl Command for AddFunds {
///     fn aggregate_id(&self) -> Option<Uuid> {
///         self.account_id
///     }
/// }
/// ```
pub trait Command: Any + Send + Sync {
    /// The ID of the targeted aggregate, `None` when the command is malformed.
    fn aggregate_id(&self) -> Option<Uuid>;
}

/// Checks a command before it reaches its handler.
///
/// Validation runs after the aggregate is loaded and before the handler, and a failure
/// leaves the stream untouched.
pub trait CommandValidator: Send + Sync {
    fn validate(&self, command: &dyn Command) -> Result<(), ValidationError>;
}

/// Accepts every command.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoValidation;

impl CommandValidator for NoValidation {
    fn validate(&self, _command: &dyn Command) -> Result<(), ValidationError> {
        Ok(())
    }
}

type Rule = Box<dyn Fn(&dyn Any) -> Result<(), ValidationError> + Send + Sync>;

/// A validator built from per-command-type rules.
///
/// Every rule registered for the command's type runs, and their violations are merged.
/// Commands without rules pass.
///
/// ```rust
/// use droplet_es::{Command, RuleValidator, Uuid, ValidationError};
///
/// struct Rename {
///     id: Uuid,
///     name: String,
/// }
///
/// impl Command for Rename {
///     fn aggregate_id(&self) -> Option<Uuid> {
///         Some(self.id)
///     }
/// }
///
/// let validator = RuleValidator::new().rule(|c: &Rename| {
///     if c.name.trim().is_empty() {
///         return Err(ValidationError::field("name", "must not be blank"));
///     }
///     Ok(())
/// });
/// ```
#[derive(Default)]
pub struct RuleValidator {
    rules: HashMap<TypeId, Vec<Rule>>,
}

impl RuleValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule<C, F>(mut self, rule: F) -> Self
    where
        C: Command,
        F: Fn(&C) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        let erased: Rule = Box::new(move |command: &dyn Any| match command.downcast_ref::<C>() {
            Some(command) => rule(command),
            None => Err(ValidationError::field(
                "command",
                format!("expected `{}`", type_name::<C>()),
            )),
        });
        self.rules.entry(TypeId::of::<C>()).or_default().push(erased);
        self
    }
}

impl CommandValidator for RuleValidator {
    fn validate(&self, command: &dyn Command) -> Result<(), ValidationError> {
        let command: &dyn Any = command;
        let Some(rules) = self.rules.get(&command.type_id()) else {
            return Ok(());
        };

        let mut errors = ValidationError::new();
        for rule in rules {
            if let Err(err) = rule(command) {
                errors.extend(err);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Open {
        id: Option<Uuid>,
        name: String,
        limit: i64,
    }

    impl Command for Open {
        fn aggregate_id(&self) -> Option<Uuid> {
            self.id
        }
    }

    struct Close;

    impl Command for Close {
        fn aggregate_id(&self) -> Option<Uuid> {
            None
        }
    }

    fn validator() -> RuleValidator {
        RuleValidator::new()
            .rule(|c: &Open| {
                if c.name.is_empty() {
                    return Err(ValidationError::field("name", "must not be blank"));
                }
                Ok(())
            })
            .rule(|c: &Open| {
                if c.limit < 0 {
                    return Err(ValidationError::field("limit", "must not be negative"));
                }
                Ok(())
            })
    }

    #[test]
    fn merges_violations_of_every_rule() {
        let err = validator()
            .validate(&Open {
                id: Some(Uuid::new_v4()),
                name: String::new(),
                limit: -1,
            })
            .unwrap_err();

        let fields: Vec<&str> = err.violations().iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "limit"]);
    }

    #[test]
    fn valid_command_passes() {
        assert!(validator()
            .validate(&Open {
                id: None,
                name: "main".to_string(),
                limit: 10,
            })
            .is_ok());
    }

    #[test]
    fn commands_without_rules_pass() {
        assert!(validator().validate(&Close).is_ok());
        assert!(NoValidation.validate(&Close).is_ok());
    }
}
