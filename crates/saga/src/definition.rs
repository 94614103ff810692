//! Data-driven saga definitions.
//!
//! A definition is an immutable transition table keyed by
//! `(source state, event)`, built once at startup and shared by every
//! instance of its saga type.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use outbox::{SagaCommand, SagaReply};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::verification::Resource;

macro_rules! symbol {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Cow<'static, str>);

        impl $name {
            pub const fn from_static(name: &'static str) -> Self {
                Self(Cow::Borrowed(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self(Cow::Owned(name.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(Cow::Owned(name))
            }
        }
    };
}

symbol!(
    /// Name of a saga state.
    StateId
);

symbol!(
    /// Name of an event fed to a saga.
    EventId
);

/// Fired by recovery to re-issue the pending command from a checkpoint.
pub const RESUME: EventId = EventId::from_static("RESUME");

/// Fired to begin compensation from the current state.
pub const COMPENSATE: EventId = EventId::from_static("COMPENSATE");

/// Outcome a terminal state maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Completed,
    Failed,
}

/// A command an action wants delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    pub routing_key: String,
    pub command: SagaCommand,
}

/// Result of running a transition action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    /// Snapshot recorded on the checkpoint.
    pub result: serde_json::Value,
    pub commands: Vec<OutboundCommand>,
}

/// A transition action rejected its input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{action}: {reason}")]
pub struct ActionError {
    pub action: &'static str,
    pub reason: String,
}

/// Work attached to a transition.
///
/// Actions are pure: they may update the context and ask for commands to be
/// staged, but never perform I/O themselves.
pub trait SagaAction: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(
        &self,
        saga_id: SagaId,
        context: &mut SagaContext,
    ) -> std::result::Result<ActionOutput, ActionError>;
}

/// One row of the transition table.
#[derive(Clone)]
pub struct Transition {
    pub target: StateId,
    pub action: Option<Arc<dyn SagaAction>>,
    /// Audit and metrics flag; routing never depends on it.
    pub is_compensation: bool,
}

impl Transition {
    pub fn action_name(&self) -> Option<&'static str> {
        self.action.as_ref().map(|a| a.name())
    }
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("target", &self.target)
            .field("action", &self.action_name())
            .field("is_compensation", &self.is_compensation)
            .finish()
    }
}

pub type ContextValidator = fn(&SagaContext) -> std::result::Result<(), String>;
pub type ReplyMapper = fn(&SagaReply) -> Option<EventId>;
pub type VerificationTarget = fn(&StateId, &SagaContext) -> Option<Resource>;

/// Static description of one saga type.
pub struct SagaDefinition {
    saga_type: String,
    initial_state: StateId,
    start_event: Option<EventId>,
    terminal: HashMap<StateId, TerminalOutcome>,
    transitions: HashMap<(StateId, EventId), Transition>,
    timeout: Duration,
    validator: Option<ContextValidator>,
    reply_mapper: Option<ReplyMapper>,
    verification_target: Option<VerificationTarget>,
}

impl SagaDefinition {
    pub fn builder(saga_type: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder::new(saga_type)
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn initial_state(&self) -> &StateId {
        &self.initial_state
    }

    /// Event `launch` fires right after `start`, if any.
    pub fn start_event(&self) -> Option<&EventId> {
        self.start_event.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transition(&self, state: &StateId, event: &EventId) -> Option<&Transition> {
        self.transitions.get(&(state.clone(), event.clone()))
    }

    pub fn outcome(&self, state: &StateId) -> Option<TerminalOutcome> {
        self.terminal.get(state).copied()
    }

    pub fn is_terminal(&self, state: &StateId) -> bool {
        self.terminal.contains_key(state)
    }

    /// Every state named by the definition.
    pub fn states(&self) -> BTreeSet<StateId> {
        let mut states: BTreeSet<StateId> = self.terminal.keys().cloned().collect();
        states.insert(self.initial_state.clone());
        for ((source, _), transition) in &self.transitions {
            states.insert(source.clone());
            states.insert(transition.target.clone());
        }
        states
    }

    /// Every event named by the definition.
    pub fn events(&self) -> BTreeSet<EventId> {
        self.transitions.keys().map(|(_, e)| e.clone()).collect()
    }

    /// Checks a context supplied to start a saga.
    ///
    /// Fields the engine owns must be unset; the saga type's own validator
    /// runs afterwards.
    pub fn validate(&self, context: &SagaContext) -> Result<()> {
        let owned = context.engine_owned_fields();
        if !owned.is_empty() {
            return Err(SagaError::InvalidContext(format!(
                "engine-owned fields must not be set: {}",
                owned.join(", ")
            )));
        }
        match self.validator {
            Some(validate) => validate(context).map_err(SagaError::InvalidContext),
            None => Ok(()),
        }
    }

    /// Maps a downstream reply to this saga type's event.
    pub fn map_reply(&self, reply: &SagaReply) -> Option<EventId> {
        self.reply_mapper.and_then(|map| map(reply))
    }

    /// Downstream resource to check before resuming a saga in `state`.
    pub fn verification_target(&self, state: &StateId, context: &SagaContext) -> Option<Resource> {
        self.verification_target
            .and_then(|target| target(state, context))
    }
}

impl std::fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("saga_type", &self.saga_type)
            .field("initial_state", &self.initial_state)
            .field("transitions", &self.transitions.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder {
    saga_type: String,
    initial_state: Option<StateId>,
    start_event: Option<EventId>,
    terminal: HashMap<StateId, TerminalOutcome>,
    transitions: HashMap<(StateId, EventId), Transition>,
    timeout: Duration,
    validator: Option<ContextValidator>,
    reply_mapper: Option<ReplyMapper>,
    verification_target: Option<VerificationTarget>,
    problems: Vec<String>,
}

impl SagaDefinitionBuilder {
    fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            initial_state: None,
            start_event: None,
            terminal: HashMap::new(),
            transitions: HashMap::new(),
            timeout: Duration::from_secs(30 * 60),
            validator: None,
            reply_mapper: None,
            verification_target: None,
            problems: Vec::new(),
        }
    }

    pub fn initial_state(mut self, state: StateId) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn start_event(mut self, event: EventId) -> Self {
        self.start_event = Some(event);
        self
    }

    pub fn terminal(mut self, state: StateId, outcome: TerminalOutcome) -> Self {
        self.terminal.insert(state, outcome);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validator(mut self, validator: ContextValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn reply_mapper(mut self, mapper: ReplyMapper) -> Self {
        self.reply_mapper = Some(mapper);
        self
    }

    pub fn verification_target(mut self, target: VerificationTarget) -> Self {
        self.verification_target = Some(target);
        self
    }

    /// Adds a forward transition without an action.
    pub fn transition(self, source: StateId, event: EventId, target: StateId) -> Self {
        self.add(source, event, target, None, false)
    }

    /// Adds a forward transition running `action`.
    pub fn action_transition(
        self,
        source: StateId,
        event: EventId,
        target: StateId,
        action: Arc<dyn SagaAction>,
    ) -> Self {
        self.add(source, event, target, Some(action), false)
    }

    /// Adds a compensating transition.
    pub fn compensation(
        self,
        source: StateId,
        event: EventId,
        target: StateId,
        action: Option<Arc<dyn SagaAction>>,
    ) -> Self {
        self.add(source, event, target, action, true)
    }

    fn add(
        mut self,
        source: StateId,
        event: EventId,
        target: StateId,
        action: Option<Arc<dyn SagaAction>>,
        is_compensation: bool,
    ) -> Self {
        let key = (source, event);
        if self.transitions.contains_key(&key) {
            self.problems
                .push(format!("duplicate transition ({}, {})", key.0, key.1));
        }
        self.transitions.insert(
            key,
            Transition {
                target,
                action,
                is_compensation,
            },
        );
        self
    }

    pub fn build(self) -> Result<SagaDefinition> {
        let mut problems = self.problems;

        let Some(initial_state) = self.initial_state else {
            return Err(SagaError::InvalidDefinition(format!(
                "{}: initial state is not set",
                self.saga_type
            )));
        };
        if self.terminal.is_empty() {
            problems.push("no terminal states".to_string());
        }
        for (source, event) in self.transitions.keys() {
            if self.terminal.contains_key(source) {
                problems.push(format!("terminal state {source} has outgoing event {event}"));
            }
        }
        if let Some(ref event) = self.start_event
            && !self
                .transitions
                .contains_key(&(initial_state.clone(), event.clone()))
        {
            problems.push(format!(
                "start event {event} has no transition from {initial_state}"
            ));
        }

        if !problems.is_empty() {
            problems.sort();
            return Err(SagaError::InvalidDefinition(format!(
                "{}: {}",
                self.saga_type,
                problems.join("; ")
            )));
        }

        Ok(SagaDefinition {
            saga_type: self.saga_type,
            initial_state,
            start_event: self.start_event,
            terminal: self.terminal,
            transitions: self.transitions,
            timeout: self.timeout,
            validator: self.validator,
            reply_mapper: self.reply_mapper,
            verification_target: self.verification_target,
        })
    }
}

/// Definitions by saga type.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<SagaDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: SagaDefinition) -> &mut Self {
        self.definitions
            .insert(definition.saga_type().to_string(), Arc::new(definition));
        self
    }

    pub fn with(mut self, definition: SagaDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, saga_type: &str) -> Result<Arc<SagaDefinition>> {
        self.definitions
            .get(saga_type)
            .cloned()
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    pub fn saga_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: StateId = StateId::from_static("A");
    const B: StateId = StateId::from_static("B");
    const DONE: StateId = StateId::from_static("DONE");
    const GO: EventId = EventId::from_static("GO");
    const FINISH: EventId = EventId::from_static("FINISH");

    #[test]
    fn test_builds_table_and_reports_states() {
        let definition = SagaDefinition::builder("TEST")
            .initial_state(A)
            .start_event(GO)
            .terminal(DONE, TerminalOutcome::Completed)
            .transition(A, GO, B)
            .transition(B, FINISH, DONE)
            .build()
            .unwrap();

        assert_eq!(definition.transition(&A, &GO).unwrap().target, B);
        assert!(definition.transition(&A, &FINISH).is_none());
        assert_eq!(definition.outcome(&DONE), Some(TerminalOutcome::Completed));
        assert_eq!(definition.states().len(), 3);
        assert_eq!(definition.events().len(), 2);
    }

    #[test]
    fn test_rejects_duplicate_and_terminal_outgoing() {
        let err = SagaDefinition::builder("TEST")
            .initial_state(A)
            .terminal(DONE, TerminalOutcome::Failed)
            .transition(A, GO, B)
            .transition(A, GO, DONE)
            .transition(DONE, GO, A)
            .build()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("duplicate transition (A, GO)"));
        assert!(message.contains("terminal state DONE"));
    }

    #[test]
    fn test_requires_initial_state() {
        let result = SagaDefinition::builder("TEST")
            .terminal(DONE, TerminalOutcome::Completed)
            .build();
        assert!(matches!(result, Err(SagaError::InvalidDefinition(_))));
    }

    #[test]
    fn test_owned_and_static_symbols_compare_equal() {
        assert_eq!(StateId::from("A"), A);
        assert_eq!(
            serde_json::to_string(&EventId::from("GO".to_string())).unwrap(),
            "\"GO\""
        );
    }

    #[test]
    fn test_registry_reports_unknown_type() {
        let registry = DefinitionRegistry::new();
        assert!(matches!(
            registry.get("NOPE"),
            Err(SagaError::UnknownSagaType(_))
        ));
    }
}
