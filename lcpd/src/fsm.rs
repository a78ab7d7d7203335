// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The generic state machine engine.
//!
//! A state machine *type* is an immutable transition table registered once
//! per process in a [`Registry`].  Per-entity *instances* are created in an
//! [`Engine`], which dispatches events synchronously, keeps a bounded
//! transition history per instance, and manages each instance's single
//! software timer.
//!
//! The engine holds no lock of its own: every call on a given instance is
//! expected to arrive under the enclosing switch lock.  Transition side
//! effects are expressed as data ([`Effect`]) rather than callbacks; the
//! dispatching layer interprets the domain-specific [`Effect::Action`]
//! codes after `dispatch` returns, which keeps the tables immutable and the
//! engine free of borrow entanglements.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use slog::debug;
use slog::o;
use slog::trace;

use crate::types::LcpdError;
use crate::types::LcpdResult;

/// Index into a type's state enumeration.
pub type State = u8;

/// Index into a type's event enumeration.
pub type Event = u8;

/// A side effect attached to a transition, applied by the engine (timers)
/// or handed back to the dispatching layer (actions).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Arm the instance timer to deliver `event` after `after`, replacing
    /// any previously armed timeout.  `None` uses the instance's configured
    /// default timeout.
    ArmTimer {
        event: Event,
        after: Option<Duration>,
    },
    /// Disarm the instance timer.
    CancelTimer,
    /// A domain action code, returned to the caller for interpretation.
    Action(u16),
}

/// One row of a transition table.
#[derive(Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: State,
    pub event: Event,
    pub to: State,
    pub effects: &'static [Effect],
}

/// An immutable state machine type: state and event enumerations plus the
/// transition relation.
#[derive(Debug, PartialEq, Eq)]
pub struct TransitionTable {
    /// Registry key for this type
    pub name: &'static str,
    /// State names, indexed by `State`
    pub states: &'static [&'static str],
    /// Event names, indexed by `Event`
    pub events: &'static [&'static str],
    /// State a fresh instance starts in
    pub initial: State,
    /// When set, an event with no transition from the current state is an
    /// error rather than being recorded and ignored
    pub fatal_unhandled: bool,
    pub transitions: &'static [Transition],
}

impl TransitionTable {
    fn find(&self, from: State, event: Event) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
    }
}

/// Handle to a registered state machine type.
#[derive(Clone, Copy)]
pub struct FsmType(&'static TransitionTable);

impl FsmType {
    pub fn name(&self) -> &'static str {
        self.0.name
    }
}

impl fmt::Debug for FsmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsmType({})", self.0.name)
    }
}

/// The process-wide collection of state machine types.  Built once at
/// startup and passed by reference to every component that creates
/// instances; registration is a constructor-time step, never a runtime
/// side effect.
#[derive(Default)]
pub struct Registry {
    types: BTreeMap<&'static str, &'static TransitionTable>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            types: BTreeMap::new(),
        }
    }

    /// Register a type.  Registering the same table twice is a no-op; a
    /// different table under an existing name is an error.
    pub fn register(
        &mut self,
        table: &'static TransitionTable,
    ) -> LcpdResult<FsmType> {
        match self.types.get(table.name) {
            Some(&existing) if existing == table => Ok(FsmType(existing)),
            Some(_) => Err(LcpdError::Exists(format!(
                "state machine type {} already registered \
                 with a different transition table",
                table.name
            ))),
            None => {
                self.types.insert(table.name, table);
                Ok(FsmType(table))
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<FsmType> {
        self.types.get(name).map(|&t| FsmType(t))
    }
}

/// One entry in an instance's bounded history ring.
#[derive(Clone, Copy, Debug)]
pub struct HistoryRecord {
    /// Milliseconds since the UNIX epoch
    pub timestamp: i64,
    /// State when the event arrived
    pub state: State,
    pub event: Event,
    /// State after the dispatch; equal to `state` for unhandled events
    pub next: State,
    /// False if no transition was defined for (state, event)
    pub handled: bool,
}

/// Handle to a state machine instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FsmId(u32);

impl fmt::Display for FsmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fsm-{}", self.0)
    }
}

#[cfg(test)]
impl FsmId {
    /// A placeholder handle for tests that never touch an engine.
    pub(crate) fn test_id() -> Self {
        FsmId(0)
    }
}

struct Instance {
    table: &'static TransitionTable,
    owner: String,
    state: State,
    history: VecDeque<HistoryRecord>,
    capacity: usize,
    timer: Option<(Instant, Event)>,
    timer_default: Duration,
}

/// The outcome of one dispatch: the transition taken and the domain action
/// codes the caller must now interpret.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub id: FsmId,
    #[allow(dead_code)]
    pub from: State,
    #[allow(dead_code)]
    pub to: State,
    pub handled: bool,
    pub actions: Vec<u16>,
}

/// Owns all state machine instances and their timers.
pub struct Engine {
    log: slog::Logger,
    instances: BTreeMap<u32, Instance>,
    next_id: u32,
}

impl Engine {
    pub fn new(log: &slog::Logger) -> Self {
        Engine {
            log: log.new(o!("unit" => "fsm")),
            instances: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Create an instance of `ty` in its initial state, with a history ring
    /// of `capacity` records and a timer defaulting to `timer_default`.
    pub fn create_instance(
        &mut self,
        ty: FsmType,
        owner: impl ToString,
        capacity: usize,
        timer_default: Duration,
    ) -> FsmId {
        let id = self.next_id;
        self.next_id += 1;
        let owner = owner.to_string();
        debug!(self.log, "created instance";
            "id" => id, "type" => ty.0.name, "owner" => &owner);
        self.instances.insert(
            id,
            Instance {
                table: ty.0,
                owner,
                state: ty.0.initial,
                history: VecDeque::new(),
                capacity: capacity.max(1),
                timer: None,
                timer_default,
            },
        );
        FsmId(id)
    }

    /// Release an instance, cancelling its timer and freeing its record.
    pub fn destroy_instance(&mut self, id: FsmId) -> LcpdResult<()> {
        match self.instances.remove(&id.0) {
            Some(inst) => {
                debug!(self.log, "destroyed instance";
                    "id" => %id, "owner" => &inst.owner);
                Ok(())
            }
            None => Err(LcpdError::Missing(format!("{id}"))),
        }
    }

    fn instance(&self, id: FsmId) -> LcpdResult<&Instance> {
        self.instances
            .get(&id.0)
            .ok_or_else(|| LcpdError::Missing(format!("{id}")))
    }

    pub fn state(&self, id: FsmId) -> LcpdResult<State> {
        Ok(self.instance(id)?.state)
    }

    pub fn state_name(&self, id: FsmId) -> LcpdResult<&'static str> {
        let inst = self.instance(id)?;
        Ok(inst.table.states[inst.state as usize])
    }

    pub fn type_name(&self, id: FsmId) -> LcpdResult<&'static str> {
        Ok(self.instance(id)?.table.name)
    }

    /// A copy of the instance's history, oldest record first.
    pub fn history(&self, id: FsmId) -> LcpdResult<Vec<HistoryRecord>> {
        Ok(self.instance(id)?.history.iter().copied().collect())
    }

    pub fn timer_armed(&self, id: FsmId) -> LcpdResult<bool> {
        Ok(self.instance(id)?.timer.is_some())
    }

    /// Arm the instance timer, replacing any previously armed timeout.
    pub fn arm_timer(
        &mut self,
        id: FsmId,
        event: Event,
        after: Duration,
    ) -> LcpdResult<()> {
        let inst = self
            .instances
            .get_mut(&id.0)
            .ok_or_else(|| LcpdError::Missing(format!("{id}")))?;
        inst.timer = Some((Instant::now() + after, event));
        Ok(())
    }

    /// Change the timeout used when a transition arms the timer without
    /// an explicit duration.
    pub fn set_timer_default(
        &mut self,
        id: FsmId,
        timer_default: Duration,
    ) -> LcpdResult<()> {
        let inst = self
            .instances
            .get_mut(&id.0)
            .ok_or_else(|| LcpdError::Missing(format!("{id}")))?;
        inst.timer_default = timer_default;
        Ok(())
    }

    pub fn cancel_timer(&mut self, id: FsmId) -> LcpdResult<()> {
        let inst = self
            .instances
            .get_mut(&id.0)
            .ok_or_else(|| LcpdError::Missing(format!("{id}")))?;
        inst.timer = None;
        Ok(())
    }

    /// Synchronously run one event against an instance: look up the
    /// transition for the current (state, event) pair, apply the state
    /// change and effects, and append a history record.  An event with no
    /// transition defined is recorded and ignored unless the instance's
    /// type marks unhandled events fatal.
    pub fn dispatch(
        &mut self,
        id: FsmId,
        event: Event,
    ) -> LcpdResult<DispatchOutcome> {
        let now = Instant::now();
        let inst = self
            .instances
            .get_mut(&id.0)
            .ok_or_else(|| LcpdError::Missing(format!("{id}")))?;
        if event as usize >= inst.table.events.len() {
            return Err(LcpdError::Invalid(format!(
                "event {event} out of range for {}",
                inst.table.name
            )));
        }
        let from = inst.state;

        let Some(transition) = inst.table.find(from, event) else {
            record(inst, from, event, from, false);
            trace!(self.log, "unhandled event";
                "id" => %id,
                "owner" => &inst.owner,
                "state" => inst.table.states[from as usize],
                "event" => inst.table.events[event as usize]);
            if inst.table.fatal_unhandled {
                return Err(LcpdError::Fsm(format!(
                    "{}: no transition from {} on {}",
                    inst.owner,
                    inst.table.states[from as usize],
                    inst.table.events[event as usize]
                )));
            }
            return Ok(DispatchOutcome {
                id,
                from,
                to: from,
                handled: false,
                actions: Vec::new(),
            });
        };

        let to = transition.to;
        let mut actions = Vec::new();
        for effect in transition.effects {
            match effect {
                Effect::ArmTimer { event, after } => {
                    let after = after.unwrap_or(inst.timer_default);
                    inst.timer = Some((now + after, *event));
                }
                Effect::CancelTimer => inst.timer = None,
                Effect::Action(code) => actions.push(*code),
            }
        }
        inst.state = to;
        record(inst, from, event, to, true);
        debug!(self.log, "transition";
            "id" => %id,
            "owner" => &inst.owner,
            "from" => inst.table.states[from as usize],
            "event" => inst.table.events[event as usize],
            "to" => inst.table.states[to as usize]);

        Ok(DispatchOutcome {
            id,
            from,
            to,
            handled: true,
            actions,
        })
    }

    /// Fire every expired timer by dispatching its timeout event.  Returns
    /// the outcomes so the caller can interpret any resulting actions.
    pub fn tick(&mut self) -> Vec<DispatchOutcome> {
        let now = Instant::now();
        let expired: Vec<(FsmId, Event)> = self
            .instances
            .iter()
            .filter_map(|(id, inst)| match inst.timer {
                Some((deadline, event)) if deadline <= now => {
                    Some((FsmId(*id), event))
                }
                _ => None,
            })
            .collect();

        let mut outcomes = Vec::new();
        for (id, event) in expired {
            // A timeout consumes the timer whether or not it's handled.
            if let Some(inst) = self.instances.get_mut(&id.0) {
                inst.timer = None;
            }
            match self.dispatch(id, event) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    slog::error!(self.log, "timeout dispatch failed";
                        "id" => %id, "error" => %e);
                }
            }
        }
        outcomes
    }
}

fn record(inst: &mut Instance, state: State, event: Event, next: State, handled: bool) {
    while inst.history.len() >= inst.capacity {
        let _ = inst.history.pop_front();
    }
    inst.history.push_back(HistoryRecord {
        timestamp: common::timestamp_ms(),
        state,
        event,
        next,
        handled,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    // A toy two-state machine used to exercise the engine itself.
    const TOGGLE: TransitionTable = TransitionTable {
        name: "test-toggle",
        states: &["Off", "On"],
        events: &["Flip", "Timeout", "Noise"],
        initial: 0,
        fatal_unhandled: false,
        transitions: &[
            Transition {
                from: 0,
                event: 0,
                to: 1,
                effects: &[
                    Effect::ArmTimer {
                        event: 1,
                        after: Some(Duration::ZERO),
                    },
                    Effect::Action(7),
                ],
            },
            Transition {
                from: 1,
                event: 0,
                to: 0,
                effects: &[Effect::CancelTimer],
            },
            Transition { from: 1, event: 1, to: 0, effects: &[] },
        ],
    };

    const STRICT: TransitionTable = TransitionTable {
        name: "test-strict",
        states: &["Off", "On"],
        events: &["Flip", "Timeout", "Noise"],
        initial: 0,
        fatal_unhandled: true,
        transitions: &[Transition {
            from: 0,
            event: 0,
            to: 1,
            effects: &[],
        }],
    };

    // Same name as TOGGLE, different relation.
    const IMPOSTER: TransitionTable = TransitionTable {
        name: "test-toggle",
        states: &["Off", "On"],
        events: &["Flip", "Timeout", "Noise"],
        initial: 1,
        fatal_unhandled: false,
        transitions: &[],
    };

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn registration_idempotent() -> anyhow::Result<()> {
        let mut registry = Registry::new();
        let a = registry.register(&TOGGLE)?;
        let b = registry.register(&TOGGLE)?;
        assert_eq!(a.name(), b.name());
        registry.register(&IMPOSTER).unwrap_err();
        assert!(registry.get("test-toggle").is_some());
        assert!(registry.get("missing").is_none());
        Ok(())
    }

    #[test]
    fn dispatch_and_actions() -> anyhow::Result<()> {
        let mut registry = Registry::new();
        let ty = registry.register(&TOGGLE)?;
        let mut engine = Engine::new(&test_log());
        let id =
            engine.create_instance(ty, "toggler", 8, Duration::from_secs(1));

        assert_eq!(engine.state(id)?, 0);
        let out = engine.dispatch(id, 0)?;
        assert!(out.handled);
        assert_eq!((out.from, out.to), (0, 1));
        assert_eq!(out.actions, vec![7]);
        assert_eq!(engine.state_name(id)?, "On");
        Ok(())
    }

    #[test]
    fn unhandled_recorded_and_ignored() -> anyhow::Result<()> {
        let mut registry = Registry::new();
        let ty = registry.register(&TOGGLE)?;
        let mut engine = Engine::new(&test_log());
        let id = engine.create_instance(ty, "t", 8, Duration::from_secs(1));

        let out = engine.dispatch(id, 2)?;
        assert!(!out.handled);
        assert_eq!(engine.state(id)?, 0);
        let history = engine.history(id)?;
        assert_eq!(history.len(), 1);
        assert!(!history[0].handled);
        Ok(())
    }

    #[test]
    fn unhandled_fatal_by_type() -> anyhow::Result<()> {
        let mut registry = Registry::new();
        let ty = registry.register(&STRICT)?;
        let mut engine = Engine::new(&test_log());
        let id = engine.create_instance(ty, "s", 8, Duration::from_secs(1));

        engine.dispatch(id, 2).unwrap_err();
        // The anomaly is still recorded before the error is raised.
        assert_eq!(engine.history(id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn history_bounded_fifo() -> anyhow::Result<()> {
        let mut registry = Registry::new();
        let ty = registry.register(&TOGGLE)?;
        let mut engine = Engine::new(&test_log());
        let capacity = 4;
        let id = engine.create_instance(
            ty,
            "h",
            capacity,
            Duration::from_secs(1),
        );

        // capacity + k insertions leave exactly the last `capacity`
        // records, in order.
        for _ in 0..capacity + 3 {
            engine.dispatch(id, 0)?;
        }
        let history = engine.history(id)?;
        assert_eq!(history.len(), capacity);
        // 7 flips alternate Off->On->Off...; the last 4 begin from On.
        assert_eq!((history[0].state, history[0].next), (1, 0));
        assert_eq!((history[3].state, history[3].next), (0, 1));
        Ok(())
    }

    #[test]
    fn timer_fires_once() -> anyhow::Result<()> {
        let mut registry = Registry::new();
        let ty = registry.register(&TOGGLE)?;
        let mut engine = Engine::new(&test_log());
        let id = engine.create_instance(ty, "t", 8, Duration::ZERO);

        engine.dispatch(id, 0)?;
        assert!(engine.timer_armed(id)?);
        let fired = engine.tick();
        assert_eq!(fired.len(), 1);
        assert_eq!(engine.state(id)?, 0);
        assert!(!engine.timer_armed(id)?);
        assert!(engine.tick().is_empty());
        Ok(())
    }

    #[test]
    fn arming_replaces_previous_timer() -> anyhow::Result<()> {
        let mut registry = Registry::new();
        let ty = registry.register(&TOGGLE)?;
        let mut engine = Engine::new(&test_log());
        let id = engine.create_instance(ty, "t", 8, Duration::ZERO);

        engine.arm_timer(id, 1, Duration::from_secs(3600))?;
        engine.arm_timer(id, 1, Duration::ZERO)?;
        // Only the second deadline exists; it has already expired.
        assert_eq!(engine.tick().len(), 1);
        Ok(())
    }

    #[test]
    fn destroy_releases() -> anyhow::Result<()> {
        let mut registry = Registry::new();
        let ty = registry.register(&TOGGLE)?;
        let mut engine = Engine::new(&test_log());
        let id = engine.create_instance(ty, "t", 8, Duration::ZERO);
        engine.destroy_instance(id)?;
        engine.state(id).unwrap_err();
        engine.destroy_instance(id).unwrap_err();
        Ok(())
    }
}
