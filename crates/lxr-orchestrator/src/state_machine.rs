//! Pure state machine for the provisioning lifecycle
//!
//! This module has NO I/O. It decides, for every event, which state the run
//! is in and which side effects the controller must perform:
//! - Pure function: transition(state, event) -> (state, actions)
//! - Stages only move forward, one at a time
//! - Invalid transitions go to Failed (never panic)
//! - Cleanup is armed on reaching `Allocated` and disarmed on `Complete`

use lxr_core::LifecycleState;

/// Run state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// Last stage successfully reached
    Active(LifecycleState),
    /// Run aborted while trying to reach `stage`
    Failed { stage: LifecycleState, error: String },
}

/// Events reported by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The stage leading to this state completed
    StageSucceeded(LifecycleState),
    /// The stage currently being attempted failed
    StageFailed { error: String },
    /// Operator interrupt
    Interrupted,
}

/// Side effects the controller executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start guarding the freshly allocated sandbox
    ArmCleanup,
    /// Hand the sandbox over to the operator
    DisarmCleanup,
    /// Stop and destroy the partially built sandbox
    DestroySandbox,
    /// Log activity
    LogActivity { message: String },
}

/// Pure state transition function
///
/// Never panics: anything unexpected becomes `RunState::Failed`, and every
/// failure from a state that holds a live sandbox carries `DestroySandbox`.
pub fn transition(state: RunState, event: Event) -> (RunState, Vec<Action>) {
    match (state, event) {
        (RunState::Active(current), Event::StageSucceeded(reached))
            if current.next() == Some(reached) =>
        {
            let mut actions = vec![Action::LogActivity {
                message: format!("Reached {}", reached),
            }];
            if reached == LifecycleState::Allocated {
                actions.push(Action::ArmCleanup);
            }
            if reached == LifecycleState::Complete {
                actions.push(Action::DisarmCleanup);
            }
            (RunState::Active(reached), actions)
        }

        // Skipping, repeating or going backwards
        (RunState::Active(current), Event::StageSucceeded(reached)) => {
            let error = format!("Invalid stage transition: {} -> {}", current, reached);
            let mut actions = vec![Action::LogActivity {
                message: error.clone(),
            }];
            if current.requires_cleanup() {
                actions.push(Action::DestroySandbox);
            }
            (
                RunState::Failed {
                    stage: reached,
                    error,
                },
                actions,
            )
        }

        // A completed run is the operator's; nothing may tear it down
        (RunState::Active(LifecycleState::Complete), event) => (
            RunState::Failed {
                stage: LifecycleState::Complete,
                error: format!("Invalid event after completion: {:?}", event),
            },
            vec![],
        ),

        (RunState::Active(current), Event::StageFailed { error }) => fail(current, error),

        (RunState::Active(current), Event::Interrupted) => {
            fail(current, "Interrupted by operator".to_string())
        }

        // Failed is terminal
        (failed @ RunState::Failed { .. }, _) => (failed, vec![]),
    }
}

fn fail(current: LifecycleState, error: String) -> (RunState, Vec<Action>) {
    let stage = current.next().unwrap_or(current);
    let mut actions = vec![Action::LogActivity {
        message: format!("Stage {} failed: {}", stage, error),
    }];
    if current.requires_cleanup() {
        actions.push(Action::DestroySandbox);
    }
    (RunState::Failed { stage, error }, actions)
}
