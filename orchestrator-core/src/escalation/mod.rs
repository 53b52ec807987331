//! Friction signals derived from iteration and verifier history.
//!
//! `EscalationState` accumulates the per-issue iteration trace (error
//! categories seen, escalation events, tier budgets) that `FrictionDetector`
//! reads to surface higher-level patterns — oscillating error categories,
//! plateaued error counts, rapid repeated escalation — to the Issue Advisor.
//! The tier/budget fields on `EscalationState` bookkeep how an issue has
//! moved between worker tiers so those patterns can be computed; nothing in
//! this crate auto-routes work through tiers itself.

pub mod friction;
pub mod state;

pub use friction::{FrictionDetector, FrictionKind, FrictionSeverity, FrictionSignal};
pub use state::{EscalationReason, EscalationState, SwarmTier, TierBudget, TurnPolicy};
