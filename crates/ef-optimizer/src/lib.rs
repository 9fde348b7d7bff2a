//! # ef-optimizer
//!
//! Variational parameter search for Eigenflow.
//!
//! Provides the ask/tell search strategies (finite-difference gradient
//! descent, compass search, SPSA), the strategy selection policy, and the
//! run driver that spends an iteration budget against an objective.

mod run;
mod strategy;

pub use run::{IterationObserver, NoopObserver, Objective, OptimizationRun, RunError, RunState};
pub use strategy::{
    select_strategy, CompassSearch, DefaultStrategyFactory, GradientDescent, SearchStrategy,
    Spsa, StrategyFactory, StrategySettings,
};
