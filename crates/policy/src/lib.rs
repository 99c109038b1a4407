//! Capability policy primitives.
//!
//! Core principle: **every side effect is backed by an explicit capability,
//! and a delegated capability can only ever be narrower than its parent.**
//!
//! This crate holds the pieces shared by record-based capabilities and
//! portable tokens:
//!
//! - [`ResourceType`] and [`Operation`] name what is being accessed
//! - [`ResourcePattern`] matches concrete resources with anchored globs
//! - [`ConstraintSet`] carries typed restrictions and knows how to narrow them
//! - [`Policy`] decides which capabilities may be issued at all
//! - [`RateLimiter`] enforces rate-limit constraints at use time

mod constraint;
mod error;
mod pattern;
mod policy;
mod rate;
mod resource;

pub use constraint::{ConstraintKind, ConstraintSet, Denial, RateLimit, TimeWindow, Widening};
pub use error::{Error, Result};
pub use pattern::ResourcePattern;
pub use policy::{Decision, DenyRules, Policy, PolicyViolation, ResourceRule};
pub use rate::RateLimiter;
pub use resource::{Operation, ResourceType};
