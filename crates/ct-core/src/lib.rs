//! Core domain logic for compute cost tracking.
//!
//! This crate contains the fundamental types and logic for:
//! - State: resource snapshots with a bounded change history
//! - Intervals: reconstructing running/shutdown time from sparse history
//! - Catalog: flat and provider-structured price catalogs
//! - Discounts: declarative, additively stacked discount rules
//! - Cost: per-resource line items and period summaries

pub mod catalog;
pub mod cost;
pub mod discount;
pub mod interval;
pub mod period;
pub mod state;
pub mod types;

pub use catalog::{CatalogError, PriceCatalog, Rate};
pub use cost::{AppliedDiscount, CostCalculator, CostError, CostLineItem, CostSummary};
pub use discount::{
    AgeGate, Condition, ConditionKind, DiscountRule, LegacyShutdownDiscount, Operator,
};
pub use interval::{
    GapFill, NoGapFill, OppositeOfCurrent, Window, hours_matching, state_intervals,
};
pub use period::{AsOf, Period};
pub use state::{FleetStats, Observation, ResourceState, RunState, StateChangeRecord};
pub use types::{PriceClassId, ResourceId, ValidationError};
