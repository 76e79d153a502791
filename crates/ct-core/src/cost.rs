//! Cost aggregation across a snapshot of resources.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::catalog::PriceCatalog;
use crate::discount::{LegacyShutdownDiscount, RuleContext, apply_discounts};
use crate::interval::{GapFill, OppositeOfCurrent, Window, hours_matching};
use crate::period::{AsOf, Period};
use crate::state::{ResourceState, RunState};
use crate::types::{PriceClassId, ResourceId};

/// Cost calculation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CostError {
    /// A resource's price class is not in the catalog.
    #[error("no price for resource {resource_id}: price class {price_class} is not in the catalog")]
    MissingPrice {
        resource_id: ResourceId,
        price_class: PriceClassId,
    },
}

/// One discount applied to a line item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedDiscount {
    pub rule_name: String,
    pub discount_percent: f64,
    pub discount_amount: f64,
}

/// Cost of a single resource over the calculation window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostLineItem {
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub price_class: PriceClassId,
    pub base_hourly_rate: f64,
    pub total_running_hours: f64,
    pub base_cost: f64,
    pub applied_discounts: Vec<AppliedDiscount>,
    pub total_discount: f64,
    /// `base_cost - total_discount`; negative when discounts exceed 100%.
    pub final_cost: f64,
}

impl CostLineItem {
    /// Creates an undiscounted line item.
    pub fn new(resource: &ResourceState, hourly_rate: f64, running_hours: f64) -> Self {
        let base_cost = hourly_rate * running_hours;
        Self {
            resource_id: resource.id.clone(),
            resource_name: resource.name.clone(),
            price_class: resource.price_class.clone(),
            base_hourly_rate: hourly_rate,
            total_running_hours: running_hours,
            base_cost,
            applied_discounts: Vec::new(),
            total_discount: 0.0,
            final_cost: base_cost,
        }
    }

    /// Records a percentage discount off the base cost.
    pub fn add_discount(&mut self, rule_name: &str, percent: f64) {
        let amount = self.base_cost * (percent / 100.0);
        self.applied_discounts.push(AppliedDiscount {
            rule_name: rule_name.to_string(),
            discount_percent: percent,
            discount_amount: amount,
        });
        self.total_discount += amount;
        self.final_cost = self.base_cost - self.total_discount;
    }
}

/// Aggregate cost over a set of resources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub period: Window,
    pub total_resources: usize,
    pub total_base_cost: f64,
    pub total_discount: f64,
    pub total_final_cost: f64,
    pub currency: String,
    /// Ordered by creation time, then resource ID.
    pub line_items: Vec<CostLineItem>,
}

/// Computes costs from a price catalog.
pub struct CostCalculator<'a> {
    catalog: &'a PriceCatalog,
    legacy: LegacyShutdownDiscount,
    gap_fill: Box<dyn GapFill>,
}

impl<'a> CostCalculator<'a> {
    pub fn new(catalog: &'a PriceCatalog) -> Self {
        Self {
            catalog,
            legacy: LegacyShutdownDiscount::default(),
            gap_fill: Box::new(OppositeOfCurrent),
        }
    }

    /// Sets the discount used when the catalog carries no rules.
    #[must_use]
    pub fn with_legacy_discount(mut self, legacy: LegacyShutdownDiscount) -> Self {
        self.legacy = legacy;
        self
    }

    /// Replaces the pre-history gap-fill strategy.
    #[must_use]
    pub fn with_gap_fill(mut self, gap_fill: impl GapFill + 'static) -> Self {
        self.gap_fill = Box::new(gap_fill);
        self
    }

    /// Calculates costs for `window`.
    ///
    /// Fails as a whole if any resource has no price in the catalog.
    pub fn calculate(
        &self,
        resources: &HashMap<ResourceId, ResourceState>,
        window: Window,
        as_of: &AsOf,
    ) -> Result<CostSummary, CostError> {
        let mut ordered: Vec<&ResourceState> = resources.values().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut summary = CostSummary {
            period: window,
            total_resources: ordered.len(),
            total_base_cost: 0.0,
            total_discount: 0.0,
            total_final_cost: 0.0,
            currency: self.catalog.currency().to_string(),
            line_items: Vec::with_capacity(ordered.len()),
        };

        for resource in ordered {
            let item = self.line_item(resource, window, as_of)?;
            summary.total_base_cost += item.base_cost;
            summary.total_discount += item.total_discount;
            summary.total_final_cost += item.final_cost;
            summary.line_items.push(item);
        }

        tracing::debug!(
            resources = summary.total_resources,
            base_cost = summary.total_base_cost,
            final_cost = summary.total_final_cost,
            "calculated cost summary"
        );
        Ok(summary)
    }

    /// Calculates costs for a named period.
    pub fn calculate_period(
        &self,
        resources: &HashMap<ResourceId, ResourceState>,
        period: Period,
        as_of: &AsOf,
    ) -> Result<CostSummary, CostError> {
        self.calculate(resources, period.window(as_of), as_of)
    }

    /// Today's estimate.
    pub fn daily(
        &self,
        resources: &HashMap<ResourceId, ResourceState>,
        as_of: &AsOf,
    ) -> Result<CostSummary, CostError> {
        self.calculate_period(resources, Period::Daily, as_of)
    }

    /// Estimate for the whole current month.
    pub fn monthly(
        &self,
        resources: &HashMap<ResourceId, ResourceState>,
        as_of: &AsOf,
    ) -> Result<CostSummary, CostError> {
        self.calculate_period(resources, Period::Monthly, as_of)
    }

    /// Month-to-date cost.
    pub fn current(
        &self,
        resources: &HashMap<ResourceId, ResourceState>,
        as_of: &AsOf,
    ) -> Result<CostSummary, CostError> {
        self.calculate_period(resources, Period::Current, as_of)
    }

    fn line_item(
        &self,
        resource: &ResourceState,
        window: Window,
        as_of: &AsOf,
    ) -> Result<CostLineItem, CostError> {
        let rate = self
            .catalog
            .rate(resource.price_class.as_str())
            .ok_or_else(|| CostError::MissingPrice {
                resource_id: resource.id.clone(),
                price_class: resource.price_class.clone(),
            })?;

        let running_hours =
            hours_matching(resource, RunState::Running, window, self.gap_fill.as_ref());
        let mut item = CostLineItem::new(resource, rate.hourly, running_hours);

        let ctx = RuleContext {
            resource,
            running_hours,
            as_of,
            gap_fill: self.gap_fill.as_ref(),
        };
        apply_discounts(&mut item, &ctx, self.catalog.rule_sets(&self.legacy));

        tracing::debug!(
            resource_id = %resource.id,
            price_class = %resource.price_class,
            running_hours,
            base_cost = item.base_cost,
            discount = item.total_discount,
            "calculated line item"
        );
        Ok(item)
    }
}
