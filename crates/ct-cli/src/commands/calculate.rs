//! Calculate command for cost reports.
//!
//! This module implements `costctl calculate` for the daily, monthly and
//! month-to-date periods, with human-readable and JSON output.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone, Utc};
use ct_core::{AsOf, CostCalculator, CostSummary, Period, PriceCatalog};
use ct_db::Database;
use serde::Serialize;

use crate::Config;

/// Computed report data.
#[derive(Debug)]
pub struct CostReport {
    pub generated_at: DateTime<Utc>,
    pub period: Period,
    pub timezone: String,
    pub summary: CostSummary,
    /// Catalog display name per price class in the summary.
    pub class_names: HashMap<String, String>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: String,
    timezone: &'a str,
    period_type: Period,
    #[serde(flatten)]
    summary: &'a CostSummary,
}

/// Loads a price catalog and drops rules that are not in effect at `now`.
pub fn load_catalog(path: &Path, now: DateTime<Utc>) -> Result<PriceCatalog> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read price catalog {}", path.display()))?;
    let mut catalog = PriceCatalog::from_json_str(&json)
        .with_context(|| format!("invalid price catalog {}", path.display()))?;
    catalog.retain_effective_rules(now);
    Ok(catalog)
}

/// Calculates costs for `period` against the stored snapshot.
pub fn generate_report(
    db: &mut Database,
    config: &Config,
    period: Period,
    as_of: &AsOf,
    timezone: String,
) -> Result<CostReport> {
    let catalog = load_catalog(&config.catalog_path, as_of.now)?;
    let resources = db.load_snapshot().context("failed to load resource snapshot")?;

    let summary = CostCalculator::new(&catalog)
        .with_legacy_discount(config.legacy_discount.clone())
        .calculate_period(&resources, period, as_of)?;

    let class_names = summary
        .line_items
        .iter()
        .map(|item| {
            let class = item.price_class.as_str();
            (class.to_string(), catalog.display_name(class).to_string())
        })
        .collect();

    Ok(CostReport {
        generated_at: as_of.now,
        period,
        timezone,
        summary,
        class_names,
    })
}

const fn period_description(period: Period) -> &'static str {
    match period {
        Period::Daily => "Today",
        Period::Monthly => "This month",
        Period::Current => "Month to date",
    }
}

/// Formats the human-readable report, rendering times in `tz`.
pub fn format_report<Tz>(report: &CostReport, tz: &Tz) -> Result<String, fmt::Error>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let summary = &report.summary;
    let mut output = String::new();

    writeln!(output, "COST REPORT: {}", period_description(report.period))?;
    writeln!(
        output,
        "Period: {} to {} ({})",
        summary.period.start.with_timezone(tz).format("%Y-%m-%d %H:%M"),
        summary.period.end.with_timezone(tz).format("%Y-%m-%d %H:%M"),
        report.timezone
    )?;

    if summary.line_items.is_empty() {
        writeln!(output)?;
        writeln!(output, "No resources tracked.")?;
        writeln!(output)?;
        writeln!(
            output,
            "Hint: Run 'costctl observe' or 'costctl import' to add resources."
        )?;
        return Ok(output);
    }

    writeln!(output)?;
    writeln!(output, "RESOURCES")?;
    writeln!(output, "─────────")?;
    for item in &summary.line_items {
        let class = item.price_class.as_str();
        let class_name = report.class_names.get(class).map_or(class, String::as_str);
        writeln!(output, "  {} [{class_name}]", item.resource_name)?;
        writeln!(
            output,
            "    Running:   {:.2}h at {:.2}/h",
            item.total_running_hours, item.base_hourly_rate
        )?;
        writeln!(output, "    Base:      {:.2}", item.base_cost)?;
        for discount in &item.applied_discounts {
            writeln!(
                output,
                "    Discount:  -{:.2}  {} ({}%)",
                discount.discount_amount, discount.rule_name, discount.discount_percent
            )?;
        }
        writeln!(output, "    Final:     {:.2}", item.final_cost)?;
    }

    let currency = &summary.currency;
    writeln!(output)?;
    writeln!(output, "SUMMARY")?;
    writeln!(output, "───────")?;
    writeln!(output, "Resources:   {}", summary.total_resources)?;
    writeln!(output, "Base cost:   {:.2} {currency}", summary.total_base_cost)?;
    writeln!(output, "Discounts:   -{:.2} {currency}", summary.total_discount)?;
    writeln!(output, "Final cost:  {:.2} {currency}", summary.total_final_cost)?;

    Ok(output)
}

/// Formats report data as JSON.
pub fn format_report_json(report: &CostReport) -> Result<String> {
    let json = JsonReport {
        generated_at: report.generated_at.to_rfc3339(),
        timezone: &report.timezone,
        period_type: report.period,
        summary: &report.summary,
    };
    Ok(serde_json::to_string_pretty(&json)?)
}

/// Runs the calculate command.
pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    config: &Config,
    period: Period,
    json: bool,
) -> Result<()> {
    let as_of = AsOf::local_now();
    let timezone = iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string());
    let report = generate_report(db, config, period, &as_of, timezone)?;

    if json {
        writeln!(writer, "{}", format_report_json(&report)?)?;
    } else {
        write!(writer, "{}", format_report(&report, &Local)?)?;
    }
    Ok(())
}
