//! Price catalogs.
//!
//! Two JSON layouts exist in the wild:
//!
//! - **Flat**: `{"flavors": {"<class>": {"hourly_price": .., "currency": ..}}}`.
//!   No discount rules; the legacy shutdown discount applies instead.
//! - **Structured**: `{"csps": {"<provider>": {...}}, "global_discount_rules": [..]}`,
//!   with per-provider instance types priced per currency and provider-scoped
//!   discount rules.
//!
//! The layout is detected once in [`PriceCatalog::from_json_str`]; lookups never
//! consult both.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discount::{DiscountRule, LegacyShutdownDiscount, RuleSets};

/// Currency reported for flat catalogs that have no entries.
pub const DEFAULT_CURRENCY: &str = "KRW";

/// Catalog loading errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The document is not valid JSON or does not match the detected layout.
    #[error("invalid price catalog: {0}")]
    Parse(#[from] serde_json::Error),
    /// Neither a non-empty `csps` table nor a `flavors` table was found.
    #[error("unrecognized price catalog layout: expected a `csps` or `flavors` table")]
    UnrecognizedSchema,
    /// The default provider is not set and cannot be inferred.
    #[error("price catalog has {count} providers but no `default_csp`")]
    AmbiguousDefaultProvider { count: usize },
    /// `default_csp` names a provider that is not in the catalog.
    #[error("default provider {provider} is not defined in the price catalog")]
    UnknownDefaultProvider { provider: String },
    /// Flat catalog entries disagree on currency.
    #[error("flat price catalog mixes currencies {first} and {second}")]
    MixedCurrency { first: String, second: String },
}

/// An hourly rate for one price class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub hourly: f64,
    pub currency: String,
}

/// A flat catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlavorPrice {
    #[serde(default)]
    pub flavor_id: String,
    pub hourly_price: f64,
    pub currency: String,
}

/// Flat mapping from price class to rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatCatalog {
    pub flavors: HashMap<String, FlavorPrice>,
}

/// Per-currency pricing of an instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub hourly: f64,
    #[serde(default)]
    pub monthly: f64,
    #[serde(default)]
    pub yearly: f64,
}

/// A named instance type offered by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub vcpu: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub pricing: HashMap<String, Pricing>,
}

/// A cloud provider section of a structured catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub default_currency: String,
    #[serde(default)]
    pub instance_types: HashMap<String, InstanceType>,
    #[serde(default)]
    pub discount_rules: Vec<DiscountRule>,
}

/// Multi-provider catalog with discount rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCatalog {
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "default_csp", skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(rename = "csps")]
    pub providers: HashMap<String, Provider>,
    #[serde(default)]
    pub global_discount_rules: Vec<DiscountRule>,
}

impl StructuredCatalog {
    /// The provider used for price lookups. Resolved at load time.
    fn provider(&self) -> Option<&Provider> {
        self.default_provider
            .as_deref()
            .and_then(|name| self.providers.get(name))
    }

    fn resolve_default_provider(&mut self) -> Result<(), CatalogError> {
        match self.default_provider.as_deref() {
            Some(name) if !name.is_empty() => {
                if !self.providers.contains_key(name) {
                    return Err(CatalogError::UnknownDefaultProvider {
                        provider: name.to_string(),
                    });
                }
            }
            _ => {
                let mut names = self.providers.keys();
                match (names.next(), names.next()) {
                    (Some(only), None) => self.default_provider = Some(only.clone()),
                    _ => {
                        return Err(CatalogError::AmbiguousDefaultProvider {
                            count: self.providers.len(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// A loaded price catalog in one of its two layouts.
#[derive(Debug, Clone, PartialEq)]
pub enum PriceCatalog {
    Flat {
        catalog: FlatCatalog,
        currency: String,
    },
    Structured(StructuredCatalog),
}

impl PriceCatalog {
    /// Parses a catalog document, detecting its layout once.
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let value: serde_json::Value = serde_json::from_str(json)?;

        let has_providers = value
            .get("csps")
            .and_then(serde_json::Value::as_object)
            .is_some_and(|providers| !providers.is_empty());
        if has_providers {
            let mut catalog: StructuredCatalog = serde_json::from_value(value)?;
            catalog.resolve_default_provider()?;
            tracing::debug!(
                providers = catalog.providers.len(),
                default_provider = ?catalog.default_provider,
                "loaded structured price catalog"
            );
            return Ok(Self::Structured(catalog));
        }

        if value.get("flavors").is_some_and(serde_json::Value::is_object) {
            let catalog: FlatCatalog = serde_json::from_value(value)?;
            let currency = flat_currency(&catalog)?;
            tracing::debug!(
                flavors = catalog.flavors.len(),
                %currency,
                "loaded flat price catalog"
            );
            return Ok(Self::Flat { catalog, currency });
        }

        Err(CatalogError::UnrecognizedSchema)
    }

    /// Hourly rate for a price class, if the catalog lists one.
    pub fn rate(&self, price_class: &str) -> Option<Rate> {
        match self {
            Self::Flat { catalog, .. } => catalog.flavors.get(price_class).map(|price| Rate {
                hourly: price.hourly_price,
                currency: price.currency.clone(),
            }),
            Self::Structured(catalog) => {
                let provider = catalog.provider()?;
                let instance_type = provider.instance_types.get(price_class)?;
                let pricing = instance_type.pricing.get(&provider.default_currency)?;
                Some(Rate {
                    hourly: pricing.hourly,
                    currency: provider.default_currency.clone(),
                })
            }
        }
    }

    /// Currency that summaries are reported in.
    pub fn currency(&self) -> &str {
        match self {
            Self::Flat { currency, .. } => currency,
            Self::Structured(catalog) => catalog
                .provider()
                .map_or(DEFAULT_CURRENCY, |provider| provider.default_currency.as_str()),
        }
    }

    /// Human-readable name of a price class.
    pub fn display_name<'a>(&'a self, price_class: &'a str) -> &'a str {
        match self {
            Self::Structured(catalog) => catalog
                .provider()
                .and_then(|provider| provider.instance_types.get(price_class))
                .map(|instance_type| instance_type.name.as_str())
                .filter(|name| !name.is_empty())
                .unwrap_or(price_class),
            Self::Flat { .. } => price_class,
        }
    }

    /// Discount rules to evaluate, in precedence order.
    ///
    /// Flat catalogs carry no rules and fall back to `legacy`.
    pub fn rule_sets<'a>(&'a self, legacy: &'a LegacyShutdownDiscount) -> RuleSets<'a> {
        match self {
            Self::Flat { .. } => RuleSets::Legacy(legacy),
            Self::Structured(catalog) => RuleSets::Structured {
                global: &catalog.global_discount_rules,
                provider: catalog
                    .provider()
                    .map(|provider| provider.discount_rules.as_slice())
                    .unwrap_or_default(),
            },
        }
    }

    /// Drops discount rules whose validity window does not contain `now`.
    pub fn retain_effective_rules(&mut self, now: DateTime<Utc>) {
        if let Self::Structured(catalog) = self {
            catalog
                .global_discount_rules
                .retain(|rule| rule.is_effective_at(now));
            for provider in catalog.providers.values_mut() {
                provider
                    .discount_rules
                    .retain(|rule| rule.is_effective_at(now));
            }
        }
    }
}

fn flat_currency(catalog: &FlatCatalog) -> Result<String, CatalogError> {
    let mut currencies = catalog.flavors.values().map(|price| price.currency.as_str());
    let Some(first) = currencies.next() else {
        return Ok(DEFAULT_CURRENCY.to_string());
    };
    if let Some(other) = currencies.find(|currency| *currency != first) {
        let (first, second) = if first <= other { (first, other) } else { (other, first) };
        return Err(CatalogError::MixedCurrency {
            first: first.to_string(),
            second: second.to_string(),
        });
    }
    Ok(first.to_string())
}
