//! Plan and billing cycle types

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ParseEnumError;

/// Unique plan identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    /// Create a new random plan ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a plan ID from a string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for PlanId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// How often a paid subscription is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }

    /// Number of months charged per cycle
    pub const fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Annual => 12,
        }
    }

    /// Next billing date one cycle after `from`.
    ///
    /// Month arithmetic clamps to the end of shorter months (Jan 31 -> Feb 28).
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from.checked_add_months(Months::new(self.months()))
            .unwrap_or_else(|| from + Duration::days(30 * i64::from(self.months())))
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Ok(Self::Monthly),
            "annual" | "yearly" | "year" => Ok(Self::Annual),
            _ => Err(ParseEnumError::new("billing cycle", s)),
        }
    }
}

/// A subscription plan.
///
/// Plans are reference data: once a subscription points at a plan, later edits
/// to pricing only apply to new subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    /// Monthly price in minor currency units
    pub monthly_price_cents: i64,
    /// Annual price in minor currency units
    pub annual_price_cents: i64,
    /// ISO 4217 code, e.g. `ARS`
    pub currency: String,
    /// Length of the trial granted on signup (0 = no trial)
    pub trial_days: u32,
    pub is_free: bool,
    pub is_popular: bool,
    pub features: Vec<String>,
}

impl Plan {
    /// Price charged per billing cycle, in minor units
    pub const fn price_for(&self, cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => self.monthly_price_cents,
            BillingCycle::Annual => self.annual_price_cents,
        }
    }

    pub const fn has_trial(&self) -> bool {
        self.trial_days > 0
    }

    /// Whether the plan includes a feature flag
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}
