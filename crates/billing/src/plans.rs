//! Commercial plan catalog
//!
//! A closed enum over the plans sold at checkout. Each variant carries its
//! typed grant configuration; matches are exhaustive, so adding a plan
//! forces every call site to decide how to handle it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Duration;

/// Every plan the storefront sells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plan {
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "5-pack")]
    FivePack,
    #[serde(rename = "20-pack")]
    TwentyPack,
    #[serde(rename = "3-day-pass")]
    ThreeDayPass,
    #[serde(rename = "monthly")]
    Monthly,
}

/// What purchasing a plan grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanGrant {
    /// A metered batch of report credits
    Credits(i32),
    /// Unlimited reports for a fixed validity window
    Pass(Duration),
    /// Unlimited reports, renewed by the payment processor each period
    Subscription(Duration),
}

impl Plan {
    pub const ALL: [Plan; 5] = [
        Plan::Single,
        Plan::FivePack,
        Plan::TwentyPack,
        Plan::ThreeDayPass,
        Plan::Monthly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Single => "single",
            Plan::FivePack => "5-pack",
            Plan::TwentyPack => "20-pack",
            Plan::ThreeDayPass => "3-day-pass",
            Plan::Monthly => "monthly",
        }
    }

    pub fn grant(&self) -> PlanGrant {
        match self {
            Plan::Single => PlanGrant::Credits(1),
            Plan::FivePack => PlanGrant::Credits(5),
            Plan::TwentyPack => PlanGrant::Credits(20),
            Plan::ThreeDayPass => PlanGrant::Pass(Duration::hours(72)),
            Plan::Monthly => PlanGrant::Subscription(Duration::days(30)),
        }
    }

    /// Checkout mode: `monthly` is the only recurring plan
    pub fn is_subscription(&self) -> bool {
        matches!(self.grant(), PlanGrant::Subscription(_))
    }

    /// Credit count for credit plans, None otherwise
    pub fn credits(&self) -> Option<i32> {
        match self.grant() {
            PlanGrant::Credits(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Plan::Single),
            "5-pack" => Ok(Plan::FivePack),
            "20-pack" => Ok(Plan::TwentyPack),
            "3-day-pass" => Ok(Plan::ThreeDayPass),
            "monthly" => Ok(Plan::Monthly),
            other => Err(format!("unknown plan '{}'", other)),
        }
    }
}
