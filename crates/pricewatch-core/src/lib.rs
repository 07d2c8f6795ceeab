//! Core domain model and price/text normalization for Pricewatch.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-core";

/// Base currency assumed when no symbol is present in scraped price text.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Lifecycle of a tracked competitor. Mutated only by discovery/sync/confirmation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetitorStatus {
    Pending,
    Processing,
    Active,
    Failed,
}

impl CompetitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompetitorStatus::Pending => "pending",
            CompetitorStatus::Processing => "processing",
            CompetitorStatus::Active => "active",
            CompetitorStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CompetitorStatus::Pending),
            "processing" => Some(CompetitorStatus::Processing),
            "active" => Some(CompetitorStatus::Active),
            "failed" => Some(CompetitorStatus::Failed),
            _ => None,
        }
    }
}

/// A seller-configured external store tracked for price comparison.
///
/// Aggregate root for its staging and candidate rows; deleting a competitor
/// cascades removal of everything scoped to `(store_id, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub id: Uuid,
    pub store_id: Uuid,
    pub root_url: String,
    pub domain: String,
    pub status: CompetitorStatus,
    pub failure_reason: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ephemeral scraped snapshot of one competitor listing. Unique per
/// `(competitor_id, url)`; may be wiped and rebuilt at any time and is never
/// a source of truth for anything durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingProduct {
    pub id: Uuid,
    pub competitor_id: Uuid,
    pub url: String,
    pub name: String,
    pub sku: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub last_checked_at: DateTime<Utc>,
}

/// One scraped listing as handed over by a scrape strategy, before validity
/// checks and staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub name: String,
    pub url: String,
    pub sku: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub external_id: Option<String>,
}

/// Read-only view of the seller's own catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellerProduct {
    pub id: Uuid,
    pub store_id: Uuid,
    pub name: String,
    pub sku: Option<String>,
    pub price: Option<f64>,
}

/// A proposed, unconfirmed pairing between a seller product and a competitor
/// listing. Cleared and rebuilt wholesale on every discovery run. Carries a
/// denormalized competitor snapshot so confirmation never re-reads staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub id: Uuid,
    pub store_id: Uuid,
    pub competitor_id: Uuid,
    pub competitor_item_id: Uuid,
    pub product_id: Uuid,
    pub score: i32,
    pub competitor_name: String,
    pub competitor_url: String,
    pub competitor_price: Option<f64>,
    pub currency: String,
    pub checked_at: DateTime<Utc>,
}

/// Durable accepted pairing, unique per `(store_id, competitor_id, product_id)`.
///
/// Self-contained by construction: it must stay valid and renderable after the
/// entire staging set for its competitor is wiped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedMatch {
    pub id: Uuid,
    pub store_id: Uuid,
    pub competitor_id: Uuid,
    pub product_id: Uuid,
    pub competitor_name: String,
    pub competitor_url: String,
    pub last_price: Option<f64>,
    pub currency: String,
    pub last_checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Monthly discovery-volume counter per `(store_id, period)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryQuota {
    pub store_id: Uuid,
    /// Calendar month key, `YYYY-MM`.
    pub period: String,
    pub limit: i64,
    pub used: i64,
}

impl DiscoveryQuota {
    pub fn remaining(&self) -> i64 {
        (self.limit - self.used).max(0)
    }
}

/// Key for the current calendar month, `YYYY-MM`.
pub fn month_period(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Key for the current calendar day.
pub fn day_period(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// Subscription tier parameters governing quota and sync cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub tier: String,
    pub monthly_discovery_limit: i64,
    pub syncs_per_day: i64,
}

impl Plan {
    /// Minimum elapsed time between successive sync runs for one competitor.
    /// `None` when the plan allows no syncs at all.
    pub fn cooldown(&self) -> Option<chrono::Duration> {
        if self.syncs_per_day <= 0 {
            return None;
        }
        // Divide in i64; the tier value may not fit an i32.
        Some(chrono::Duration::seconds(86_400 / self.syncs_per_day))
    }
}

/// Parsed price text: amount is `None` for unparseable input, which is
/// distinct from a genuine zero price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPrice {
    pub amount: Option<f64>,
    pub currency: String,
}

fn infer_currency(text: &str) -> &'static str {
    if text.contains('€') {
        "EUR"
    } else if text.contains('£') {
        "GBP"
    } else if text.contains('$') {
        "USD"
    } else {
        DEFAULT_CURRENCY
    }
}

/// Parse raw scraped price text into an amount and currency.
///
/// Separator disambiguation: when both `,` and `.` occur, whichever occurs
/// later in the string is the decimal point and the other is removed as
/// thousands grouping. A lone `,` is treated as the decimal point.
pub fn parse_price(text: &str) -> ParsedPrice {
    let currency = infer_currency(text).to_string();
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if cleaned.is_empty() {
        return ParsedPrice {
            amount: None,
            currency,
        };
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        (None, _) => cleaned,
    };

    ParsedPrice {
        amount: normalized.parse::<f64>().ok(),
        currency,
    }
}

static BARE_PRICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[$€£]?\s*-?\d[\d.,]*\s*$").expect("bare price pattern")
});

/// A scraped *name* that is just an optional currency symbol plus digits means
/// the scraper mapped a price cell into the name field; such items are
/// rejected outright instead of staged.
pub fn looks_like_price(name: &str) -> bool {
    BARE_PRICE.is_match(name)
}

/// Lowercase and collapse runs of non-alphanumerics to single spaces.
pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized word set used by the matching engine's token overlap score.
pub fn name_tokens(input: &str) -> BTreeSet<String> {
    normalize_name(input)
        .split_whitespace()
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_us_style_grouped_price() {
        let parsed = parse_price("$1,299.50");
        assert_eq!(parsed.amount, Some(1299.50));
        assert_eq!(parsed.currency, "USD");
    }

    #[test]
    fn parses_eu_style_decimal_comma() {
        let parsed = parse_price("€ 12,50");
        assert_eq!(parsed.amount, Some(12.50));
        assert_eq!(parsed.currency, "EUR");
    }

    #[test]
    fn eu_style_with_dot_grouping() {
        let parsed = parse_price("€1.299,50");
        assert_eq!(parsed.amount, Some(1299.50));
        assert_eq!(parsed.currency, "EUR");
    }

    #[test]
    fn empty_text_yields_none_not_zero() {
        let parsed = parse_price("");
        assert_eq!(parsed.amount, None);
        assert_eq!(parsed.currency, DEFAULT_CURRENCY);
    }

    #[test]
    fn unparseable_text_yields_none() {
        let parsed = parse_price("call for price");
        assert_eq!(parsed.amount, None);
    }

    #[test]
    fn pound_symbol_maps_to_gbp() {
        let parsed = parse_price("£19.99");
        assert_eq!(parsed.amount, Some(19.99));
        assert_eq!(parsed.currency, "GBP");
    }

    #[test]
    fn bare_price_names_are_flagged() {
        assert!(looks_like_price("$19.99"));
        assert!(looks_like_price(" 1,299.50 "));
        assert!(looks_like_price("€12"));
        assert!(!looks_like_price("Wireless Mouse"));
        assert!(!looks_like_price("Mouse 2000 DPI"));
    }

    #[test]
    fn name_normalization_collapses_punctuation() {
        assert_eq!(normalize_name("Wireless-Mouse  (Black)"), "wireless mouse black");
    }

    #[test]
    fn tokens_are_a_set() {
        let tokens = name_tokens("Mouse mouse MOUSE pad");
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains("mouse"));
        assert!(tokens.contains("pad"));
    }

    #[test]
    fn plan_cooldown_derives_from_daily_allowance() {
        let plan = Plan {
            tier: "starter".into(),
            monthly_discovery_limit: 500,
            syncs_per_day: 4,
        };
        assert_eq!(plan.cooldown(), Some(chrono::Duration::hours(6)));

        let none = Plan {
            tier: "free".into(),
            monthly_discovery_limit: 50,
            syncs_per_day: 0,
        };
        assert_eq!(none.cooldown(), None);

        // Allowances past i32 range must shrink the window, not wrap it.
        let oversized = Plan {
            tier: "unbounded".into(),
            monthly_discovery_limit: 500,
            syncs_per_day: (1_i64 << 32) + 4,
        };
        assert_eq!(oversized.cooldown(), Some(chrono::Duration::zero()));
    }

    #[test]
    fn quota_remaining_never_negative() {
        let quota = DiscoveryQuota {
            store_id: Uuid::new_v4(),
            period: "2026-08".into(),
            limit: 100,
            used: 130,
        };
        assert_eq!(quota.remaining(), 0);
    }
}
