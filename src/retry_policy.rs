// =============================================================================
// Retry Policy — broker cancel reason -> retry eligibility
// =============================================================================
//
// Cancel reasons are free text from the broker. Classification is a table
// lookup (first matching keyword wins, case-insensitive) so new reasons can
// be added without touching the tracker's state machine. Hard rejections
// are listed first so that e.g. "order rejected: insufficient margin" is not
// retried just because it also contains "rejected".
// =============================================================================

use serde::Serialize;

/// One row of the classification table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryRule {
    pub keyword: String,
    pub category: String,
    pub retryable: bool,
}

impl RetryRule {
    pub fn new(keyword: &str, category: &str, retryable: bool) -> Self {
        Self {
            keyword: keyword.to_uppercase(),
            category: category.to_string(),
            retryable,
        }
    }
}

/// Outcome of classifying one cancel reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryDecision {
    pub retryable: bool,
    /// Matched rule category, `None` when no keyword matched.
    pub category: Option<String>,
}

const DEFAULT_RULES: &[(&str, &str, bool)] = &[
    // Hard failures: never retried.
    ("INSUFFICIENT MARGIN", "insufficient_margin", false),
    ("MARKET CLOSED", "market_closed", false),
    ("INVALID CONTRACT", "invalid_contract", false),
    ("POSITION NOT FOUND", "position_not_found", false),
    // Fill-or-kill expiry.
    ("FOK", "fok", true),
    ("FILL OR KILL", "fok", true),
    // Could not fill at the limit.
    ("UNABLE TO FILL", "unable_to_fill", true),
    ("CANNOT BE FILLED", "unable_to_fill", true),
    ("NO LIQUIDITY", "unable_to_fill", true),
    // Limit too far from the market.
    ("PRICE DEVIATION", "price_deviation", true),
    ("PRICE OUT OF RANGE", "price_deviation", true),
    ("PRICE LIMIT", "price_deviation", true),
    // Broker-side rejection.
    ("REJECT", "order_rejected", true),
    // Time-outs.
    ("TIMEOUT", "timeout", true),
    ("TIMED OUT", "timeout", true),
    // Generic cancel.
    ("CANCEL", "cancelled", true),
];

/// Keyword table deciding which cancels are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    rules: Vec<RetryRule>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES
                .iter()
                .map(|(kw, cat, retry)| RetryRule::new(kw, cat, *retry))
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn from_rules(rules: Vec<RetryRule>) -> Self {
        Self { rules }
    }

    /// Insert a rule ahead of the existing ones.
    pub fn with_rule(mut self, rule: RetryRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn rules(&self) -> &[RetryRule] {
        &self.rules
    }

    /// Classify a cancel reason. Unknown reasons are not retried.
    pub fn classify(&self, reason: &str) -> RetryDecision {
        let upper = reason.to_uppercase();
        self.rules
            .iter()
            .find(|rule| upper.contains(&rule.keyword))
            .map(|rule| RetryDecision {
                retryable: rule.retryable,
                category: Some(rule.category.clone()),
            })
            .unwrap_or(RetryDecision {
                retryable: false,
                category: None,
            })
    }
}
