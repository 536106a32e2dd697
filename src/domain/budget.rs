use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Budget (single-row aggregate attached to a trip)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetBreakdown {
    #[serde(default)]
    pub accommodation: f64,
    #[serde(default)]
    pub transportation: f64,
    #[serde(default)]
    pub food: f64,
    #[serde(default)]
    pub activities: f64,
    #[serde(default)]
    pub other: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("budget category {category} must not be negative (got {value})")]
pub struct NegativeCategory {
    pub category: &'static str,
    pub value: f64,
}

impl BudgetBreakdown {
    pub fn categories(&self) -> [(&'static str, f64); 5] {
        [
            ("accommodation", self.accommodation),
            ("transportation", self.transportation),
            ("food", self.food),
            ("activities", self.activities),
            ("other", self.other),
        ]
    }

    pub fn total(&self) -> f64 {
        self.categories().iter().map(|(_, v)| v).sum()
    }

    pub fn validate(&self) -> Result<(), NegativeCategory> {
        for (category, value) in self.categories() {
            if value < 0.0 || value.is_nan() {
                return Err(NegativeCategory { category, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub total_budget: f64,
    pub currency: String,
    #[serde(default)]
    pub breakdown: BudgetBreakdown,
    #[serde(default)]
    pub actual_spent: f64,
}

impl Budget {
    /// Sum of the per-category allocations.
    pub fn allocated(&self) -> f64 {
        self.breakdown.total()
    }

    /// `total_budget - allocated`. Negative when over-allocated; never clamped.
    pub fn remaining(&self) -> f64 {
        self.total_budget - self.allocated()
    }

    pub fn is_over_allocated(&self) -> bool {
        self.allocated() > self.total_budget
    }
}

/// Partial budget update. Breakdown, when present, replaces the stored one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<BudgetBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_spent: Option<f64>,
}

impl BudgetPatch {
    pub fn validate(&self) -> Result<(), NegativeCategory> {
        if let Some(breakdown) = &self.breakdown {
            breakdown.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(total: f64, breakdown: BudgetBreakdown) -> Budget {
        Budget {
            id: Uuid::new_v4(),
            trip_id: Uuid::new_v4(),
            total_budget: total,
            currency: "USD".into(),
            breakdown,
            actual_spent: 0.0,
        }
    }

    #[test]
    fn over_allocation_is_reported_not_clamped() {
        let b = budget(
            1000.0,
            BudgetBreakdown {
                accommodation: 800.0,
                food: 400.0,
                ..Default::default()
            },
        );
        assert_eq!(b.allocated(), 1200.0);
        assert_eq!(b.remaining(), -200.0);
        assert!(b.is_over_allocated());
    }

    #[test]
    fn under_allocation_leaves_positive_remainder() {
        let b = budget(
            2000.0,
            BudgetBreakdown {
                transportation: 300.0,
                ..Default::default()
            },
        );
        assert_eq!(b.remaining(), 1700.0);
        assert!(!b.is_over_allocated());
    }

    #[test]
    fn negative_category_fails_validation() {
        let patch = BudgetPatch {
            breakdown: Some(BudgetBreakdown {
                food: -5.0,
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = patch.validate().unwrap_err();
        assert_eq!(err.category, "food");
    }

    #[test]
    fn breakdown_deserializes_with_missing_categories() {
        let b: BudgetBreakdown = serde_json::from_value(serde_json::json!({"food": 12.5})).unwrap();
        assert_eq!(b.food, 12.5);
        assert_eq!(b.other, 0.0);
    }
}
