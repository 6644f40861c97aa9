//! Store product catalog
//!
//! Product ids are configured identically in both stores, so a single static
//! table maps them to the plan they unlock.

use plansync_shared::{BillingPeriod, PlanTier};

use crate::error::{BillingError, BillingResult};

/// A purchasable store product
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Product {
    pub id: &'static str,
    pub plan: PlanTier,
    pub billing_period: BillingPeriod,
}

pub const PRODUCTS: &[Product] = &[
    Product {
        id: "pro_monthly_subscription",
        plan: PlanTier::Pro,
        billing_period: BillingPeriod::Monthly,
    },
    Product {
        id: "pro_yearly_subscription",
        plan: PlanTier::Pro,
        billing_period: BillingPeriod::Yearly,
    },
    Product {
        id: "enterprise_monthly_subscription",
        plan: PlanTier::Enterprise,
        billing_period: BillingPeriod::Monthly,
    },
    Product {
        id: "enterprise_yearly_subscription",
        plan: PlanTier::Enterprise,
        billing_period: BillingPeriod::Yearly,
    },
];

/// Look up a product by exact id
pub fn lookup(product_id: &str) -> BillingResult<&'static Product> {
    PRODUCTS
        .iter()
        .find(|p| p.id == product_id)
        .ok_or_else(|| BillingError::InvalidProduct(product_id.to_string()))
}
