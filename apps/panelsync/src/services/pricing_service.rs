//! Purchase, renewal and add-on pricing.
//!
//! Everything here is pure: a [`PriceCatalog`] snapshot and a
//! [`DiscountProfile`] go in, a [`PriceQuote`] comes out. Prices are in minor
//! currency units.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use panelsync_db::models::catalog::{PeriodPrice, ServerGroupPrice, TrafficPackage};
use panelsync_db::models::promo::{PromoGroup, UserDiscountOverride};
use panelsync_db::models::subscription::Subscription;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PricingSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("no price configured for a {0}-day period")]
    UnknownPeriod(i32),
    #[error("{requested} devices requested, at most {max} allowed")]
    DeviceLimitExceeded { requested: i32, max: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscountCategory {
    Period,
    Traffic,
    Servers,
    Devices,
}

impl DiscountCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountCategory::Period => "period",
            DiscountCategory::Traffic => "traffic",
            DiscountCategory::Servers => "servers",
            DiscountCategory::Devices => "devices",
        }
    }
}

impl fmt::Display for DiscountCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscountCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "period" | "periods" => Ok(DiscountCategory::Period),
            "traffic" => Ok(DiscountCategory::Traffic),
            "servers" | "server" => Ok(DiscountCategory::Servers),
            "devices" | "device" => Ok(DiscountCategory::Devices),
            other => Err(format!("unknown discount category '{}'", other)),
        }
    }
}

/// Immutable price tables used for one or more calculations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceCatalog {
    pub period_prices: BTreeMap<i32, i64>,
    /// Enabled packages only.
    pub traffic_packages: Vec<TrafficPackage>,
    /// Monthly price per available server group.
    pub server_prices: HashMap<String, i64>,
    pub price_per_device: i64,
    /// Devices included in the base price.
    pub default_device_limit: i32,
    /// 0 means no upper bound.
    pub max_device_limit: i32,
}

impl PriceCatalog {
    pub fn from_parts(
        periods: Vec<PeriodPrice>,
        packages: Vec<TrafficPackage>,
        servers: Vec<ServerGroupPrice>,
        settings: &PricingSettings,
    ) -> Self {
        Self {
            period_prices: periods.into_iter().map(|p| (p.days, p.price)).collect(),
            traffic_packages: packages.into_iter().filter(|p| p.enabled).collect(),
            server_prices: servers
                .into_iter()
                .filter(|s| s.is_available)
                .map(|s| (s.uuid, s.price))
                .collect(),
            price_per_device: settings.price_per_device,
            default_device_limit: settings.default_device_limit,
            max_device_limit: settings.max_device_limit,
        }
    }

    pub fn traffic_price(&self, gb: i32) -> i64 {
        traffic_price(&self.traffic_packages, gb)
    }

    pub fn server_price(&self, uuid: &str) -> i64 {
        match self.server_prices.get(uuid) {
            Some(price) => *price,
            None => {
                debug!("Server group {} has no price, counting it as free", uuid);
                0
            }
        }
    }

    fn check_devices(&self, requested: i32) -> Result<(), PricingError> {
        if self.max_device_limit > 0 && requested > self.max_device_limit {
            return Err(PricingError::DeviceLimitExceeded {
                requested,
                max: self.max_device_limit,
            });
        }
        Ok(())
    }

    fn extra_devices_price(&self, devices: i32) -> i64 {
        i64::from((devices - self.default_device_limit).max(0)) * self.price_per_device
    }
}

/// Monthly price of a traffic package. `gb <= 0` asks for unlimited.
pub fn traffic_price(packages: &[TrafficPackage], gb: i32) -> i64 {
    let enabled = || packages.iter().filter(|p| p.enabled);
    if let Some(exact) = enabled().find(|p| p.gb == gb) {
        return exact.price;
    }

    let unlimited = enabled().find(|p| p.gb == 0).map(|p| p.price);
    if gb <= 0 {
        return unlimited.unwrap_or(0);
    }

    let mut finite: Vec<&TrafficPackage> = enabled().filter(|p| p.gb > 0).collect();
    finite.sort_by_key(|p| p.gb);
    if let Some(tier) = finite.iter().find(|p| p.gb >= gb) {
        return tier.price;
    }

    unlimited
        .or_else(|| finite.last().map(|p| p.price))
        .unwrap_or(0)
}

/// Parses `days:percent` pairs separated by commas. Broken pairs are skipped.
pub fn parse_period_discounts(raw: &str) -> BTreeMap<i32, i32> {
    let mut discounts: BTreeMap<i32, i32> = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parsed = pair
            .split_once(':')
            .and_then(|(days, percent)| {
                Some((days.trim().parse::<i32>().ok()?, percent.trim().parse::<i32>().ok()?))
            });
        match parsed {
            Some((days, percent)) => {
                discounts.insert(days, percent);
            }
            None => warn!("Ignoring malformed period discount '{}'", pair),
        }
    }
    discounts
}

/// Discounts a single user is entitled to.
///
/// Only the highest-priority group counts. A personal override for a
/// category replaces the group value for that category outright.
#[derive(Debug, Clone, Default)]
pub struct DiscountProfile {
    group: Option<PromoGroup>,
    overrides: HashMap<DiscountCategory, i32>,
    base_period_discounts: BTreeMap<i32, i32>,
}

impl DiscountProfile {
    pub fn new(
        groups: Vec<PromoGroup>,
        overrides: &[UserDiscountOverride],
        base_period_discounts: BTreeMap<i32, i32>,
    ) -> Self {
        let group = groups.into_iter().max_by_key(|g| (g.priority, g.id));
        let overrides = overrides
            .iter()
            .filter_map(|o| match o.category.parse::<DiscountCategory>() {
                Ok(category) => Some((category, o.percent)),
                Err(e) => {
                    warn!("Discount override of user {}: {}", o.user_id, e);
                    None
                }
            })
            .collect();
        Self {
            group,
            overrides,
            base_period_discounts,
        }
    }

    pub fn primary_group(&self) -> Option<&PromoGroup> {
        self.group.as_ref()
    }

    /// Percent for a fresh purchase or renewal, clamped to 0..=100.
    pub fn percent(&self, category: DiscountCategory, period_days: Option<i32>) -> i32 {
        if let Some(percent) = self.overrides.get(&category) {
            return (*percent).clamp(0, 100);
        }
        let Some(group) = &self.group else {
            return 0;
        };
        let percent = match category {
            DiscountCategory::Period => period_days
                .and_then(|days| {
                    group.period_discounts.get(&days).copied().or_else(|| {
                        group
                            .is_default
                            .then(|| self.base_period_discounts.get(&days).copied())
                            .flatten()
                    })
                })
                .unwrap_or(0),
            DiscountCategory::Traffic => group.traffic_discount_percent,
            DiscountCategory::Servers => group.server_discount_percent,
            DiscountCategory::Devices => group.device_discount_percent,
        };
        percent.clamp(0, 100)
    }

    /// Percent for add-on purchases; zero when the group opts out.
    pub fn addon_percent(&self, category: DiscountCategory, period_days: Option<i32>) -> i32 {
        match &self.group {
            Some(group) if !group.apply_discounts_to_addons => 0,
            _ => self.percent(category, period_days),
        }
    }
}

/// Amount taken off `price`: floor(price * percent / 100).
pub fn apply_discount(price: i64, percent: i32) -> i64 {
    let percent = i64::from(percent.clamp(0, 100));
    (price * percent).div_euclid(100)
}

fn months_for_days(days: i64) -> i32 {
    let months = (days.max(0) + 29) / 30;
    i32::try_from(months).unwrap_or(i32::MAX).max(1)
}

/// Whole months left until `end_date`, rounded up, at least 1.
pub fn remaining_months(end_date: DateTime<Utc>, now: DateTime<Utc>) -> i32 {
    months_for_days((end_date - now).num_days())
}

pub fn months_in_period(period_days: i32) -> i32 {
    months_for_days(i64::from(period_days))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteLine {
    pub category: DiscountCategory,
    pub label: String,
    /// Undiscounted amount for the whole quote.
    pub base: i64,
    pub percent: i32,
    pub discount: i64,
    pub total: i64,
}

impl QuoteLine {
    /// Monthly components are discounted per month, then multiplied.
    fn monthly(
        category: DiscountCategory,
        label: String,
        monthly_price: i64,
        percent: i32,
        months: i32,
    ) -> Self {
        let months = i64::from(months);
        let discount = apply_discount(monthly_price, percent);
        Self {
            category,
            label,
            base: monthly_price * months,
            percent,
            discount: discount * months,
            total: (monthly_price - discount) * months,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    pub months: i32,
    pub lines: Vec<QuoteLine>,
    pub total: i64,
}

impl PriceQuote {
    fn new(months: i32, lines: Vec<QuoteLine>) -> Self {
        let total = lines.iter().map(|l| l.total).sum();
        Self {
            months,
            lines,
            total,
        }
    }

    pub fn discount_total(&self) -> i64 {
        self.lines.iter().map(|l| l.discount).sum()
    }

    pub fn line(&self, category: DiscountCategory) -> Option<&QuoteLine> {
        self.lines.iter().find(|l| l.category == category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRequest {
    pub period_days: i32,
    /// 0 is unlimited.
    pub traffic_gb: i32,
    pub server_groups: Vec<String>,
    pub devices: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddonRequest {
    Traffic { gb: i32 },
    Servers { groups: Vec<String> },
    Devices { current: i32, additional: i32 },
}

fn period_lines(
    catalog: &PriceCatalog,
    profile: &DiscountProfile,
    request: &PurchaseRequest,
) -> Result<(i32, Vec<QuoteLine>), PricingError> {
    let days = request.period_days;
    let period_price = *catalog
        .period_prices
        .get(&days)
        .ok_or(PricingError::UnknownPeriod(days))?;
    let months = months_in_period(days);
    let percent = |category| profile.percent(category, Some(days));

    let mut lines = vec![QuoteLine::monthly(
        DiscountCategory::Period,
        format!("{} days", days),
        period_price,
        percent(DiscountCategory::Period),
        1,
    )];

    let traffic = catalog.traffic_price(request.traffic_gb);
    if traffic > 0 {
        let label = match request.traffic_gb {
            gb if gb > 0 => format!("{} GB traffic", gb),
            _ => "unlimited traffic".to_string(),
        };
        lines.push(QuoteLine::monthly(
            DiscountCategory::Traffic,
            label,
            traffic,
            percent(DiscountCategory::Traffic),
            months,
        ));
    }

    for uuid in &request.server_groups {
        let price = catalog.server_price(uuid);
        if price > 0 {
            lines.push(QuoteLine::monthly(
                DiscountCategory::Servers,
                format!("server group {}", uuid),
                price,
                percent(DiscountCategory::Servers),
                months,
            ));
        }
    }

    let devices = catalog.extra_devices_price(request.devices);
    if devices > 0 {
        lines.push(QuoteLine::monthly(
            DiscountCategory::Devices,
            format!("{} devices", request.devices),
            devices,
            percent(DiscountCategory::Devices),
            months,
        ));
    }

    Ok((months, lines))
}

/// Price of a new subscription. Never prorated.
pub fn quote_purchase(
    catalog: &PriceCatalog,
    profile: &DiscountProfile,
    request: &PurchaseRequest,
) -> Result<PriceQuote, PricingError> {
    catalog.check_devices(request.devices)?;
    let (months, lines) = period_lines(catalog, profile, request)?;
    Ok(PriceQuote::new(months, lines))
}

/// Price of extending `subscription` by `period_days` at current prices.
pub fn quote_renewal(
    catalog: &PriceCatalog,
    profile: &DiscountProfile,
    subscription: &Subscription,
    period_days: i32,
) -> Result<PriceQuote, PricingError> {
    let devices = match subscription.device_limit {
        limit if limit > 0 => limit,
        _ => catalog.default_device_limit,
    };
    let request = PurchaseRequest {
        period_days,
        traffic_gb: subscription.traffic_limit_gb,
        server_groups: subscription.server_groups.clone(),
        devices,
    };
    let (months, lines) = period_lines(catalog, profile, &request)?;
    Ok(PriceQuote::new(months, lines))
}

/// Price of an add-on for the rest of the current subscription.
pub fn quote_addon(
    catalog: &PriceCatalog,
    profile: &DiscountProfile,
    end_date: DateTime<Utc>,
    now: DateTime<Utc>,
    request: &AddonRequest,
) -> Result<PriceQuote, PricingError> {
    let months = remaining_months(end_date, now);
    let percent = |category| profile.addon_percent(category, None);

    let lines = match request {
        AddonRequest::Traffic { gb } => vec![QuoteLine::monthly(
            DiscountCategory::Traffic,
            format!("{} GB traffic", gb),
            catalog.traffic_price(*gb),
            percent(DiscountCategory::Traffic),
            months,
        )],
        AddonRequest::Servers { groups } => groups
            .iter()
            .map(|uuid| {
                QuoteLine::monthly(
                    DiscountCategory::Servers,
                    format!("server group {}", uuid),
                    catalog.server_price(uuid),
                    percent(DiscountCategory::Servers),
                    months,
                )
            })
            .collect(),
        AddonRequest::Devices {
            current,
            additional,
        } => {
            catalog.check_devices(current + additional)?;
            vec![QuoteLine::monthly(
                DiscountCategory::Devices,
                format!("{} extra devices", additional),
                i64::from((*additional).max(0)) * catalog.price_per_device,
                percent(DiscountCategory::Devices),
                months,
            )]
        }
    };

    Ok(PriceQuote::new(months, lines))
}
