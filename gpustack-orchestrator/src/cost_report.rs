use gpustack_common::{InstanceCandidate, Market};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

const HOURS_PER_DAY: f64 = 24.0;
const DAYS_PER_MONTH: f64 = 30.0;
// savings above this are worth calling out to the operator
const RECOMMEND_ABOVE_PERCENT: f64 = 50.0;

/// Spot vs on-demand for one instance type, using its cheapest zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavingsLine {
    pub instance_type: String,
    pub availability_zone: String,
    pub region: String,
    pub spot_price: f64,
    pub on_demand_price: f64,
    pub hourly_savings: f64,
    pub daily_savings: f64,
    pub monthly_savings: f64,
    pub savings_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct CostReport {
    pub lines: Vec<SavingsLine>,
    /// Highest savings percent among types whose spot price fits the ceiling.
    pub best_option: Option<String>,
    pub recommendations: Vec<String>,
}

impl CostReport {
    pub fn build(candidates: &[InstanceCandidate], max_price: f64) -> Self {
        let mut cheapest: BTreeMap<&str, &InstanceCandidate> = BTreeMap::new();
        for c in candidates.iter().filter(|c| c.market == Market::Spot) {
            match cheapest.get(c.instance_type.as_str()) {
                Some(kept) if kept.hourly_price <= c.hourly_price => {}
                _ => {
                    cheapest.insert(&c.instance_type, c);
                }
            }
        }

        let lines: Vec<SavingsLine> = cheapest
            .values()
            .filter_map(|c| {
                let on_demand = c.on_demand_price.filter(|p| *p > 0.0)?;
                let hourly = on_demand - c.hourly_price;
                Some(SavingsLine {
                    instance_type: c.instance_type.clone(),
                    availability_zone: c.availability_zone.clone(),
                    region: c.region.clone(),
                    spot_price: c.hourly_price,
                    on_demand_price: on_demand,
                    hourly_savings: hourly,
                    daily_savings: hourly * HOURS_PER_DAY,
                    monthly_savings: hourly * HOURS_PER_DAY * DAYS_PER_MONTH,
                    savings_percent: hourly / on_demand * 100.0,
                })
            })
            .collect();

        let best_option = lines
            .iter()
            .filter(|l| l.spot_price <= max_price && l.savings_percent > 0.0)
            .max_by(|a, b| a.savings_percent.total_cmp(&b.savings_percent))
            .map(|l| l.instance_type.clone());

        let mut recommendations = Vec::new();
        if let Some(l) = lines
            .iter()
            .min_by(|a, b| a.spot_price.total_cmp(&b.spot_price))
        {
            if l.savings_percent > RECOMMEND_ABOVE_PERCENT {
                recommendations.push(format!(
                    "Consider {} for {:.1}% cost savings",
                    l.instance_type, l.savings_percent
                ));
            }
        }

        Self {
            lines,
            best_option,
            recommendations,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.lines.is_empty() {
            out.push_str("no spot/on-demand pairs to compare\n");
            return out;
        }
        for l in &self.lines {
            let _ = writeln!(
                out,
                "{:<14} ${:.3}/hr spot ({}) vs ${:.2}/hr on-demand: {:.1}% savings, ${:.2}/day, ${:.2}/month",
                l.instance_type,
                l.spot_price,
                l.availability_zone,
                l.on_demand_price,
                l.savings_percent,
                l.daily_savings,
                l.monthly_savings
            );
        }
        if let Some(best) = &self.best_option {
            let _ = writeln!(out, "best spot option: {}", best);
        }
        for r in &self.recommendations {
            let _ = writeln!(out, "recommendation: {}", r);
        }
        out
    }
}
