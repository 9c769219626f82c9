//! Price/performance selection under a budget ceiling.
//!
//! Pure and deterministic: the same candidates and budget always produce the
//! same result, because every comparison ends in a total order on
//! (availability zone, instance type).
use gpustack_common::{Architecture, BudgetConstraint, DeployError, InstanceCandidate, SelectionResult};
use std::cmp::Ordering;

fn preference_rank(arch: Architecture, prefs: &[Architecture]) -> usize {
    prefs.iter().position(|a| *a == arch).unwrap_or(prefs.len())
}

/// Tie-break chain shared by both orderings: architecture preference, AZ, type.
fn tie_break(a: &InstanceCandidate, b: &InstanceCandidate, prefs: &[Architecture]) -> Ordering {
    preference_rank(a.architecture, prefs)
        .cmp(&preference_rank(b.architecture, prefs))
        .then_with(|| a.availability_zone.cmp(&b.availability_zone))
        .then_with(|| a.instance_type.cmp(&b.instance_type))
        .then_with(|| a.region.cmp(&b.region))
}

/// `Less` means `a` is the better pick: higher score, then lower price.
pub fn by_score(a: &InstanceCandidate, b: &InstanceCandidate, prefs: &[Architecture]) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then_with(|| a.hourly_price.total_cmp(&b.hourly_price))
        .then_with(|| tie_break(a, b, prefs))
}

/// `Less` means `a` is cheaper; equal prices fall back to [`by_score`].
pub fn by_price(a: &InstanceCandidate, b: &InstanceCandidate, prefs: &[Architecture]) -> Ordering {
    a.hourly_price
        .total_cmp(&b.hourly_price)
        .then_with(|| by_score(a, b, prefs))
}

fn best_within<'c>(
    candidates: &'c [InstanceCandidate],
    budget: &BudgetConstraint,
    prefs: &[Architecture],
) -> Option<&'c InstanceCandidate> {
    candidates
        .iter()
        .filter(|c| budget.admits(c.hourly_price))
        .min_by(|a, b| by_score(a, b, prefs))
}

pub fn select(
    candidates: &[InstanceCandidate],
    mut budget: BudgetConstraint,
    prefs: &[Architecture],
) -> Result<SelectionResult, DeployError> {
    let Some(cheapest) = candidates.iter().min_by(|a, b| by_price(a, b, prefs)) else {
        return Err(DeployError::NoCapacityAvailable(
            "no candidates with both a price and a machine image".to_string(),
        ));
    };
    let original_budget = budget.requested_max_price();

    let (chosen, budget_adjusted) = match best_within(candidates, &budget, prefs) {
        Some(c) => (c, false),
        None => {
            budget.relax_to(cheapest.hourly_price);
            tracing::info!(
                "💸 [selection] nothing within ${:.4}/h, ceiling relaxed to ${:.4}/h (cheapest {} @ ${:.4})",
                original_budget,
                budget.effective_max_price(),
                cheapest.instance_type,
                cheapest.hourly_price
            );
            (best_within(candidates, &budget, prefs).unwrap_or(cheapest), true)
        }
    };

    Ok(SelectionResult {
        chosen: chosen.clone(),
        budget_adjusted,
        original_budget,
        final_budget: budget.effective_max_price(),
        considered: candidates.len(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub candidate: InstanceCandidate,
    pub score: f64,
    pub within_budget: bool,
}

/// Every candidate, best first: within-budget ones by score, then the rest by price.
pub fn rank(
    candidates: &[InstanceCandidate],
    budget: &BudgetConstraint,
    prefs: &[Architecture],
) -> Vec<RankedCandidate> {
    let mut within: Vec<&InstanceCandidate> = Vec::new();
    let mut over: Vec<&InstanceCandidate> = Vec::new();
    for c in candidates {
        if budget.admits(c.hourly_price) {
            within.push(c);
        } else {
            over.push(c);
        }
    }
    within.sort_by(|a, b| by_score(a, b, prefs));
    over.sort_by(|a, b| by_price(a, b, prefs));

    within
        .into_iter()
        .map(|c| (c, true))
        .chain(over.into_iter().map(|c| (c, false)))
        .map(|(c, within_budget)| RankedCandidate {
            candidate: c.clone(),
            score: c.score(),
            within_budget,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpustack_common::Market;

    fn cand(t: &str, az: &str, arch: Architecture, price: f64, score: f64) -> InstanceCandidate {
        InstanceCandidate {
            instance_type: t.into(),
            architecture: arch,
            region: "us-east-1".into(),
            availability_zone: az.into(),
            hourly_price: price,
            performance_score: score,
            machine_image_id: "ami-1".into(),
            market: Market::Spot,
            on_demand_price: None,
        }
    }

    const PREFS: [Architecture; 2] = [Architecture::X86_64, Architecture::Arm64];

    #[test]
    fn score_is_performance_per_dollar() {
        let cs = vec![
            cand("typeA", "us-east-1a", Architecture::X86_64, 0.50, 70.0),
            cand("typeB", "us-east-1a", Architecture::X86_64, 0.90, 85.0),
        ];
        // 70/0.5 = 140 beats 85/0.9 = 94.4
        let r = select(&cs, BudgetConstraint::with_default_margin(2.0).unwrap(), &PREFS).unwrap();
        assert_eq!(r.chosen.instance_type, "typeA");
        assert!(!r.budget_adjusted);
        assert_eq!(r.considered, 2);
    }

    #[test]
    fn equal_scores_fall_to_price_then_architecture_then_zone() {
        // same score ratio, different price
        let cs = vec![
            cand("big", "us-east-1a", Architecture::X86_64, 1.00, 100.0),
            cand("small", "us-east-1a", Architecture::X86_64, 0.50, 50.0),
        ];
        let r = select(&cs, BudgetConstraint::with_default_margin(5.0).unwrap(), &PREFS).unwrap();
        assert_eq!(r.chosen.instance_type, "small");

        let cs = vec![
            cand("g5g.xlarge", "us-east-1a", Architecture::Arm64, 0.50, 50.0),
            cand("g4dn.xlarge", "us-east-1b", Architecture::X86_64, 0.50, 50.0),
        ];
        let r = select(&cs, BudgetConstraint::with_default_margin(5.0).unwrap(), &PREFS).unwrap();
        assert_eq!(r.chosen.architecture, Architecture::X86_64);
        let arm_first = [Architecture::Arm64, Architecture::X86_64];
        let r = select(&cs, BudgetConstraint::with_default_margin(5.0).unwrap(), &arm_first).unwrap();
        assert_eq!(r.chosen.architecture, Architecture::Arm64);

        let cs = vec![
            cand("g4dn.xlarge", "us-east-1c", Architecture::X86_64, 0.50, 50.0),
            cand("g4dn.xlarge", "us-east-1a", Architecture::X86_64, 0.50, 50.0),
        ];
        let r = select(&cs, BudgetConstraint::with_default_margin(5.0).unwrap(), &PREFS).unwrap();
        assert_eq!(r.chosen.availability_zone, "us-east-1a");
    }

    #[test]
    fn unlisted_architecture_ranks_last() {
        let cs = vec![
            cand("g5g.xlarge", "us-east-1a", Architecture::Arm64, 0.50, 50.0),
            cand("g4dn.xlarge", "us-east-1b", Architecture::X86_64, 0.50, 50.0),
        ];
        let r = select(
            &cs,
            BudgetConstraint::with_default_margin(5.0).unwrap(),
            &[Architecture::Arm64],
        )
        .unwrap();
        assert_eq!(r.chosen.architecture, Architecture::Arm64);
    }

    #[test]
    fn rank_orders_within_budget_first() {
        let cs = vec![
            cand("cheap", "us-east-1a", Architecture::X86_64, 0.30, 10.0),
            cand("pricey", "us-east-1a", Architecture::X86_64, 3.00, 300.0),
            cand("good", "us-east-1a", Architecture::X86_64, 0.60, 90.0),
            cand("pricier", "us-east-1a", Architecture::X86_64, 4.00, 900.0),
        ];
        let budget = BudgetConstraint::with_default_margin(1.0).unwrap();
        let ranked = rank(&cs, &budget, &PREFS);
        let order: Vec<&str> = ranked.iter().map(|r| r.candidate.instance_type.as_str()).collect();
        assert_eq!(order, vec!["good", "cheap", "pricey", "pricier"]);
        assert!(ranked[1].within_budget);
        assert!(!ranked[2].within_budget);
    }
}
