//! Rule Evaluator (C8). Pure, side-effect-free: given a rule and a market
//! sample, decide trigger/skip and explain why. Grounded on
//! `trade/router.rs`'s ordered, first-match decision style.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::domain::{Decision, Rule, RuleCondition, RuleStatus, Sample, STALENESS_MAX_SECS};

/// Evaluate one rule against one sample. Decision rules are applied in order;
/// the first match wins.
pub fn evaluate(rule: &Rule, sample: &Sample, now: DateTime<Utc>) -> Decision {
    if rule.status != RuleStatus::Active {
        return Decision::skip("not active");
    }

    if (now - sample.observed_at).num_seconds() >= STALENESS_MAX_SECS {
        return Decision::skip("stale market data");
    }

    if !(0.0..=1.0).contains(&sample.probability) {
        return Decision::skip("invalid probability");
    }

    if let Some(last) = rule.last_triggered_at
        && now - last < rule.cooldown()
    {
        return Decision::skip("in cooldown");
    }

    let triggers = match rule.condition {
        RuleCondition::Above => sample.probability > rule.threshold,
        RuleCondition::Below => sample.probability < rule.threshold,
    };

    if triggers {
        Decision::trigger("condition met")
    } else {
        Decision::skip("condition not met")
    }
}

/// Evaluate every rule against its matching sample, keyed by market id. Rules
/// with no sample for their market are skipped silently (no decision emitted) —
/// the poller only has fresh data for markets it successfully fetched this tick.
pub fn batch_evaluate(
    rules: &[Rule],
    samples_by_market: &HashMap<String, Sample>,
    now: DateTime<Utc>,
) -> Vec<(Rule, Decision)> {
    rules
        .iter()
        .filter_map(|rule| {
            let sample = samples_by_market.get(&rule.market_id)?;
            Some((rule.clone(), evaluate(rule, sample, now)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RuleAction, RuleCondition, RuleStatus};

    fn base_rule() -> Rule {
        Rule {
            id: "r1".into(),
            user_id: "u1".into(),
            wallet_id: "w1".into(),
            name: "Exit on 70%".into(),
            market_id: "m1".into(),
            condition: RuleCondition::Above,
            threshold: 0.65,
            action: RuleAction::ToStable,
            swap_fraction_pct: 80,
            cooldown_hours: 24,
            status: RuleStatus::Active,
            last_triggered_at: None,
        }
    }

    fn sample_at(prob: f64, observed_at: DateTime<Utc>) -> Sample {
        Sample {
            market_id: "m1".into(),
            probability: prob,
            last_price: prob,
            volume: 1_000.0,
            open_interest: 1_000.0,
            observed_at,
        }
    }

    #[test]
    fn happy_path_above_triggers() {
        let now = Utc::now();
        let decision = evaluate(&base_rule(), &sample_at(0.75, now), now);
        assert!(decision.trigger);
    }

    #[test]
    fn equality_never_triggers() {
        let now = Utc::now();
        let decision = evaluate(&base_rule(), &sample_at(0.65, now), now);
        assert!(!decision.trigger);
        assert_eq!(decision.reason, "condition not met");
    }

    #[test]
    fn below_condition_triggers_on_lower_probability() {
        let now = Utc::now();
        let mut rule = base_rule();
        rule.condition = RuleCondition::Below;
        rule.threshold = 0.3;
        let decision = evaluate(&rule, &sample_at(0.2, now), now);
        assert!(decision.trigger);
    }

    #[test]
    fn non_active_rule_skips() {
        let now = Utc::now();
        let mut rule = base_rule();
        rule.status = RuleStatus::Paused;
        let decision = evaluate(&rule, &sample_at(0.9, now), now);
        assert!(!decision.trigger);
        assert_eq!(decision.reason, "not active");
    }

    #[test]
    fn stale_sample_skips_at_exact_boundary() {
        let now = Utc::now();
        let observed = now - chrono::Duration::seconds(STALENESS_MAX_SECS);
        let decision = evaluate(&base_rule(), &sample_at(0.9, observed), now);
        assert_eq!(decision.reason, "stale market data");
    }

    #[test]
    fn sample_just_under_staleness_boundary_is_fresh() {
        let now = Utc::now();
        let observed = now - chrono::Duration::seconds(STALENESS_MAX_SECS - 1);
        let decision = evaluate(&base_rule(), &sample_at(0.9, observed), now);
        assert!(decision.trigger);
    }

    #[test]
    fn invalid_probability_skips() {
        let now = Utc::now();
        let decision = evaluate(&base_rule(), &sample_at(1.5, now), now);
        assert_eq!(decision.reason, "invalid probability");
    }

    #[test]
    fn probability_boundaries_zero_and_one_are_valid() {
        let now = Utc::now();
        let mut rule = base_rule();
        rule.condition = RuleCondition::Below;
        rule.threshold = 0.5;
        assert!(evaluate(&rule, &sample_at(0.0, now), now).trigger);

        let mut rule_above = base_rule();
        rule_above.threshold = 0.5;
        assert!(evaluate(&rule_above, &sample_at(1.0, now), now).trigger);
    }

    #[test]
    fn cooldown_blocks_until_boundary_elapses() {
        let now = Utc::now();
        let mut rule = base_rule();
        rule.last_triggered_at = Some(now - chrono::Duration::hours(2));
        let decision = evaluate(&rule, &sample_at(0.9, now), now);
        assert_eq!(decision.reason, "in cooldown");

        rule.last_triggered_at = Some(now - chrono::Duration::hours(24));
        let decision = evaluate(&rule, &sample_at(0.9, now), now);
        assert!(decision.trigger);
    }

    #[test]
    fn determinism_same_inputs_same_decision() {
        let now = Utc::now();
        let rule = base_rule();
        let sample = sample_at(0.8, now);
        assert_eq!(evaluate(&rule, &sample, now), evaluate(&rule, &sample, now));
    }

    #[test]
    fn batch_evaluate_skips_rules_without_a_sample() {
        let now = Utc::now();
        let mut rules = vec![base_rule()];
        rules[0].market_id = "missing-market".into();
        let samples = HashMap::new();
        let decisions = batch_evaluate(&rules, &samples, now);
        assert!(decisions.is_empty());
    }
}
