//! Balance-delta invariants checked across a run.

use alloy_primitives::{Address, I256, U256};
use chrono::Utc;
use futures::future::{join_all, try_join_all};
use serde::Serialize;
use tracing::{info, warn};

use crate::{api::LedgerApi, error::SetupError, types::BalanceSnapshot};

/// Default relative tolerance of ratio checks.
pub const DEFAULT_TOLERANCE: f64 = 0.10;

/// Fixed-point scale used to divide balance deltas.
const RATIO_SCALE: u64 = 1_000_000;

/// Relationship a check expects between balance deltas.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    /// The account must receive something.
    Positive {
        /// Checked account.
        account: Address,
    },
    /// `delta(numerator) / delta(denominator)` must be within `tolerance` of `target`.
    Ratio {
        /// Account whose delta is divided.
        numerator: Address,
        /// Account whose delta divides.
        denominator: Address,
        /// Expected ratio.
        target: f64,
        /// Relative tolerance, as a fraction of `target`.
        tolerance: f64,
    },
}

/// A labelled expectation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvariantCheck {
    /// Name reported with the result.
    pub label: String,
    /// What is checked.
    #[serde(flatten)]
    pub expectation: Expectation,
}

impl InvariantCheck {
    /// Expects `account` to gain balance.
    pub fn positive(label: impl Into<String>, account: Address) -> Self {
        Self { label: label.into(), expectation: Expectation::Positive { account } }
    }

    /// Expects the delta ratio of two accounts to be near `target`.
    pub fn ratio(
        label: impl Into<String>,
        numerator: Address,
        denominator: Address,
        target: f64,
    ) -> Self {
        Self {
            label: label.into(),
            expectation: Expectation::Ratio {
                numerator,
                denominator,
                target,
                tolerance: DEFAULT_TOLERANCE,
            },
        }
    }

    /// Overrides the tolerance of a ratio check.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        if let Expectation::Ratio { tolerance: current, .. } = &mut self.expectation {
            *current = tolerance;
        }
        self
    }

    /// Accounts the check reads.
    pub fn accounts(&self) -> Vec<Address> {
        match &self.expectation {
            Expectation::Positive { account } => vec![*account],
            Expectation::Ratio { numerator, denominator, .. } => vec![*numerator, *denominator],
        }
    }
}

/// Signed balance change of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceDelta {
    /// The account.
    pub account: Address,
    /// Balance before the run.
    pub before: U256,
    /// Balance after the run.
    pub after: U256,
}

impl BalanceDelta {
    /// `after - before` as a signed value.
    pub fn signed(&self) -> I256 {
        I256::from_raw(self.after.wrapping_sub(self.before))
    }

    /// The increase, if the balance grew.
    pub fn gain(&self) -> Option<U256> {
        self.after.checked_sub(self.before).filter(|gain| !gain.is_zero())
    }
}

/// Verdict of one check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    /// Check label.
    pub label: String,
    /// Whether the expectation held.
    pub passed: bool,
    /// Observed ratio, or the observed delta of positive checks when it fits.
    pub observed: Option<f64>,
    /// Human readable explanation.
    pub detail: String,
}

impl CheckResult {
    fn pass(label: &str, observed: Option<f64>, detail: String) -> Self {
        Self { label: label.to_owned(), passed: true, observed, detail }
    }

    fn fail(label: &str, observed: Option<f64>, detail: String) -> Self {
        Self { label: label.to_owned(), passed: false, observed, detail }
    }
}

/// Checks balance-delta expectations against boundary snapshots.
///
/// A violated expectation is a failed [`CheckResult`], never an error.
#[derive(Debug, Clone, Default)]
pub struct InvariantVerifier {
    checks: Vec<InvariantCheck>,
}

impl InvariantVerifier {
    /// Creates a verifier for `checks`.
    pub const fn new(checks: Vec<InvariantCheck>) -> Self {
        Self { checks }
    }

    /// The configured checks.
    pub fn checks(&self) -> &[InvariantCheck] {
        &self.checks
    }

    /// Every account any check reads, deduplicated, in first-use order.
    pub fn accounts(&self) -> Vec<Address> {
        let mut accounts = Vec::new();
        for account in self.checks.iter().flat_map(InvariantCheck::accounts) {
            if !accounts.contains(&account) {
                accounts.push(account);
            }
        }
        accounts
    }

    /// Evaluates every check.
    pub fn verify(
        &self,
        before: &[BalanceSnapshot],
        after: &[BalanceSnapshot],
    ) -> Vec<CheckResult> {
        let results: Vec<_> =
            self.checks.iter().map(|check| evaluate(check, before, after)).collect();
        for result in &results {
            if result.passed {
                info!(label = %result.label, detail = %result.detail, "invariant held");
            } else {
                warn!(label = %result.label, detail = %result.detail, "invariant violated");
            }
        }
        results
    }
}

fn delta(
    account: Address,
    before: &[BalanceSnapshot],
    after: &[BalanceSnapshot],
) -> Result<BalanceDelta, String> {
    let find = |snapshots: &[BalanceSnapshot]| {
        snapshots.iter().rev().find(|snapshot| snapshot.account == account).map(|s| s.amount)
    };
    let before = find(before).ok_or_else(|| format!("no starting balance for {account}"))?;
    let after = find(after).ok_or_else(|| format!("no final balance for {account}"))?;
    Ok(BalanceDelta { account, before, after })
}

fn evaluate(
    check: &InvariantCheck,
    before: &[BalanceSnapshot],
    after: &[BalanceSnapshot],
) -> CheckResult {
    let label = check.label.as_str();
    match check.expectation {
        Expectation::Positive { account } => match delta(account, before, after) {
            Err(missing) => CheckResult::fail(label, None, missing),
            Ok(delta) => {
                let observed = u128::try_from(delta.signed().unsigned_abs()).ok().map(|d| {
                    if delta.signed().is_negative() { -(d as f64) } else { d as f64 }
                });
                let detail = format!("delta {}", delta.signed());
                if delta.gain().is_some() {
                    CheckResult::pass(label, observed, detail)
                } else {
                    CheckResult::fail(label, observed, detail)
                }
            }
        },
        Expectation::Ratio { numerator, denominator, target, tolerance } => {
            let deltas = delta(numerator, before, after)
                .and_then(|num| delta(denominator, before, after).map(|den| (num, den)));
            let (num, den) = match deltas {
                Ok(deltas) => deltas,
                Err(missing) => return CheckResult::fail(label, None, missing),
            };
            let Some(den_gain) = den.gain() else {
                let detail = format!("denominator delta {} is not positive", den.signed());
                return CheckResult::fail(label, None, detail);
            };
            let Some(num_gain) = num.gain() else {
                let detail = format!("numerator delta {} is not positive", num.signed());
                return CheckResult::fail(label, Some(0.0), detail);
            };

            let Some(ratio) = scaled_ratio(num_gain, den_gain) else {
                return CheckResult::fail(label, None, "delta ratio out of range".to_owned());
            };
            let lower = target * (1.0 - tolerance);
            let upper = target * (1.0 + tolerance);
            let detail = format!("ratio {ratio:.4}, expected {target} in ({lower:.4}, {upper:.4})");
            if ratio > lower && ratio < upper {
                CheckResult::pass(label, Some(ratio), detail)
            } else {
                CheckResult::fail(label, Some(ratio), detail)
            }
        }
    }
}

fn scaled_ratio(numerator: U256, denominator: U256) -> Option<f64> {
    let scaled = numerator.checked_mul(U256::from(RATIO_SCALE))? / denominator;
    u128::try_from(scaled).ok().map(|scaled| scaled as f64 / RATIO_SCALE as f64)
}

/// Reads the balance of every account; any failure aborts.
pub async fn take_snapshots<L: LedgerApi + ?Sized>(
    api: &L,
    accounts: &[Address],
) -> Result<Vec<BalanceSnapshot>, SetupError> {
    try_join_all(accounts.iter().map(|&account| async move {
        let amount = api
            .balance(account)
            .await
            .map_err(|source| SetupError::BalanceSnapshot { account, source })?;
        Ok(BalanceSnapshot { account, amount, taken_at: Utc::now() })
    }))
    .await
}

/// Reads the balance of every account, skipping the ones that fail.
pub async fn take_snapshots_partial<L: LedgerApi + ?Sized>(
    api: &L,
    accounts: &[Address],
) -> Vec<BalanceSnapshot> {
    let reads = join_all(accounts.iter().map(|&account| async move {
        match api.balance(account).await {
            Ok(amount) => Some(BalanceSnapshot { account, amount, taken_at: Utc::now() }),
            Err(error) => {
                warn!(%account, %error, "failed to read final balance");
                None
            }
        }
    }))
    .await;
    reads.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const ECOSYSTEM: Address = Address::repeat_byte(0xe0);
    const RESERVE: Address = Address::repeat_byte(0xe1);

    fn snapshot(account: Address, amount: u64) -> BalanceSnapshot {
        BalanceSnapshot { account, amount: U256::from(amount), taken_at: Utc::now() }
    }

    fn verify(check: InvariantCheck, deltas: [(Address, u64, u64); 2]) -> CheckResult {
        let before: Vec<_> = deltas.iter().map(|(a, b, _)| snapshot(*a, *b)).collect();
        let after: Vec<_> = deltas.iter().map(|(a, _, c)| snapshot(*a, *c)).collect();
        InvariantVerifier::new(vec![check]).verify(&before, &after).remove(0)
    }

    #[rstest]
    #[case::exact(200, 100, true)]
    #[case::within_band(219, 100, true)]
    #[case::low_within_band(181, 100, true)]
    #[case::upper_edge(220, 100, false)]
    #[case::lower_edge(180, 100, false)]
    #[case::four_to_one(200, 50, false)]
    #[case::nothing_received(0, 100, false)]
    #[case::denominator_unchanged(200, 0, false)]
    fn ratio_within_tolerance(#[case] num: u64, #[case] den: u64, #[case] passed: bool) {
        let check = InvariantCheck::ratio("fee split", ECOSYSTEM, RESERVE, 2.0);
        let result = verify(check, [(ECOSYSTEM, 1_000, 1_000 + num), (RESERVE, 500, 500 + den)]);
        assert_eq!(result.passed, passed, "{}", result.detail);
    }

    #[test]
    fn ratio_reports_observed_value() {
        let check = InvariantCheck::ratio("fee split", ECOSYSTEM, RESERVE, 2.0);
        let result = verify(check, [(ECOSYSTEM, 0, 200), (RESERVE, 0, 50)]);
        assert!(!result.passed);
        assert_eq!(result.observed, Some(4.0));
    }

    #[test]
    fn tolerance_can_be_widened() {
        let check =
            InvariantCheck::ratio("fee split", ECOSYSTEM, RESERVE, 2.0).with_tolerance(1.5);
        let result = verify(check, [(ECOSYSTEM, 0, 200), (RESERVE, 0, 50)]);
        assert!(result.passed);
    }

    #[rstest]
    #[case::gained(100, 101, true)]
    #[case::unchanged(100, 100, false)]
    #[case::lost(100, 40, false)]
    fn positive_requires_gain(#[case] before: u64, #[case] after: u64, #[case] passed: bool) {
        let check = InvariantCheck::positive("ecosystem receives", ECOSYSTEM);
        let result = verify(check, [(ECOSYSTEM, before, after), (RESERVE, 0, 0)]);
        assert_eq!(result.passed, passed);
        assert_eq!(result.observed, Some(after as f64 - before as f64));
    }

    #[test]
    fn missing_snapshot_fails_the_check() {
        let check = InvariantCheck::positive("ecosystem receives", ECOSYSTEM);
        let verifier = InvariantVerifier::new(vec![check]);
        let results = verifier.verify(&[snapshot(ECOSYSTEM, 1)], &[]);
        assert!(!results[0].passed);
        assert!(results[0].detail.contains("no final balance"));
    }

    #[test]
    fn signed_delta_handles_decrease() {
        let delta =
            BalanceDelta { account: ECOSYSTEM, before: U256::from(10), after: U256::from(3) };
        assert_eq!(delta.signed(), I256::try_from(-7).unwrap());
        assert_eq!(delta.gain(), None);
    }

    #[test]
    fn accounts_are_deduplicated() {
        let verifier = InvariantVerifier::new(vec![
            InvariantCheck::positive("a", ECOSYSTEM),
            InvariantCheck::ratio("b", ECOSYSTEM, RESERVE, 2.0),
        ]);
        assert_eq!(verifier.accounts(), vec![ECOSYSTEM, RESERVE]);
    }
}
