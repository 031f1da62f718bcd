use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use tracing::debug;

use super::types::{
    AssetParams, MAX_SIMULATIONS, SimulationConfig, SimulationError, SimulationResult,
};

/// Flat tax rate applied to the portion of a withdrawal that exceeds the
/// cumulative invested capital.
const CAPITAL_GAINS_TAX_RATE: f64 = 0.22;

/// Runs the full Monte Carlo projection: `config.simulations` independent
/// paths, reduced to per-year percentile distributions.
///
/// Fails before simulating anything when the configuration is inconsistent
/// or when an asset referenced by the configuration has no entry in
/// `asset_params`. Results are bit-identical for a fixed seed regardless of
/// how many threads evaluate the paths.
pub fn run_simulation(
    asset_params: &BTreeMap<String, AssetParams>,
    config: &SimulationConfig,
) -> Result<SimulationResult, SimulationError> {
    validate(config)?;
    let plan = build_plan(asset_params, config)?;
    let base_seed = config.seed.unwrap_or_else(rand::random);

    debug!(
        paths = config.simulations,
        years = plan.years.len(),
        assets = plan.lanes.len(),
        "running monte carlo projection"
    );

    let outcomes: Vec<PathOutcome> = (0..config.simulations)
        .into_par_iter()
        .map(|path_id| {
            let mut rng = StdRng::seed_from_u64(derive_seed(base_seed, path_id));
            run_path(&plan, &mut rng)
        })
        .collect();

    let result = aggregate(plan.years.clone(), &outcomes);
    debug!(paths = outcomes.len(), "projection complete");
    Ok(result)
}

fn validate(config: &SimulationConfig) -> Result<(), SimulationError> {
    if config.end_year < config.start_year {
        return Err(SimulationError::InvalidConfig(format!(
            "end_year {} precedes start_year {}",
            config.end_year, config.start_year
        )));
    }
    if config.annual_costs < 0.0 {
        return Err(SimulationError::InvalidConfig(format!(
            "annual_costs must be non-negative, got {}",
            config.annual_costs
        )));
    }
    if !(0.0..=1.0).contains(&config.withdrawal_rate) {
        return Err(SimulationError::InvalidConfig(format!(
            "withdrawal_rate must be between 0 and 1, got {}",
            config.withdrawal_rate
        )));
    }
    if config.simulations == 0 || config.simulations > MAX_SIMULATIONS {
        return Err(SimulationError::InvalidConfig(format!(
            "simulations must be between 1 and {MAX_SIMULATIONS}, got {}",
            config.simulations
        )));
    }
    for (id, value) in &config.current_assets {
        if *value < 0.0 {
            return Err(SimulationError::InvalidConfig(format!(
                "asset {id} has negative starting value {value}"
            )));
        }
    }
    for (id, amount) in &config.monthly_allocations {
        if *amount <= 0.0 {
            return Err(SimulationError::InvalidConfig(format!(
                "allocation for {id} must be positive, got {amount}"
            )));
        }
    }
    Ok(())
}

/// One asset's precomputed per-path inputs: starting balance, monthly
/// contribution and the monthly return distribution.
struct AssetLane {
    start_balance: f64,
    monthly_contribution: f64,
    monthly_return: Normal<f64>,
}

/// Immutable, validated view of a run, shared read-only by all workers.
struct SimulationPlan {
    years: Vec<i32>,
    lanes: Vec<AssetLane>,
    annual_costs: f64,
    withdrawal_rate: f64,
    withdrawal_start_year: i32,
    contribution_end_year: Option<i32>,
}

fn build_plan(
    asset_params: &BTreeMap<String, AssetParams>,
    config: &SimulationConfig,
) -> Result<SimulationPlan, SimulationError> {
    // Union of both maps in BTreeMap key order; this fixes the iteration and
    // summation order for every path of the run.
    let mut ids: Vec<&String> = config.current_assets.keys().collect();
    for id in config.monthly_allocations.keys() {
        if !config.current_assets.contains_key(id) {
            ids.push(id);
        }
    }
    ids.sort();

    let mut lanes = Vec::with_capacity(ids.len());
    for id in ids {
        let params = asset_params
            .get(id)
            .ok_or_else(|| SimulationError::MissingAssetParams(id.clone()))?;
        if params.annual_volatility < 0.0 {
            return Err(SimulationError::InvalidConfig(format!(
                "asset {id} has negative volatility {}",
                params.annual_volatility
            )));
        }
        let monthly_mean = params.annual_return / 12.0;
        let monthly_sigma = params.annual_volatility / 12.0_f64.sqrt();
        let monthly_return = Normal::new(monthly_mean, monthly_sigma).map_err(|_| {
            SimulationError::InvalidConfig(format!("asset {id} has non-finite return parameters"))
        })?;

        lanes.push(AssetLane {
            start_balance: config.current_assets.get(id).copied().unwrap_or(0.0),
            monthly_contribution: config.monthly_allocations.get(id).copied().unwrap_or(0.0),
            monthly_return,
        });
    }

    Ok(SimulationPlan {
        years: (config.start_year..=config.end_year).collect(),
        lanes,
        annual_costs: config.annual_costs,
        withdrawal_rate: config.withdrawal_rate,
        withdrawal_start_year: config.withdrawal_start_year,
        contribution_end_year: config.contribution_end_year,
    })
}

/// Mutable state of a single path. Owned by exactly one worker.
struct PathState {
    balances: Vec<f64>,
    total_invested: f64,
    total_withdrawn: f64,
}

impl PathState {
    fn new(plan: &SimulationPlan) -> Self {
        let balances: Vec<f64> = plan.lanes.iter().map(|lane| lane.start_balance).collect();
        let total_invested = balances.iter().sum();
        Self {
            balances,
            total_invested,
            total_withdrawn: 0.0,
        }
    }

    fn total_balance(&self) -> f64 {
        self.balances.iter().sum()
    }
}

/// Yearly series produced by one path.
struct PathOutcome {
    balances: Vec<f64>,
    payouts: Vec<f64>,
    taxes: Vec<f64>,
    costs: Vec<f64>,
    deposit_pots: Vec<f64>,
}

fn run_path(plan: &SimulationPlan, rng: &mut StdRng) -> PathOutcome {
    let n_years = plan.years.len();
    let mut state = PathState::new(plan);
    let mut out = PathOutcome {
        balances: Vec::with_capacity(n_years),
        payouts: Vec::with_capacity(n_years),
        taxes: Vec::with_capacity(n_years),
        costs: Vec::with_capacity(n_years),
        deposit_pots: Vec::with_capacity(n_years),
    };

    for &year in &plan.years {
        // The withdrawal budget is fixed at the year-opening balance and not
        // recomputed mid-year.
        let withdrawal_budget = if year >= plan.withdrawal_start_year && plan.withdrawal_rate > 0.0
        {
            state.total_balance() * plan.withdrawal_rate
        } else {
            0.0
        };
        let monthly_withdrawal = withdrawal_budget / 12.0;

        let contributing = plan
            .contribution_end_year
            .is_none_or(|cutoff| year < cutoff);

        let mut year_payout = 0.0;
        let mut year_tax = 0.0;
        let mut year_cost = 0.0;

        for _ in 0..12 {
            if contributing {
                for (balance, lane) in state.balances.iter_mut().zip(&plan.lanes) {
                    *balance += lane.monthly_contribution;
                    state.total_invested += lane.monthly_contribution;
                }
            }

            if plan.annual_costs > 0.0 {
                let total = state.total_balance();
                if total > 0.0 {
                    let monthly_cost = (plan.annual_costs / 12.0).min(total);
                    year_cost += monthly_cost;
                    deduct_proportionally(&mut state.balances, monthly_cost, total);
                }
            }

            if monthly_withdrawal > 0.0 {
                let total = state.total_balance();
                // A month that cannot cover the full withdrawal is skipped
                // outright; there is no partial withdrawal.
                if total >= monthly_withdrawal {
                    let tax = incremental_tax(
                        state.total_withdrawn,
                        monthly_withdrawal,
                        state.total_invested,
                    );
                    year_tax += tax;
                    year_payout += monthly_withdrawal - tax;
                    state.total_withdrawn += monthly_withdrawal;
                    deduct_proportionally(&mut state.balances, monthly_withdrawal, total);
                }
            }

            for (balance, lane) in state.balances.iter_mut().zip(&plan.lanes) {
                // Zero balances are skipped so they stay exactly zero.
                if *balance > 0.0 {
                    let draw = lane.monthly_return.sample(rng);
                    *balance *= 1.0 + draw;
                }
            }
        }

        out.balances.push(state.total_balance());
        out.payouts.push(year_payout);
        out.taxes.push(year_tax);
        out.costs.push(year_cost);
        out.deposit_pots.push(state.total_invested);
    }

    out
}

/// Scales every balance by the same factor so the deduction lands in
/// proportion to each asset's share of the total.
fn deduct_proportionally(balances: &mut [f64], amount: f64, total: f64) {
    let factor = (1.0 - amount / total).clamp(0.0, 1.0);
    for balance in balances.iter_mut() {
        *balance *= factor;
    }
}

/// Tax on the slice of this withdrawal by which cumulative withdrawals newly
/// exceed cumulative invested capital; principal comes out tax-free first.
fn incremental_tax(prior_withdrawn: f64, gross_withdrawal: f64, basis: f64) -> f64 {
    let prior_excess = (prior_withdrawn - basis).max(0.0);
    let new_excess = (prior_withdrawn + gross_withdrawal - basis).max(0.0);
    (new_excess - prior_excess) * CAPITAL_GAINS_TAX_RATE
}

fn derive_seed(base_seed: u64, path_id: u32) -> u64 {
    splitmix64(base_seed ^ path_id as u64)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn aggregate(years: Vec<i32>, outcomes: &[PathOutcome]) -> SimulationResult {
    let n_years = years.len();
    let balances = sorted_year_columns(outcomes, n_years, |o| &o.balances);
    let payouts = sorted_year_columns(outcomes, n_years, |o| &o.payouts);
    let taxes = sorted_year_columns(outcomes, n_years, |o| &o.taxes);
    let costs = sorted_year_columns(outcomes, n_years, |o| &o.costs);
    let deposit_pots = sorted_year_columns(outcomes, n_years, |o| &o.deposit_pots);

    let percentiles = percentile_table(&balances);
    let payouts_percentiles = percentile_table(&payouts);
    let taxes_percentiles = percentile_table(&taxes);
    let costs_percentiles = percentile_table(&costs);

    let mean = balances
        .iter()
        .map(|column| column.iter().sum::<f64>() / column.len() as f64)
        .collect();
    let deposit_pot_p50 = deposit_pots
        .iter()
        .map(|column| percentile_of_sorted(column, 50.0))
        .collect();

    let p10 = percentiles[&10].clone();
    let p50 = percentiles[&50].clone();
    let p90 = percentiles[&90].clone();

    SimulationResult {
        years,
        percentiles,
        payouts_percentiles,
        taxes_percentiles,
        costs_percentiles,
        p10,
        p50,
        p90,
        mean,
        deposit_pot_p50,
    }
}

/// Transposes path outcomes into one sorted column per year, so each
/// percentile read is a plain indexed interpolation. Sorting also makes the
/// aggregation independent of path evaluation order.
fn sorted_year_columns<'a, F>(
    outcomes: &'a [PathOutcome],
    n_years: usize,
    series: F,
) -> Vec<Vec<f64>>
where
    F: Fn(&'a PathOutcome) -> &'a Vec<f64>,
{
    (0..n_years)
        .map(|year_idx| {
            let mut column: Vec<f64> = outcomes
                .iter()
                .map(|outcome| series(outcome)[year_idx])
                .collect();
            column.sort_by(|a, b| a.total_cmp(b));
            column
        })
        .collect()
}

fn percentile_table(columns: &[Vec<f64>]) -> BTreeMap<u8, Vec<f64>> {
    (1..=99)
        .map(|rank| {
            let series = columns
                .iter()
                .map(|column| percentile_of_sorted(column, rank as f64))
                .collect();
            (rank, series)
        })
        .collect()
}

/// Linear interpolation between order statistics of an ascending slice.
fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let w = rank - lower as f64;
        sorted[lower] * (1.0 - w) + sorted[upper] * w
    }
}
