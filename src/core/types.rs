use std::collections::BTreeMap;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Default number of paths when a request does not ask for a specific count.
pub const DEFAULT_SIMULATIONS: u32 = 5_000;

/// Upper bound on the path count accepted from a single request. Keeps
/// interactive use bounded; callers wanting more must raise the cap here.
pub const MAX_SIMULATIONS: u32 = 50_000;

/// Return/volatility parameters for one asset, resolved by the caller from
/// its data source before the simulation is invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetParams {
    pub id: String,
    /// Expected annual return, e.g. 0.07 for 7%. May be negative.
    pub annual_return: f64,
    /// Annual return volatility. Must be non-negative.
    pub annual_volatility: f64,
}

/// Everything one simulation run needs besides the per-asset parameters.
///
/// Asset maps are ordered so that summation order over balances is stable
/// across runs; floating-point totals would otherwise wobble at the margin.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Starting balance per asset identifier. Values must be non-negative.
    pub current_assets: BTreeMap<String, f64>,
    /// Monthly contribution per asset identifier. Amounts must be positive.
    pub monthly_allocations: BTreeMap<String, f64>,
    pub start_year: i32,
    pub end_year: i32,
    /// Total annual maintenance cost, deducted as twelve monthly slices.
    pub annual_costs: f64,
    /// Fraction of the year-opening balance withdrawn per year, in [0, 1].
    pub withdrawal_rate: f64,
    pub withdrawal_start_year: i32,
    /// First year in which contributions no longer happen, if any.
    pub contribution_end_year: Option<i32>,
    pub simulations: u32,
    /// Base seed for the per-path generator streams. A fixed seed makes the
    /// whole result reproducible; `None` draws a fresh base seed per run.
    pub seed: Option<u64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SimulationError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no return/volatility parameters for asset {0}")]
    MissingAssetParams(String),
}

/// One asset position as submitted by a caller.
#[derive(Debug, Clone, Deserialize)]
pub struct HoldingEntry {
    pub asset_id: String,
    pub value: f64,
}

/// One monthly contribution line as submitted by a caller.
#[derive(Debug, Clone, Deserialize)]
pub struct AllocationEntry {
    pub asset_id: String,
    pub amount: f64,
}

/// Wire-format request. Converted into a [`SimulationConfig`] with
/// validation; duplicate asset identifiers are merged by summation and
/// entries with a blank identifier are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimulationRequest {
    pub current_assets: Vec<HoldingEntry>,
    pub monthly_allocations: Vec<AllocationEntry>,
    pub annual_costs: f64,
    /// Withdrawal rate in percent (e.g. 4.0 for a 4% rule), in [0, 100].
    pub withdrawal_rate_percent: f64,
    #[serde(default = "default_withdrawal_start_year")]
    pub withdrawal_start_year: i32,
    #[serde(default = "default_start_year")]
    pub start_year: i32,
    #[serde(default = "default_end_year")]
    pub end_year: i32,
    pub contribution_end_year: Option<i32>,
    pub simulations: Option<u32>,
    pub seed: Option<u64>,
}

fn default_start_year() -> i32 {
    2026
}

fn default_end_year() -> i32 {
    2040
}

fn default_withdrawal_start_year() -> i32 {
    2035
}

impl TryFrom<SimulationRequest> for SimulationConfig {
    type Error = SimulationError;

    fn try_from(request: SimulationRequest) -> Result<Self, Self::Error> {
        if !(0.0..=100.0).contains(&request.withdrawal_rate_percent) {
            return Err(SimulationError::InvalidConfig(format!(
                "withdrawal_rate_percent must be between 0 and 100, got {}",
                request.withdrawal_rate_percent
            )));
        }

        let mut current_assets = BTreeMap::new();
        for entry in &request.current_assets {
            let id = entry.asset_id.trim();
            if id.is_empty() {
                continue;
            }
            if entry.value < 0.0 {
                return Err(SimulationError::InvalidConfig(format!(
                    "asset {} has negative starting value {}",
                    id, entry.value
                )));
            }
            *current_assets.entry(id.to_string()).or_insert(0.0) += entry.value;
        }

        let mut monthly_allocations = BTreeMap::new();
        for entry in &request.monthly_allocations {
            let id = entry.asset_id.trim();
            if id.is_empty() {
                continue;
            }
            if entry.amount <= 0.0 {
                return Err(SimulationError::InvalidConfig(format!(
                    "allocation for {} must be positive, got {}",
                    id, entry.amount
                )));
            }
            *monthly_allocations.entry(id.to_string()).or_insert(0.0) += entry.amount;
        }

        Ok(SimulationConfig {
            current_assets,
            monthly_allocations,
            start_year: request.start_year,
            end_year: request.end_year,
            annual_costs: request.annual_costs,
            withdrawal_rate: request.withdrawal_rate_percent / 100.0,
            withdrawal_start_year: request.withdrawal_start_year,
            contribution_end_year: request.contribution_end_year,
            simulations: request.simulations.unwrap_or(DEFAULT_SIMULATIONS),
            seed: request.seed,
        })
    }
}

/// Percentile summaries of all simulated paths, one entry per calendar year.
///
/// Internal values keep full precision; rounding to two decimals happens in
/// the `Serialize` impl only. The `p10`/`p50`/`p90` aliases are verbatim
/// copies of the corresponding balance percentile rows.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub years: Vec<i32>,
    #[serde(serialize_with = "rounded_percentile_map")]
    pub percentiles: BTreeMap<u8, Vec<f64>>,
    #[serde(serialize_with = "rounded_percentile_map")]
    pub payouts_percentiles: BTreeMap<u8, Vec<f64>>,
    #[serde(serialize_with = "rounded_percentile_map")]
    pub taxes_percentiles: BTreeMap<u8, Vec<f64>>,
    #[serde(serialize_with = "rounded_percentile_map")]
    pub costs_percentiles: BTreeMap<u8, Vec<f64>>,
    #[serde(serialize_with = "rounded_series")]
    pub p10: Vec<f64>,
    #[serde(serialize_with = "rounded_series")]
    pub p50: Vec<f64>,
    #[serde(serialize_with = "rounded_series")]
    pub p90: Vec<f64>,
    #[serde(serialize_with = "rounded_series")]
    pub mean: Vec<f64>,
    #[serde(serialize_with = "rounded_series")]
    pub deposit_pot_p50: Vec<f64>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn rounded_series<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(values.len()))?;
    for value in values {
        seq.serialize_element(&round2(*value))?;
    }
    seq.end()
}

fn rounded_percentile_map<S: Serializer>(
    map: &BTreeMap<u8, Vec<f64>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut out = serializer.serialize_map(Some(map.len()))?;
    for (rank, series) in map {
        let rounded: Vec<f64> = series.iter().copied().map(round2).collect();
        out.serialize_entry(rank, &rounded)?;
    }
    out.end()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> SimulationRequest {
        SimulationRequest {
            current_assets: vec![HoldingEntry {
                asset_id: "IE00B4L5Y983".to_string(),
                value: 10_000.0,
            }],
            monthly_allocations: vec![AllocationEntry {
                asset_id: "IE00B4L5Y983".to_string(),
                amount: 500.0,
            }],
            annual_costs: 120.0,
            withdrawal_rate_percent: 4.0,
            withdrawal_start_year: 2035,
            start_year: 2026,
            end_year: 2040,
            contribution_end_year: None,
            simulations: None,
            seed: Some(7),
        }
    }

    #[test]
    fn request_conversion_scales_percent_and_applies_defaults() {
        let config = SimulationConfig::try_from(base_request()).unwrap();
        assert!((config.withdrawal_rate - 0.04).abs() < 1e-12);
        assert_eq!(config.simulations, DEFAULT_SIMULATIONS);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.current_assets["IE00B4L5Y983"], 10_000.0);
    }

    #[test]
    fn request_conversion_merges_duplicate_identifiers() {
        let mut request = base_request();
        request.current_assets.push(HoldingEntry {
            asset_id: " IE00B4L5Y983 ".to_string(),
            value: 2_500.0,
        });
        request.monthly_allocations.push(AllocationEntry {
            asset_id: "IE00B4L5Y983".to_string(),
            amount: 250.0,
        });
        request.current_assets.push(HoldingEntry {
            asset_id: "   ".to_string(),
            value: 999.0,
        });

        let config = SimulationConfig::try_from(request).unwrap();
        assert_eq!(config.current_assets.len(), 1);
        assert!((config.current_assets["IE00B4L5Y983"] - 12_500.0).abs() < 1e-9);
        assert!((config.monthly_allocations["IE00B4L5Y983"] - 750.0).abs() < 1e-9);
    }

    #[test]
    fn request_conversion_rejects_bad_magnitudes() {
        let mut request = base_request();
        request.current_assets[0].value = -1.0;
        assert!(matches!(
            SimulationConfig::try_from(request),
            Err(SimulationError::InvalidConfig(_))
        ));

        let mut request = base_request();
        request.monthly_allocations[0].amount = 0.0;
        assert!(matches!(
            SimulationConfig::try_from(request),
            Err(SimulationError::InvalidConfig(_))
        ));

        let mut request = base_request();
        request.withdrawal_rate_percent = 140.0;
        assert!(matches!(
            SimulationConfig::try_from(request),
            Err(SimulationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn request_deserializes_from_contract_json() {
        let request: SimulationRequest = serde_json::from_str(
            r#"{
                "current_assets": [{"asset_id": "X", "value": 1000.0}],
                "monthly_allocations": [{"asset_id": "X", "amount": 100.0}],
                "annual_costs": 0,
                "withdrawal_rate_percent": 0,
                "withdrawal_start_year": 2035,
                "start_year": 2026,
                "end_year": 2030
            }"#,
        )
        .unwrap();
        assert_eq!(request.start_year, 2026);
        assert_eq!(request.contribution_end_year, None);
        assert_eq!(request.seed, None);
    }
}
