//! Tax reform projection coefficients
//!
//! Rates are percentages keyed by calendar year. The parser and the
//! aggregation pass apply the same formulas, so both live here.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Year-keyed coefficients from `tax_rates`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TaxRates {
    pub year: i32,
    /// State share of IBS (%)
    pub ibs_state_rate: f64,
    /// Municipal share of IBS (%)
    pub ibs_municipal_rate: f64,
    /// CBS flat rate (%)
    pub cbs_rate: f64,
    /// How much of ICMS is already phased out (%)
    pub icms_reduction_pct: f64,
    /// How much of PIS/COFINS is already phased out (%)
    pub pis_cofins_reduction_pct: f64,
}

/// The three projected columns stored next to every document row
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedTaxes {
    pub icms: f64,
    pub ibs: f64,
    pub cbs: f64,
}

impl TaxRates {
    /// Built-in transition schedule, used when `tax_rates` has no row for `year`
    pub fn default_for_year(year: i32) -> Self {
        let (ibs_state, ibs_municipal, cbs, icms_red, pis_cofins_red) = match year {
            i32::MIN..=2025 => (0.0, 0.0, 0.0, 0.0, 0.0),
            2026 => (0.1, 0.0, 0.9, 0.0, 0.0),
            2027 | 2028 => (0.05, 0.05, 8.7, 0.0, 100.0),
            2029 => (1.77, 0.0, 8.8, 10.0, 100.0),
            2030 => (3.54, 0.0, 8.8, 20.0, 100.0),
            2031 => (5.31, 0.0, 8.8, 30.0, 100.0),
            2032 => (7.08, 0.0, 8.8, 40.0, 100.0),
            _ => (17.7, 0.0, 8.8, 100.0, 100.0),
        };

        Self {
            year,
            ibs_state_rate: ibs_state,
            ibs_municipal_rate: ibs_municipal,
            cbs_rate: cbs,
            icms_reduction_pct: icms_red,
            pis_cofins_reduction_pct: pis_cofins_red,
        }
    }

    /// Combined IBS rate (%)
    pub fn ibs_rate(&self) -> f64 {
        self.ibs_state_rate + self.ibs_municipal_rate
    }

    /// Project legacy values onto the reform taxes.
    ///
    /// The IBS/CBS base is the document value net of ICMS.
    pub fn project(&self, vl_doc: f64, vl_icms: f64) -> ProjectedTaxes {
        let base = vl_doc - vl_icms;
        ProjectedTaxes {
            icms: vl_icms * (1.0 - self.icms_reduction_pct / 100.0),
            ibs: base * self.ibs_rate() / 100.0,
            cbs: base * self.cbs_rate / 100.0,
        }
    }

    /// PIS + COFINS still due after the phase-out
    pub fn project_pis_cofins(&self, vl_pis: f64, vl_cofins: f64) -> f64 {
        (vl_pis + vl_cofins) * (1.0 - self.pis_cofins_reduction_pct / 100.0)
    }
}

impl Default for TaxRates {
    fn default() -> Self {
        Self::default_for_year(2025)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_pre_reform_years_project_nothing() {
        let rates = TaxRates::default_for_year(2024);
        let p = rates.project(1000.0, 180.0);
        assert!(approx(p.icms, 180.0));
        assert!(approx(p.ibs, 0.0));
        assert!(approx(p.cbs, 0.0));
    }

    #[test]
    fn test_2026_test_rates() {
        let rates = TaxRates::default_for_year(2026);
        let p = rates.project(1000.0, 180.0);
        // base = 820
        assert!(approx(p.ibs, 0.82));
        assert!(approx(p.cbs, 7.38));
        assert!(approx(p.icms, 180.0));
    }

    #[test]
    fn test_icms_fully_phased_out_from_2033() {
        let rates = TaxRates::default_for_year(2040);
        assert_eq!(rates.year, 2040);
        let p = rates.project(500.0, 90.0);
        assert!(approx(p.icms, 0.0));
        assert!(p.ibs > 0.0);
    }

    #[test]
    fn test_pis_cofins_projection_respects_reduction() {
        let rates = TaxRates::default_for_year(2026);
        assert!(approx(rates.project_pis_cofins(16.5, 76.0), 92.5));

        let rates = TaxRates::default_for_year(2027);
        assert!(approx(rates.project_pis_cofins(16.5, 76.0), 0.0));
    }

    #[test]
    fn test_projection_is_linear_in_sums() {
        // Aggregation recomputes projections from summed values; for these
        // formulas that equals the sum of per-line projections.
        let rates = TaxRates::default_for_year(2030);
        let a = rates.project(100.0, 12.0);
        let b = rates.project(250.0, 30.0);
        let sum = rates.project(350.0, 42.0);
        assert!(approx(a.ibs + b.ibs, sum.ibs));
        assert!(approx(a.cbs + b.cbs, sum.cbs));
        assert!(approx(a.icms + b.icms, sum.icms));
    }
}
