//! Precomputed standard-normal CDF lookup.
//!
//! Value-weight downweighting maps child z-scores through the normal CDF on
//! every stats recomputation, so the CDF is served from a fixed lookup table
//! with linear interpolation rather than evaluated directly.

use once_cell::sync::Lazy;

const TABLE_SIZE: usize = 4096;
const Z_MAX: f64 = 8.0;

/// Standard-normal CDF table over z in [-Z_MAX, Z_MAX].
pub struct NormalCdfTable {
    values: Vec<f64>,
}

static TABLE: Lazy<NormalCdfTable> = Lazy::new(NormalCdfTable::new);

impl NormalCdfTable {
    fn new() -> NormalCdfTable {
        let values = (0..TABLE_SIZE)
            .map(|i| {
                let z = -Z_MAX + 2.0 * Z_MAX * i as f64 / (TABLE_SIZE - 1) as f64;
                normal_cdf_direct(z)
            })
            .collect();
        NormalCdfTable { values }
    }

    /// Shared table instance.
    pub fn get() -> &'static NormalCdfTable {
        &TABLE
    }

    /// CDF of the standard normal at `z`, linearly interpolated.
    pub fn cdf(&self, z: f64) -> f64 {
        if !z.is_finite() {
            return if z > 0.0 { 1.0 } else { 0.0 };
        }
        let t = (z + Z_MAX) / (2.0 * Z_MAX) * (TABLE_SIZE - 1) as f64;
        if t <= 0.0 {
            return self.values[0];
        }
        if t >= (TABLE_SIZE - 1) as f64 {
            return self.values[TABLE_SIZE - 1];
        }
        let i = t as usize;
        let frac = t - i as f64;
        self.values[i] * (1.0 - frac) + self.values[i + 1] * frac
    }
}

/// Direct CDF via an Abramowitz-Stegun erf approximation. Only used to fill
/// the table; max absolute error ~1.5e-7.
fn normal_cdf_direct(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdf_known_values() {
        let table = NormalCdfTable::get();
        assert!((table.cdf(0.0) - 0.5).abs() < 1e-4);
        assert!((table.cdf(1.0) - 0.8413).abs() < 1e-3);
        assert!((table.cdf(-1.0) - 0.1587).abs() < 1e-3);
        assert!((table.cdf(2.0) - 0.9772).abs() < 1e-3);
    }

    #[test]
    fn cdf_saturates_at_tails() {
        let table = NormalCdfTable::get();
        assert!(table.cdf(10.0) > 0.999999);
        assert!(table.cdf(-10.0) < 1e-6);
        assert_eq!(table.cdf(f64::INFINITY), 1.0);
        assert_eq!(table.cdf(f64::NEG_INFINITY), 0.0);
    }

    #[test]
    fn cdf_is_monotone() {
        let table = NormalCdfTable::get();
        let mut prev = 0.0;
        for i in -40..=40 {
            let v = table.cdf(i as f64 / 10.0);
            assert!(v >= prev);
            prev = v;
        }
    }
}
