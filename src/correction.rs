//! Multiple-testing correction of p-value families.
//!
//! NaN p-values (undefined tests) are not counted in the family size and
//! stay NaN after adjustment. Adjusted values are capped at 1 and are never
//! below the corresponding raw value.

use serde::{Deserialize, Serialize};

/// Multiple-testing procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Correction {
    None,
    /// Family-wise: `p * m`.
    Bonferroni,
    /// Family-wise, step-down.
    Holm,
    /// False discovery rate, step-up.
    #[default]
    BenjaminiHochberg,
    /// FDR under arbitrary dependence: BH scaled by the harmonic sum `Σ 1/i`.
    BenjaminiYekutieli,
}

impl Correction {
    /// Adjusted p-values in the order of `p_values`.
    pub fn adjust(&self, p_values: &[f64]) -> Vec<f64> {
        let mut adjusted = p_values.to_vec();
        // indices of defined tests, ascending by p
        let mut order: Vec<usize> = (0..p_values.len())
            .filter(|&i| !p_values[i].is_nan())
            .collect();
        let m = order.len();
        if m == 0 || *self == Correction::None {
            return adjusted;
        }
        order.sort_by(|&a, &b| {
            p_values[a]
                .partial_cmp(&p_values[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let m_f64 = m as f64;

        match self {
            Correction::None => {}
            Correction::Bonferroni => {
                for &i in &order {
                    adjusted[i] = (p_values[i] * m_f64).min(1.0);
                }
            }
            Correction::Holm => {
                let mut running_max: f64 = 0.0;
                for (rank, &i) in order.iter().enumerate() {
                    let value = (p_values[i] * (m - rank) as f64).min(1.0);
                    running_max = running_max.max(value);
                    adjusted[i] = running_max;
                }
            }
            Correction::BenjaminiHochberg | Correction::BenjaminiYekutieli => {
                let dependence = if *self == Correction::BenjaminiYekutieli {
                    (1..=m).map(|i| 1.0 / i as f64).sum::<f64>()
                } else {
                    1.0
                };
                // work backwards from the largest p-value
                let mut running_min: f64 = 1.0;
                for (rank, &i) in order.iter().enumerate().rev() {
                    let value = p_values[i] * m_f64 * dependence / (rank + 1) as f64;
                    running_min = running_min.min(value);
                    adjusted[i] = running_min.min(1.0);
                }
            }
        }
        adjusted
    }
}
