//! The scoring model: delta, variance and match ratio.
//!
//! Target and candidate are treated as points in herb space. `delta` is the
//! Euclidean distance between the dose-weighted combination and the target,
//! with contributions outside the target inflated by `penalty_factor` so
//! that an off-target herb costs more than a missed one. `variance`, the
//! target's own distance from the origin, is the natural normalizer turning
//! a delta into a match ratio.

use crate::{Catalog, Composition, RecipeKey};

/// The residual system of one combination: a column of herb contributions
/// per member, and the right-hand side the dose-weighted sum should hit.
/// Rows are the target herbs in target order, then every off-target herb
/// any member carries (penalty-scaled, rhs zero), in member order.
pub(crate) struct ResidualSystem {
    pub columns: Vec<Vec<f64>>,
    pub rhs: Vec<f64>,
}

impl ResidualSystem {
    pub fn build(
        catalog: &Catalog,
        combination: &[RecipeKey],
        target: &Composition,
        penalty_factor: f64,
    ) -> Self {
        let mut herbs: Vec<(&str, f64)> = target
            .iter()
            .map(|(herb, &amount)| (herb.as_str(), amount))
            .collect();
        for key in combination {
            for herb in catalog[key].keys() {
                if !target.contains_key(herb) && !herbs.iter().any(|&(h, _)| h == herb.as_str()) {
                    herbs.push((herb.as_str(), 0.0));
                }
            }
        }

        let columns = combination
            .iter()
            .map(|key| {
                let composition = &catalog[key];
                herbs
                    .iter()
                    .map(|&(herb, _)| {
                        let amount = composition.get(herb).copied().unwrap_or(0.0);
                        if target.contains_key(herb) {
                            amount
                        } else {
                            penalty_factor * amount
                        }
                    })
                    .collect()
            })
            .collect();
        let rhs = herbs.iter().map(|&(_, amount)| amount).collect();

        ResidualSystem { columns, rhs }
    }

    /// Residual vector `rhs - A x`.
    pub fn residual(&self, x: &[f64]) -> Vec<f64> {
        let mut residual = self.rhs.clone();
        for (column, &dosage) in self.columns.iter().zip(x) {
            for (r, coefficient) in residual.iter_mut().zip(column) {
                *r -= coefficient * dosage;
            }
        }
        residual
    }

    pub fn delta(&self, x: &[f64]) -> f64 {
        norm(&self.residual(x))
    }
}

pub(crate) fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Distance between the dose-weighted combination and the target, with
/// off-target contributions scaled by `penalty_factor`. Zero iff the
/// combination reproduces the target exactly and adds nothing else.
pub fn delta(
    catalog: &Catalog,
    dosages: &[f64],
    combination: &[RecipeKey],
    target: &Composition,
    penalty_factor: f64,
) -> f64 {
    ResidualSystem::build(catalog, combination, target, penalty_factor).delta(dosages)
}

/// L2 norm of the target composition.
pub fn variance(target: &Composition) -> f64 {
    target.values().map(|amount| amount * amount).sum::<f64>().sqrt()
}

/// `1 - delta / variance`; 1 when the variance is zero. May go negative
/// when the candidate is worse than contributing nothing at all.
pub fn match_ratio(delta: f64, variance: f64) -> f64 {
    if variance > 0.0 {
        1.0 - delta / variance
    } else {
        1.0
    }
}

/// Round to `places` decimals, the precision at which dosages and
/// remainders are zero-tested.
pub fn round_to_places(value: f64, places: u32) -> f64 {
    let scale = 10f64.powi(places as i32);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::Catalog;

    fn composition(pairs: &[(&str, f64)]) -> Composition {
        pairs.iter().map(|&(herb, amount)| (herb.to_owned(), amount)).collect()
    }

    fn two_formula_catalog() -> Catalog {
        let mut catalog = Catalog::default();
        catalog.insert(
            "桂枝湯".to_owned(),
            composition(&[
                ("桂枝", 0.6),
                ("白芍", 0.6),
                ("生薑", 0.6),
                ("大棗", 0.5),
                ("炙甘草", 0.4),
            ]),
        );
        catalog.insert(
            "桂枝去芍藥湯".to_owned(),
            composition(&[("桂枝", 0.6), ("生薑", 0.6), ("大棗", 0.5), ("炙甘草", 0.4)]),
        );
        catalog
    }

    fn combo() -> Vec<String> {
        vec!["桂枝湯".to_owned(), "桂枝去芍藥湯".to_owned()]
    }

    #[test]
    fn test_delta() {
        let catalog = two_formula_catalog();
        let target = composition(&[
            ("桂枝", 1.2),
            ("白芍", 1.2),
            ("生薑", 1.2),
            ("大棗", 1.0),
            ("炙甘草", 0.8),
        ]);

        assert_relative_eq!(
            delta(&catalog, &[1.0, 1.0], &combo(), &target, 2.0),
            0.6,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            delta(&catalog, &[2.0, 0.0], &combo(), &target, 2.0),
            0.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            delta(&catalog, &[0.0, 2.0], &combo(), &target, 2.0),
            1.2,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_delta_with_penalty() {
        // 白芍 is absent from the target, so 桂枝湯 dosages pay the penalty
        let catalog = two_formula_catalog();
        let target =
            composition(&[("桂枝", 1.2), ("生薑", 1.2), ("大棗", 1.0), ("炙甘草", 0.8)]);

        assert_relative_eq!(
            delta(&catalog, &[1.0, 1.0], &combo(), &target, 2.0),
            1.2,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            delta(&catalog, &[2.0, 0.0], &combo(), &target, 2.0),
            2.4,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            delta(&catalog, &[0.0, 2.0], &combo(), &target, 2.0),
            0.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_variance() {
        assert_relative_eq!(variance(&Composition::default()), 0.0);
        assert_relative_eq!(variance(&composition(&[("桂枝", 3.0), ("白芍", 4.0)])), 5.0);
    }

    #[test]
    fn test_match_ratio() {
        assert_relative_eq!(match_ratio(0.0, 1.0), 1.0);
        assert_relative_eq!(match_ratio(0.1, 1.0), 0.9);
        assert_relative_eq!(match_ratio(0.5, 1.0), 0.5);
        assert_relative_eq!(match_ratio(1.0, 1.0), 0.0);

        assert_relative_eq!(match_ratio(0.0, 0.5), 1.0);
        assert_relative_eq!(match_ratio(0.1, 0.5), 0.8);
        assert_relative_eq!(match_ratio(0.5, 0.5), 0.0);
        assert_relative_eq!(match_ratio(1.0, 0.5), -1.0);

        // zero variance means an empty target, every delta counts as perfect
        assert_relative_eq!(match_ratio(0.0, 0.0), 1.0);
        assert_relative_eq!(match_ratio(0.5, 0.0), 1.0);
        assert_relative_eq!(match_ratio(1.0, 0.0), 1.0);
    }

    #[test]
    fn test_match_ratio_against_computed_variance() {
        let variance = variance(&composition(&[
            ("桂枝", 1.2),
            ("白芍", 1.2),
            ("生薑", 1.2),
            ("大棗", 1.0),
            ("炙甘草", 0.8),
        ]));
        assert_relative_eq!(match_ratio(0.0, variance), 1.0);
        assert_relative_eq!(match_ratio(0.01, variance), 0.9959038403974048, epsilon = 1e-12);
        assert_relative_eq!(match_ratio(0.1, variance), 0.9590384039740479, epsilon = 1e-12);
        assert_relative_eq!(match_ratio(0.5, variance), 0.7951920198702399, epsilon = 1e-12);
        assert_relative_eq!(match_ratio(1.0, variance), 0.5903840397404798, epsilon = 1e-12);
    }

    #[test]
    fn test_round_to_places() {
        assert_relative_eq!(round_to_places(0.04, 1), 0.0);
        assert_relative_eq!(round_to_places(0.04, 2), 0.04);
        assert_relative_eq!(round_to_places(1.97, 1), 2.0);
        assert_relative_eq!(round_to_places(2.5, 0), 3.0);
    }
}
