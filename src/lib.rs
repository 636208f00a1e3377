//! Given a target composition (a weighted bag of herb amounts) and a catalog
//! of recipes (each itself a weighted bag over herbs), which few recipes, at
//! which continuous dosages, add up closest to the target?
//! E.g.:
//! You have a catalog of 600 concentrated formulas
//! You want 桂枝:1.2 白芍:1.2 生薑:1.2 大棗:1.0 炙甘草:0.8
//! Which one or two formulas, plus a couple of single-herb extracts, come
//! closest — and at what dosage of each?
//!
//! Closeness is the Euclidean distance between the dose-weighted sum and the
//! target, with off-target herbs penalized; results are ranked by the match
//! percentage that distance normalizes to. Candidate combinations come from
//! either an exhaustive subset walk or a pruned beam expansion, and every
//! combination gets its dosages fitted by a bounded least-squares solve.

use indexmap::IndexMap;
use smallvec::SmallVec;

pub mod catalog;
pub mod error;
pub mod score;
pub mod search;
pub mod solve;

mod beam;

pub use error::{Error, Result};
pub use search::{Algorithm, Match, SearchOptions, Searcher};

/// An atomic ingredient appearing in compositions.
pub type Herb = String;
/// Identifier of a catalog recipe.
pub type RecipeKey = String;
/// Herb amounts, insertion-ordered; a missing herb means amount zero.
pub type Composition = IndexMap<Herb, f64>;
/// Recipes by key, normalized to unit dosage, in load order.
pub type Catalog = IndexMap<RecipeKey, Composition>;
/// An ordered tuple of recipe keys.
pub type Combination = Vec<RecipeKey>;
/// Dosages aligned index-wise with a combination.
pub type Dosages = SmallVec<[f64; 4]>;

/// Find the `top_n` recipe combinations whose dose-weighted sums best
/// approximate the target, ranked by match percentage.
pub fn find_best_matches(
    catalog: &Catalog,
    target: &Composition,
    options: &SearchOptions,
) -> Result<Vec<Match>> {
    options.validate()?;
    Ok(Searcher::new(catalog, target, options).find_best_matches())
}

#[cfg(test)]
mod tests {
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rustc_hash::FxHashSet;

    use super::*;

    fn composition(pairs: &[(&str, f64)]) -> Composition {
        pairs.iter().map(|&(herb, amount)| (herb.to_owned(), amount)).collect()
    }

    fn catalog(entries: &[(&str, &[(&str, f64)])]) -> Catalog {
        entries
            .iter()
            .map(|&(key, pairs)| (key.to_owned(), composition(pairs)))
            .collect()
    }

    fn guizhi_catalog() -> Catalog {
        catalog(&[
            (
                "桂枝湯",
                &[
                    ("桂枝", 0.6),
                    ("白芍", 0.6),
                    ("生薑", 0.6),
                    ("大棗", 0.5),
                    ("炙甘草", 0.4),
                ],
            ),
            (
                "桂枝去芍藥湯",
                &[("桂枝", 0.6), ("生薑", 0.6), ("大棗", 0.5), ("炙甘草", 0.4)],
            ),
            (
                "麻黃湯",
                &[("麻黃", 0.9), ("桂枝", 0.6), ("炙甘草", 0.3), ("杏仁", 0.5)],
            ),
        ])
    }

    fn guizhi_target() -> Composition {
        composition(&[
            ("桂枝", 1.2),
            ("白芍", 1.2),
            ("生薑", 1.2),
            ("大棗", 1.0),
            ("炙甘草", 0.8),
        ])
    }

    #[test]
    fn test_identity_match() {
        let options = SearchOptions {
            algorithm: Algorithm::Exhaustive,
            max_sformulas: 0,
            ..SearchOptions::default()
        };
        let matches = find_best_matches(&guizhi_catalog(), &guizhi_target(), &options).unwrap();

        let best = &matches[0];
        assert_eq!(best.combination, vec!["桂枝湯".to_owned()]);
        assert_eq!(best.dosages.as_slice(), &[2.0]);
        assert_abs_diff_eq!(best.percentage, 100.0, epsilon = 1e-3);
    }

    #[test]
    fn test_excludes_honored() {
        let options = SearchOptions {
            algorithm: Algorithm::Exhaustive,
            max_sformulas: 0,
            excludes: ["桂枝湯".to_owned()].into_iter().collect(),
            ..SearchOptions::default()
        };
        let matches = find_best_matches(&guizhi_catalog(), &guizhi_target(), &options).unwrap();

        assert!(matches
            .iter()
            .all(|m| !m.combination.contains(&"桂枝湯".to_owned())));
        let best = &matches[0];
        assert_eq!(best.combination, vec!["桂枝去芍藥湯".to_owned()]);
        assert_eq!(best.dosages.as_slice(), &[2.0]);
        assert_relative_eq!(best.percentage, 50.84596674545061, epsilon = 1e-3);
    }

    #[test]
    fn test_results_sorted_and_aligned() {
        let options = SearchOptions {
            algorithm: Algorithm::Exhaustive,
            ..SearchOptions::default()
        };
        let matches = find_best_matches(&guizhi_catalog(), &guizhi_target(), &options).unwrap();

        assert!(!matches.is_empty());
        for window in matches.windows(2) {
            assert!(window[0].percentage >= window[1].percentage);
        }
        for m in &matches {
            assert!(m.percentage <= 100.0 + 1e-9);
            assert!(!m.combination.is_empty());
            assert_eq!(m.combination.len(), m.dosages.len());
            assert!(m.dosages.iter().all(|&d| d != 0.0));
        }
    }

    #[test]
    fn test_exhaustive_is_deterministic() {
        let options = SearchOptions {
            algorithm: Algorithm::Exhaustive,
            ..SearchOptions::default()
        };
        let first = find_best_matches(&guizhi_catalog(), &guizhi_target(), &options).unwrap();
        let second = find_best_matches(&guizhi_catalog(), &guizhi_target(), &options).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_supplement_completes_partial_cover() {
        // the complex part leaves 白芍 and 生薑 short, both covered by
        // single recipes, and the supplement cap limits how many join
        let catalog = catalog(&[
            ("桂枝甘草湯", &[("桂枝", 0.8), ("炙甘草", 0.6)]),
            ("桂枝", &[("桂枝", 1.0)]),
            ("白芍", &[("白芍", 1.0)]),
            ("生薑", &[("生薑", 0.8)]),
        ]);
        let target = composition(&[
            ("桂枝", 1.6),
            ("炙甘草", 1.2),
            ("白芍", 1.2),
            ("生薑", 1.0),
        ]);
        let options = SearchOptions {
            algorithm: Algorithm::Exhaustive,
            max_sformulas: 2,
            ..SearchOptions::default()
        };
        let matches = find_best_matches(&catalog, &target, &options).unwrap();

        let best = &matches[0];
        assert_eq!(
            best.combination,
            vec!["桂枝甘草湯".to_owned(), "白芍".to_owned(), "生薑".to_owned()]
        );
        assert_abs_diff_eq!(best.percentage, 100.0, epsilon = 1e-2);
        for m in &matches {
            let singles = m
                .combination
                .iter()
                .filter(|key| catalog[key.as_str()].len() == 1)
                .count();
            assert!(singles <= options.max_sformulas);
        }
    }

    #[test]
    fn test_beam_agrees_with_exhaustive() {
        let exhaustive = SearchOptions {
            algorithm: Algorithm::Exhaustive,
            ..SearchOptions::default()
        };
        let beam = SearchOptions {
            algorithm: Algorithm::Beam,
            ..SearchOptions::default()
        };
        let reference =
            find_best_matches(&guizhi_catalog(), &guizhi_target(), &exhaustive).unwrap();
        let beamed = find_best_matches(&guizhi_catalog(), &guizhi_target(), &beam).unwrap();

        // every beam result is one exhaustive would also return
        let reference_keys: FxHashSet<Vec<String>> = reference
            .iter()
            .map(|m| search::membership_key(&m.combination))
            .collect();
        for m in &beamed {
            assert!(reference_keys.contains(&search::membership_key(&m.combination)));
        }
        assert_eq!(beamed[0].combination, reference[0].combination);
        assert_relative_eq!(beamed[0].percentage, reference[0].percentage, epsilon = 1e-6);
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        assert!(matches!(
            "simulated-annealing".parse::<Algorithm>(),
            Err(Error::UnsupportedAlgorithm(_))
        ));
        assert_eq!("beam".parse::<Algorithm>().unwrap(), Algorithm::Beam);
        assert_eq!("exhaustive".parse::<Algorithm>().unwrap(), Algorithm::Exhaustive);
    }

    #[test]
    fn test_invalid_parameters_are_rejected() {
        let negative_penalty = SearchOptions {
            penalty_factor: -1.0,
            ..SearchOptions::default()
        };
        assert!(matches!(
            find_best_matches(&guizhi_catalog(), &guizhi_target(), &negative_penalty),
            Err(Error::InvalidParameter(_))
        ));

        let zero_width = SearchOptions {
            beam_width_factor: 0.0,
            ..SearchOptions::default()
        };
        assert!(zero_width.validate().is_err());

        let inverted_bounds = SearchOptions {
            min_cformula_dose: 10.0,
            max_cformula_dose: 1.0,
            ..SearchOptions::default()
        };
        assert!(inverted_bounds.validate().is_err());
    }

    #[test]
    fn test_empty_target_yields_nothing() {
        let options = SearchOptions {
            algorithm: Algorithm::Exhaustive,
            ..SearchOptions::default()
        };
        let matches =
            find_best_matches(&guizhi_catalog(), &Composition::default(), &options).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_random_targets_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        let herbs = ["桂枝", "白芍", "生薑", "大棗", "炙甘草", "麻黃", "杏仁"];

        for _ in 0..10 {
            let mut entries = Catalog::default();
            for index in 0..6 {
                let mut recipe = Composition::default();
                let span = rng.gen_range(2..=4);
                let offset = rng.gen_range(0..herbs.len());
                for position in 0..span {
                    let herb = herbs[(offset + position) % herbs.len()];
                    recipe.insert(herb.to_owned(), (rng.gen_range(1..=12) as f64) / 10.0);
                }
                entries.insert(format!("方{index}"), recipe);
            }

            // the target is a reachable dose of one catalog recipe
            let picked = rng.gen_range(0..entries.len());
            let scale = (rng.gen_range(15..=300) as f64) / 10.0;
            let target: Composition = entries[picked]
                .iter()
                .map(|(herb, &amount)| (herb.clone(), amount * scale))
                .collect();

            let options = SearchOptions {
                algorithm: Algorithm::Exhaustive,
                max_sformulas: 0,
                ..SearchOptions::default()
            };
            let matches = find_best_matches(&entries, &target, &options).unwrap();

            assert!(!matches.is_empty());
            assert!(matches[0].percentage > 99.9);
            for window in matches.windows(2) {
                assert!(window[0].percentage >= window[1].percentage);
            }
            for m in &matches {
                assert_eq!(m.combination.len(), m.dosages.len());
                assert!(m.percentage <= 100.0 + 1e-9);
            }
        }
    }
}
