//! Layered beam expansion over the complex recipes.
//!
//! Each layer carries every surviving candidate forward unchanged and also
//! extends it by one more complex recipe, keeping only the `beam_width`
//! best between layers. Before extending, candidates are pre-filtered by a
//! cheap heuristic: rank the still-uncovered target herbs, call the prefix
//! holding `main_herb_threshold` of the remaining weight the main herbs,
//! and keep the recipes that concentrate most of their own weight there.

use log::debug;
use rustc_hash::FxHashSet;

use crate::search::{membership_key, Evaluation, Searcher};
use crate::{Combination, Dosages, Herb, RecipeKey};

pub(crate) fn run(searcher: &Searcher) -> Vec<Evaluation> {
    let width = searcher.beam_width();
    let depths = searcher.options().max_cformulas;
    let mut frontier = vec![Evaluation {
        combination: Combination::new(),
        dosages: Dosages::new(),
        percentage: 100.0,
    }];

    for depth in 0..depths {
        let mut layer: Vec<Evaluation> = Vec::new();
        let mut seen: FxHashSet<Vec<RecipeKey>> = FxHashSet::default();

        for candidate in &frontier {
            if seen.insert(membership_key(&candidate.combination)) {
                layer.push(candidate.clone());
            }
            for key in pool(searcher, candidate) {
                let mut combination = candidate.combination.clone();
                combination.push(key);
                if !seen.insert(membership_key(&combination)) {
                    continue;
                }
                let mut guess = candidate.dosages.clone();
                guess.push(1.0);
                if let Some(extension) = searcher.evaluate(combination, Some(guess)) {
                    layer.push(extension);
                }
            }
        }

        // intermediate layers are pruned; the last one is forwarded whole
        if depth + 1 < depths {
            layer.sort_by(|a, b| {
                b.percentage.partial_cmp(&a.percentage).unwrap_or(std::cmp::Ordering::Equal)
            });
            layer.truncate(width);
        }
        debug!("beam layer {} holds {} candidates", depth + 1, layer.len());
        frontier = layer;
    }
    frontier
}

/// The complex recipes worth extending `candidate` with. With a zero
/// multiplier the heuristic is bypassed and every non-member qualifies.
fn pool(searcher: &Searcher, candidate: &Evaluation) -> Vec<RecipeKey> {
    let members: FxHashSet<&RecipeKey> = candidate.combination.iter().collect();
    let open: Vec<RecipeKey> = searcher
        .cformulas()
        .iter()
        .filter(|key| !members.contains(key))
        .cloned()
        .collect();

    let multiplier = searcher.options().beam_multiplier;
    if multiplier == 0.0 {
        return open;
    }

    let remaining =
        searcher.remaining_composition(&candidate.combination, &candidate.dosages);
    if remaining.is_empty() {
        // nothing left to cover, an extension can only add off-target mass
        return Vec::new();
    }
    let main_herbs = main_herbs(&remaining, searcher.options().main_herb_threshold);

    let limit = ((searcher.beam_width() as f64 * multiplier).ceil() as usize).max(1);
    let mut scored: Vec<(f64, RecipeKey)> = open
        .into_iter()
        .map(|key| (main_herb_share(searcher, &key, &main_herbs), key))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored.into_iter().map(|(_, key)| key).collect()
}

/// Minimal prefix of the descending remainders whose cumulative weight
/// reaches the threshold share of the total.
fn main_herbs(remaining: &[(Herb, f64)], threshold: f64) -> FxHashSet<&str> {
    let total: f64 = remaining.iter().map(|(_, amount)| amount).sum();
    let mut prefix = FxHashSet::default();
    let mut cumulative = 0.0;
    for (herb, amount) in remaining {
        prefix.insert(herb.as_str());
        cumulative += amount;
        if cumulative / total >= threshold {
            break;
        }
    }
    prefix
}

/// Share of the recipe's total content that falls on the main herbs.
fn main_herb_share(searcher: &Searcher, key: &RecipeKey, main_herbs: &FxHashSet<&str>) -> f64 {
    let composition = &searcher.catalog()[key];
    let total: f64 = composition.values().sum();
    if total == 0.0 {
        return 0.0;
    }
    let covered: f64 = composition
        .iter()
        .filter(|(herb, _)| main_herbs.contains(herb.as_str()))
        .map(|(_, &amount)| amount)
        .sum();
    covered / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchOptions;
    use crate::{Catalog, Composition};

    fn composition(pairs: &[(&str, f64)]) -> Composition {
        pairs.iter().map(|&(herb, amount)| (herb.to_owned(), amount)).collect()
    }

    #[test]
    fn test_main_herbs_prefix() {
        let remaining = vec![
            ("桂枝".to_owned(), 1.2),
            ("白芍".to_owned(), 1.2),
            ("生薑".to_owned(), 1.0),
        ];
        // 1.2 / 3.4 < 0.6 but (1.2 + 1.2) / 3.4 >= 0.6
        let prefix = main_herbs(&remaining, 0.6);
        assert!(prefix.contains("桂枝"));
        assert!(prefix.contains("白芍"));
        assert!(!prefix.contains("生薑"));

        // a tiny threshold keeps only the heaviest remainder
        let prefix = main_herbs(&remaining, 0.1);
        assert_eq!(prefix.len(), 1);
        assert!(prefix.contains("桂枝"));
    }

    #[test]
    fn test_pool_ranks_by_main_herb_share() {
        let mut catalog = Catalog::default();
        catalog.insert(
            "麻黃湯".to_owned(),
            composition(&[("麻黃", 0.9), ("桂枝", 0.6), ("炙甘草", 0.3), ("杏仁", 0.5)]),
        );
        catalog.insert(
            "桂枝甘草湯".to_owned(),
            composition(&[("桂枝", 0.8), ("炙甘草", 0.6)]),
        );
        let target = composition(&[("桂枝", 2.0), ("炙甘草", 0.4)]);
        let options = SearchOptions {
            top_n: 1,
            beam_width_factor: 1.0,
            beam_multiplier: 1.0,
            ..SearchOptions::default()
        };
        let searcher = Searcher::new(&catalog, &target, &options);

        // pool size is 1, and 桂枝甘草湯 concentrates all of its weight on
        // the main herb while 麻黃湯 spreads most of its own elsewhere
        let start = Evaluation {
            combination: Combination::new(),
            dosages: Dosages::new(),
            percentage: 100.0,
        };
        assert_eq!(pool(&searcher, &start), vec!["桂枝甘草湯".to_owned()]);
    }

    #[test]
    fn test_pool_zero_multiplier_keeps_everything() {
        let mut catalog = Catalog::default();
        catalog.insert(
            "麻黃湯".to_owned(),
            composition(&[("麻黃", 0.9), ("桂枝", 0.6), ("炙甘草", 0.3), ("杏仁", 0.5)]),
        );
        catalog.insert(
            "桂枝甘草湯".to_owned(),
            composition(&[("桂枝", 0.8), ("炙甘草", 0.6)]),
        );
        let target = composition(&[("桂枝", 2.0), ("炙甘草", 0.4)]);
        let options = SearchOptions {
            top_n: 1,
            beam_width_factor: 1.0,
            beam_multiplier: 0.0,
            ..SearchOptions::default()
        };
        let searcher = Searcher::new(&catalog, &target, &options);

        let start = Evaluation {
            combination: Combination::new(),
            dosages: Dosages::new(),
            percentage: 100.0,
        };
        assert_eq!(
            pool(&searcher, &start),
            vec!["麻黃湯".to_owned(), "桂枝甘草湯".to_owned()]
        );
    }
}
