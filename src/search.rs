//! The per-query search: catalog views, the caching evaluator, the two
//! combination strategies, the single-recipe supplement and top-N selection.

use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use log::debug;
use once_cell::unsync::OnceCell;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::beam;
use crate::catalog::{amount_of, combine};
use crate::error::{Error, Result};
use crate::score::{match_ratio, round_to_places, variance, ResidualSystem};
use crate::solve::{self, DoseRange};
use crate::{Catalog, Combination, Composition, Dosages, Herb, RecipeKey};

/// Search strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Layered best-first expansion with a heuristic pre-filter. Fast, and
    /// close to exhaustive in practice, but a heuristic all the same.
    Beam,
    /// Every subset of complex recipes up to `max_cformulas`. The
    /// correctness oracle; slow on large catalogs.
    Exhaustive,
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "beam" => Ok(Algorithm::Beam),
            "exhaustive" => Ok(Algorithm::Exhaustive),
            _ => Err(Error::UnsupportedAlgorithm(value.to_owned())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Algorithm::Beam => "beam",
            Algorithm::Exhaustive => "exhaustive",
        })
    }
}

/// All knobs of one query. `Default` carries the documented defaults; call
/// `validate` before searching with hand-built values.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum number of results returned.
    pub top_n: usize,
    /// Recipes forbidden from appearing anywhere in a combination.
    pub excludes: FxHashSet<RecipeKey>,
    /// Maximum complex recipes per combination.
    pub max_cformulas: usize,
    /// Maximum single recipes appended by the supplement stage.
    pub max_sformulas: usize,
    /// Weight of herbs a combination brings in beyond the target.
    pub penalty_factor: f64,
    pub algorithm: Algorithm,
    /// Beam width is `max(ceil(beam_width_factor * top_n), 1)`.
    pub beam_width_factor: f64,
    /// Heuristic pool size is `ceil(beam_width * beam_multiplier)`;
    /// zero disables the heuristic and scores every candidate exactly.
    pub beam_multiplier: f64,
    /// Cumulative share of the remaining target that counts as its main
    /// herbs when the heuristic pool ranks candidate recipes.
    pub main_herb_threshold: f64,
    pub min_cformula_dose: f64,
    pub max_cformula_dose: f64,
    pub min_sformula_dose: f64,
    pub max_sformula_dose: f64,
    /// Decimal places at which dosages and remainders are zero-tested.
    pub places: u32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            top_n: 5,
            excludes: FxHashSet::default(),
            max_cformulas: 2,
            max_sformulas: 2,
            penalty_factor: 2.0,
            algorithm: Algorithm::Beam,
            beam_width_factor: 2.0,
            beam_multiplier: 3.0,
            main_herb_threshold: 0.6,
            min_cformula_dose: 1.0,
            max_cformula_dose: 50.0,
            min_sformula_dose: 0.3,
            max_sformula_dose: 50.0,
            places: 1,
        }
    }
}

impl SearchOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.penalty_factor >= 0.0) {
            return Err(Error::InvalidParameter(format!(
                "penalty_factor must be >= 0, got {}",
                self.penalty_factor
            )));
        }
        if !(self.beam_width_factor > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "beam_width_factor must be > 0, got {}",
                self.beam_width_factor
            )));
        }
        if !(self.beam_multiplier >= 0.0) {
            return Err(Error::InvalidParameter(format!(
                "beam_multiplier must be >= 0, got {}",
                self.beam_multiplier
            )));
        }
        if !(self.main_herb_threshold > 0.0 && self.main_herb_threshold <= 1.0) {
            return Err(Error::InvalidParameter(format!(
                "main_herb_threshold must be in (0, 1], got {}",
                self.main_herb_threshold
            )));
        }
        for (name, min, max) in [
            ("cformula_dose", self.min_cformula_dose, self.max_cformula_dose),
            ("sformula_dose", self.min_sformula_dose, self.max_sformula_dose),
        ] {
            if !(min > 0.0 && max >= min) {
                return Err(Error::InvalidParameter(format!(
                    "{name} bounds must satisfy 0 < min <= max, got {min}..{max}"
                )));
            }
        }
        Ok(())
    }
}

/// One scored result: a combination, its optimized dosages and the match
/// percentage (at most 100, unbounded below).
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub percentage: f64,
    pub combination: Combination,
    pub dosages: Dosages,
}

/// An evaluated combination flowing between pipeline stages.
#[derive(Debug, Clone)]
pub(crate) struct Evaluation {
    pub combination: Combination,
    pub dosages: Dosages,
    pub percentage: f64,
}

/// Order-independent cache and de-dup key of a combination.
pub(crate) fn membership_key(combination: &[RecipeKey]) -> Vec<RecipeKey> {
    let mut key = combination.to_vec();
    key.sort_unstable();
    key
}

/// A strategy produces the evaluated complex combinations the supplement
/// stage then extends.
trait Strategy {
    fn name(&self) -> &'static str;
    fn expand(&self, searcher: &Searcher) -> Vec<Evaluation>;
}

struct ExhaustiveStrategy;

impl Strategy for ExhaustiveStrategy {
    fn name(&self) -> &'static str {
        "exhaustive"
    }

    fn expand(&self, searcher: &Searcher) -> Vec<Evaluation> {
        searcher
            .complex_combinations()
            .filter_map(|combination| searcher.evaluate(combination, None))
            .collect()
    }
}

struct BeamStrategy;

impl Strategy for BeamStrategy {
    fn name(&self) -> &'static str {
        "beam"
    }

    fn expand(&self, searcher: &Searcher) -> Vec<Evaluation> {
        beam::run(searcher)
    }
}

/// One query against one catalog. Holds the lazily derived catalog views
/// and the evaluation cache; both live exactly as long as the query.
pub struct Searcher<'a> {
    catalog: &'a Catalog,
    target: &'a Composition,
    options: &'a SearchOptions,
    cformulas: OnceCell<Vec<RecipeKey>>,
    sformulas: OnceCell<Vec<RecipeKey>>,
    herb_sformulas: OnceCell<FxHashMap<Herb, Vec<RecipeKey>>>,
    variance: OnceCell<f64>,
    beam_width: OnceCell<usize>,
    cache: RefCell<FxHashMap<Vec<RecipeKey>, Option<Evaluation>>>,
}

impl<'a> Searcher<'a> {
    pub fn new(catalog: &'a Catalog, target: &'a Composition, options: &'a SearchOptions) -> Self {
        Searcher {
            catalog,
            target,
            options,
            cformulas: OnceCell::new(),
            sformulas: OnceCell::new(),
            herb_sformulas: OnceCell::new(),
            variance: OnceCell::new(),
            beam_width: OnceCell::new(),
            cache: RefCell::new(FxHashMap::default()),
        }
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        self.catalog
    }

    pub(crate) fn options(&self) -> &SearchOptions {
        self.options
    }

    /// Complex recipes that are not excluded and share a component with
    /// the target, in catalog order.
    pub fn cformulas(&self) -> &[RecipeKey] {
        self.cformulas.get_or_init(|| self.related_formulas(false))
    }

    /// Same filter for single recipes.
    pub fn sformulas(&self) -> &[RecipeKey] {
        self.sformulas.get_or_init(|| self.related_formulas(true))
    }

    fn related_formulas(&self, single: bool) -> Vec<RecipeKey> {
        self.catalog
            .iter()
            .filter(|(key, composition)| {
                (composition.len() == 1) == single
                    && !self.options.excludes.contains(*key)
                    && composition.keys().any(|herb| self.target.contains_key(herb))
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn herb_sformulas(&self) -> &FxHashMap<Herb, Vec<RecipeKey>> {
        self.herb_sformulas.get_or_init(|| {
            let mut by_herb: FxHashMap<Herb, Vec<RecipeKey>> = FxHashMap::default();
            for key in self.sformulas() {
                if let Some(herb) = self.catalog[key].keys().next() {
                    by_herb.entry(herb.clone()).or_default().push(key.clone());
                }
            }
            by_herb
        })
    }

    /// L2 norm of the target, the normalizer of every match ratio.
    pub fn variance(&self) -> f64 {
        *self.variance.get_or_init(|| variance(self.target))
    }

    pub(crate) fn beam_width(&self) -> usize {
        *self.beam_width.get_or_init(|| {
            ((self.options.beam_width_factor * self.options.top_n as f64).ceil() as usize).max(1)
        })
    }

    fn ftol(&self) -> f64 {
        10f64.powi(-(self.options.places as i32) - 2)
    }

    fn dose_range(&self, key: &RecipeKey) -> DoseRange {
        if self.catalog[key].len() > 1 {
            DoseRange::new(self.options.min_cformula_dose, self.options.max_cformula_dose)
        } else {
            DoseRange::new(self.options.min_sformula_dose, self.options.max_sformula_dose)
        }
    }

    /// Best dosages of one combination under the per-recipe bounds.
    pub(crate) fn find_best_dosages(
        &self,
        combination: &[RecipeKey],
        initial: Option<&[f64]>,
    ) -> Result<(Dosages, f64)> {
        let system = ResidualSystem::build(
            self.catalog,
            combination,
            self.target,
            self.options.penalty_factor,
        );
        let ranges: Vec<DoseRange> = combination.iter().map(|key| self.dose_range(key)).collect();
        let ones = vec![1.0; combination.len()];
        let initial = initial.unwrap_or(&ones);
        solve::minimize(&system, &ranges, initial, self.ftol())
    }

    /// Evaluate a combination: optimize its dosages, strip members whose
    /// dosage rounds to zero and re-optimize until stable, then score the
    /// result. Memoized (failures included) by unordered membership.
    pub(crate) fn evaluate(
        &self,
        combination: Combination,
        initial: Option<Dosages>,
    ) -> Option<Evaluation> {
        let key = membership_key(&combination);
        if let Some(hit) = self.cache.borrow().get(&key) {
            return hit.clone();
        }
        let evaluation = self.evaluate_uncached(combination, initial);
        self.cache.borrow_mut().insert(key, evaluation.clone());
        evaluation
    }

    fn evaluate_uncached(
        &self,
        mut combination: Combination,
        initial: Option<Dosages>,
    ) -> Option<Evaluation> {
        let mut guess = initial;
        loop {
            let (dosages, delta) =
                match self.find_best_dosages(&combination, guess.as_deref()) {
                    Ok(solution) => solution,
                    Err(_) => {
                        debug!("skipping {combination:?}: dosage solver did not converge");
                        return None;
                    }
                };
            let rounded: Dosages = dosages
                .iter()
                .map(|&dosage| round_to_places(dosage, self.options.places))
                .collect();

            if rounded.iter().any(|&dosage| dosage == 0.0) {
                let mut survivors = Combination::new();
                let mut surviving_dosages = Dosages::new();
                for (index, key) in combination.into_iter().enumerate() {
                    if rounded[index] != 0.0 {
                        survivors.push(key);
                        surviving_dosages.push(dosages[index]);
                    }
                }
                combination = survivors;
                guess = Some(surviving_dosages);
                continue;
            }

            let percentage = 100.0 * match_ratio(delta, self.variance());
            debug!("evaluated {combination:?} {rounded:?}: {delta:.3} ({percentage:.2}%)");
            return Some(Evaluation { combination, dosages: rounded, percentage });
        }
    }

    /// All subsets of the complex view, smallest first, members in catalog
    /// order. Includes the empty combination.
    pub(crate) fn complex_combinations(&self) -> impl Iterator<Item = Combination> {
        let cformulas = self.cformulas().to_vec();
        let largest = self.options.max_cformulas.min(cformulas.len());
        (0..=largest).flat_map(move |size| {
            cformulas.clone().into_iter().combinations(size)
        })
    }

    /// Target herbs the combination leaves uncovered, largest remainder
    /// first; remainders are rounded and zero-tested at `places`.
    pub(crate) fn remaining_composition(
        &self,
        combination: &[RecipeKey],
        dosages: &[f64],
    ) -> Vec<(Herb, f64)> {
        let combined = combine(self.catalog, combination, dosages);
        let mut remaining: Vec<(Herb, f64)> = self
            .target
            .iter()
            .filter_map(|(herb, &amount)| {
                let left = round_to_places(amount - amount_of(&combined, herb), self.options.places);
                (left > 0.0).then(|| (herb.clone(), left))
            })
            .collect();
        remaining.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        remaining
    }

    /// Extend an evaluated combination with single recipes covering its
    /// largest remainders, one herb per depth, deepest extensions only.
    /// The unextendable combination comes back as-is (unless empty).
    pub(crate) fn supplement_combinations(
        &self,
        combination: &[RecipeKey],
        dosages: &[f64],
    ) -> Vec<Combination> {
        let candidate_herbs: Vec<Herb> = self
            .remaining_composition(combination, dosages)
            .into_iter()
            .map(|(herb, _)| herb)
            .filter(|herb| self.herb_sformulas().contains_key(herb))
            .collect();

        let mut extended = Vec::new();
        if candidate_herbs.is_empty() {
            extended.push(combination.to_vec());
        } else {
            let mut path = combination.to_vec();
            self.supplement_step(&candidate_herbs, 0, &mut path, &mut extended);
        }
        extended.retain(|combination| !combination.is_empty());
        extended
    }

    fn supplement_step(
        &self,
        candidate_herbs: &[Herb],
        depth: usize,
        path: &mut Combination,
        out: &mut Vec<Combination>,
    ) {
        if depth == self.options.max_sformulas || depth == candidate_herbs.len() {
            out.push(path.clone());
            return;
        }
        for key in &self.herb_sformulas()[&candidate_herbs[depth]] {
            path.push(key.clone());
            self.supplement_step(candidate_herbs, depth + 1, path, out);
            path.pop();
        }
    }

    /// Run the configured strategy, supplement every produced combination,
    /// de-duplicate by unordered membership and keep the `top_n` best.
    pub fn find_best_matches(&self) -> Vec<Match> {
        let strategy: &dyn Strategy = match self.options.algorithm {
            Algorithm::Beam => &BeamStrategy,
            Algorithm::Exhaustive => &ExhaustiveStrategy,
        };
        debug!(
            "searching with the {} strategy over {} complex and {} single recipes",
            strategy.name(),
            self.cformulas().len(),
            self.sformulas().len(),
        );

        let mut seen: FxHashSet<Vec<RecipeKey>> = FxHashSet::default();
        let mut matches: Vec<Match> = Vec::new();
        let mut offer = |evaluation: Evaluation| {
            if evaluation.combination.is_empty() {
                return;
            }
            if !seen.insert(membership_key(&evaluation.combination)) {
                return;
            }
            matches.push(Match {
                percentage: evaluation.percentage,
                combination: evaluation.combination,
                dosages: evaluation.dosages,
            });
        };

        for produced in strategy.expand(self) {
            let supplements =
                self.supplement_combinations(&produced.combination, &produced.dosages);
            let produced_len = produced.combination.len();
            offer(produced);
            for combination in supplements {
                if combination.len() == produced_len {
                    continue;
                }
                if let Some(evaluation) = self.evaluate(combination, None) {
                    offer(evaluation);
                }
            }
        }

        matches.sort_by(|a, b| {
            b.percentage.partial_cmp(&a.percentage).unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(self.options.top_n);
        matches
    }
}
