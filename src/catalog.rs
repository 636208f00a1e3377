//! Catalog ingestion: YAML and CSV loaders plus composition helpers.
//!
//! The search core consumes a `Catalog` already normalized to unit dosages;
//! everything here is the edge that produces one. Entry order is preserved,
//! it is part of the determinism contract of the search.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::warn;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::{Catalog, Composition, Herb, RecipeKey};

/// One recipe entry of a YAML catalog file. Vendor metadata and other
/// unknown fields are accepted and ignored.
#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    key: RecipeKey,
    #[serde(default = "default_unit_dosage")]
    unit_dosage: f64,
    composition: Composition,
}

fn default_unit_dosage() -> f64 {
    1.0
}

/// Load a catalog from a YAML sequence of recipe entries.
///
/// Each composition is divided by the entry's `unit_dosage` so that
/// dosage x composition gives contributed amounts. An entry reusing an
/// already-seen key is dropped with a warning.
pub fn load_yaml<R: Read>(reader: R) -> Result<Catalog> {
    let entries: Vec<CatalogEntry> = serde_yaml::from_reader(reader)?;

    let mut catalog = Catalog::default();
    for entry in entries {
        if catalog.contains_key(&entry.key) {
            warn!("{:?} uses a duplicated key {:?}, ignored", entry.name, entry.key);
            continue;
        }
        let composition = entry
            .composition
            .into_iter()
            .map(|(herb, amount)| (herb, amount / entry.unit_dosage))
            .collect();
        catalog.insert(entry.key, composition);
    }
    Ok(catalog)
}

/// Load a catalog from headerless CSV rows of the form
/// `key,herb:amount,herb:amount,…`. Amounts are taken as already unit-dosed.
pub fn load_csv<R: Read>(reader: R) -> Result<Catalog> {
    let csvr = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_reader(reader);

    let mut catalog = Catalog::default();
    for record in csvr.into_records() {
        let record = record?;
        let mut fields = record.iter();
        let key = match fields.next() {
            Some(key) if !key.is_empty() => key.to_owned(),
            _ => continue,
        };
        if catalog.contains_key(&key) {
            warn!("{:?} uses a duplicated key, ignored", key);
            continue;
        }
        let mut composition = Composition::default();
        for field in fields {
            let (herb, amount) = parse_dosed(field)?;
            composition.insert(herb, amount);
        }
        catalog.insert(key, composition);
    }
    Ok(catalog)
}

/// Load a catalog file, picking the format from the extension.
pub fn load(path: &Path) -> Result<Catalog> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let reader = BufReader::new(File::open(path)?);
    match extension.as_str() {
        "yaml" | "yml" => load_yaml(reader),
        "csv" => load_csv(reader),
        other => Err(Error::UnknownFormat(other.to_owned())),
    }
}

/// Parse a `NAME:AMOUNT` field, as used by CSV rows and the CLI.
pub fn parse_dosed(value: &str) -> Result<(String, f64)> {
    let (name, amount) = value
        .split_once(':')
        .ok_or_else(|| Error::Entry(format!("expected NAME:AMOUNT, got {value:?}")))?;
    let amount: f64 = amount
        .trim()
        .parse()
        .map_err(|_| Error::Entry(format!("bad amount in {value:?}")))?;
    Ok((name.trim().to_owned(), amount))
}

/// Sum the dose-weighted compositions of the combination's members.
pub fn combine(catalog: &Catalog, combination: &[RecipeKey], dosages: &[f64]) -> Composition {
    let mut combined = Composition::default();
    for (key, &dosage) in combination.iter().zip(dosages) {
        for (herb, amount) in &catalog[key] {
            *combined.entry(herb.clone()).or_insert(0.0) += dosage * amount;
        }
    }
    combined
}

/// The amount of `herb` in `composition`, zero when absent.
pub fn amount_of(composition: &Composition, herb: &Herb) -> f64 {
    composition.get(herb).copied().unwrap_or(0.0)
}
