use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::{Parser, Subcommand};
use formulamatch::{
    catalog, find_best_matches, Algorithm, Catalog, Composition, Match, SearchOptions,
};
use rustc_hash::FxHashSet;

/// Formula Matcher - Find catalog combinations approximating a composition
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Show debug and progress information
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Generate markdown documentation (hidden)
    #[arg(long, hide = true)]
    markdown_help: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for alternative recipe combinations
    #[command(visible_alias = "s")]
    Search(SearchArgs),
    /// List catalog recipes or their herbs
    #[command(visible_alias = "l")]
    List(ListArgs),
}

#[derive(clap::Args, Debug)]
struct SearchArgs {
    /// Catalog items and dosages to reproduce, e.g. '桂枝湯:6.0 桂枝:1.0'
    #[arg(value_name = "NAME:DOSE", value_parser = parse_item, required = true)]
    items: Vec<(String, f64)>,

    /// Treat each NAME:DOSE as a raw herb amount instead of a catalog item
    #[arg(short, long)]
    raw: bool,

    /// Exclude a catalog recipe from evaluation and output; repeatable.
    /// Complex recipes named in NAME:DOSE are excluded automatically
    #[arg(short = 'e', long = "exclude", value_name = "NAME")]
    excludes: Vec<String>,

    /// Maximum complex recipes per combination
    #[arg(long = "mc", alias = "max-cformulas", value_name = "N", default_value_t = 2)]
    max_cformulas: usize,

    /// Maximum single recipes appended per combination
    #[arg(long = "ms", alias = "max-sformulas", value_name = "N", default_value_t = 2)]
    max_sformulas: usize,

    /// Penalty factor for herbs outside the target
    #[arg(short, long, value_name = "FACTOR", default_value_t = 2.0)]
    penalty: f64,

    /// Number of best matches to output
    #[arg(short, long, value_name = "N", default_value_t = 5)]
    num: usize,

    /// Catalog file (.yaml or .csv)
    #[arg(short, long, value_name = "FILE", default_value = "catalog.yaml")]
    database: PathBuf,

    /// Search algorithm: beam (fast, may miss combinations) or
    /// exhaustive (complete, slow on large catalogs)
    #[arg(short, long, value_name = "ALGORITHM", default_value = "beam")]
    algorithm: String,

    /// Beam width as a multiple of the output count
    #[arg(
        long = "bwf",
        alias = "beam-width-factor",
        value_name = "FACTOR",
        default_value_t = 2.0
    )]
    beam_width_factor: f64,

    /// Heuristic pool size as a multiple of the beam width; 0 skips the
    /// heuristic and scores every candidate exactly
    #[arg(
        long = "bm",
        alias = "beam-multiplier",
        value_name = "FACTOR",
        default_value_t = 3.0
    )]
    beam_multiplier: f64,
}

#[derive(clap::Args, Debug)]
struct ListArgs {
    /// Keyword fragments a listed name must contain, e.g. '苓 桂'
    #[arg(value_name = "KEYWORD")]
    keywords: Vec<String>,

    /// List the distinct herbs instead of the recipe keys
    #[arg(short, long)]
    raw: bool,

    /// Match any keyword instead of all of them
    #[arg(long)]
    any: bool,

    /// Catalog file (.yaml or .csv)
    #[arg(short, long, value_name = "FILE", default_value = "catalog.yaml")]
    database: PathBuf,
}

fn parse_item(value: &str) -> Result<(String, f64), String> {
    catalog::parse_dosed(value).map_err(|err| err.to_string())
}

fn main() {
    let cli = Cli::parse();

    // Generate markdown documentation if requested
    if cli.markdown_help {
        clap_markdown::print_help_markdown::<Cli>();
        return;
    }

    pretty_env_logger::formatted_builder()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match cli.command {
        Some(Command::Search(args)) => run_search(&args),
        Some(Command::List(args)) => run_list(&args),
        None => {
            eprintln!("Error: missing subcommand, see --help");
            process::exit(1);
        }
    }
}

fn load_catalog(path: &Path) -> Catalog {
    match catalog::load(path) {
        Ok(catalog) => catalog,
        Err(err) => {
            eprintln!("Error: cannot load catalog file {}: {err}", path.display());
            process::exit(1);
        }
    }
}

fn run_search(args: &SearchArgs) {
    let catalog = load_catalog(&args.database);
    let algorithm: Algorithm = match args.algorithm.parse() {
        Ok(algorithm) => algorithm,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };

    let mut excludes: FxHashSet<String> = args.excludes.iter().cloned().collect();
    let mut target = Composition::default();
    let mut unknowns: Vec<&str> = Vec::new();

    if args.raw {
        let all_herbs: FxHashSet<&str> = catalog
            .values()
            .flat_map(|composition| composition.keys())
            .map(String::as_str)
            .collect();
        for (herb, amount) in &args.items {
            if all_herbs.contains(herb.as_str()) {
                *target.entry(herb.clone()).or_insert(0.0) += amount;
            } else if !unknowns.contains(&herb.as_str()) {
                unknowns.push(herb.as_str());
            }
        }
        if !unknowns.is_empty() {
            eprintln!("Error: the catalog covers no recipe for: {}", unknowns.join(", "));
            process::exit(1);
        }
    } else {
        for (item, dosage) in &args.items {
            match catalog.get(item) {
                Some(composition) => {
                    // a complex input is what we search alternatives FOR
                    if composition.len() > 1 {
                        excludes.insert(item.clone());
                    }
                    for (herb, amount) in composition {
                        *target.entry(herb.clone()).or_insert(0.0) += dosage * amount;
                    }
                }
                None => {
                    if !unknowns.contains(&item.as_str()) {
                        unknowns.push(item.as_str());
                    }
                }
            }
        }
        if !unknowns.is_empty() {
            eprintln!("Error: the catalog has no item named: {}", unknowns.join(", "));
            process::exit(1);
        }
    }

    println!("Target composition:");
    for (herb, amount) in &target {
        println!("    {herb}: {amount:.2}");
    }
    println!();
    println!("Catalog items: {}", catalog.len());
    println!();

    let options = SearchOptions {
        top_n: args.num,
        excludes,
        max_cformulas: args.max_cformulas,
        max_sformulas: args.max_sformulas,
        penalty_factor: args.penalty,
        algorithm,
        beam_width_factor: args.beam_width_factor,
        beam_multiplier: args.beam_multiplier,
        ..SearchOptions::default()
    };

    let start = Instant::now();
    let matches = match find_best_matches(&catalog, &target, &options) {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };
    println!("Search took: {}ms", start.elapsed().as_millis());
    println!();

    for m in &matches {
        print_match(&catalog, &target, m);
    }
}

fn print_match(catalog: &Catalog, target: &Composition, m: &Match) {
    let combined = catalog::combine(catalog, &m.combination, &m.dosages);

    let listing = m
        .combination
        .iter()
        .zip(&m.dosages)
        .map(|(key, dosage)| format!("{key}:{dosage:.1}"))
        .collect::<Vec<_>>()
        .join(" ");
    let total: f64 = m.dosages.iter().sum();
    println!(
        "Match: {:.2}%, combination: {listing} (total: {total:.1})",
        m.percentage
    );

    // target herbs first, each group alphabetically
    let mut herbs: Vec<(&String, f64)> = combined.iter().map(|(herb, &a)| (herb, a)).collect();
    herbs.sort_by_key(|&(herb, _)| (!target.contains_key(herb), herb.clone()));
    for (herb, amount) in &herbs {
        if target.contains_key(*herb) {
            println!("    **{herb}**: {amount:.2}");
        } else {
            println!("    {herb}: {amount:.2}");
        }
    }

    let mut missing: Vec<(&String, f64)> = Vec::new();
    for (herb, &amount) in target {
        if amount > 0.0 && catalog::amount_of(&combined, herb) == 0.0 {
            missing.push((herb, amount));
        }
    }
    if !missing.is_empty() {
        println!("Missing herbs:");
        for (herb, amount) in missing {
            println!("    {herb}: {amount:.2}");
        }
    }
    println!();
}

fn run_list(args: &ListArgs) {
    let catalog = load_catalog(&args.database);

    let mut names: Vec<String> = if args.raw {
        let mut herbs: Vec<String> = catalog
            .values()
            .flat_map(|composition| composition.keys().cloned())
            .collect();
        herbs.sort_unstable();
        herbs.dedup();
        herbs
    } else {
        let mut keys: Vec<String> = catalog.keys().cloned().collect();
        keys.sort_unstable();
        keys
    };

    if !args.keywords.is_empty() {
        names.retain(|name| {
            let mut hits = args.keywords.iter().map(|keyword| name.contains(keyword.as_str()));
            if args.any {
                hits.any(|hit| hit)
            } else {
                hits.all(|hit| hit)
            }
        });
    }
    for name in names {
        println!("{name}");
    }
}
