use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use saber::blocks::{BlockFactory, CentralBlockType, SeedStream};
use saber::config::{self, block_name, ErrorCovarianceParameters, ToolboxConfig, TrainingConfig};
use saber::error::SaberResult;
use saber::field::{FieldSet, FieldSet4D};
use saber::generic::{Hybrid, HybridParameters};
use saber::geometry::Geometry;
use saber::gmresr::GmresrOutcome;
use saber::io::{self, NormWriter};
use saber::logging;
use saber::training::{TrainingDriver, TrainingReport};
use saber::variables::Variables;
use saber::verification::TestRecord;
use saber::{ErrorCovariance, VERSION};

const SCHEMA_VERSION: &str = "1.0.0";
const PROGRAM_ID: &str = "SABER";

#[derive(Parser, Debug)]
#[command(name = "saber")]
#[command(version)]
#[command(about = "SABER - background error covariance block chains")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Output path (norm report or training report)
    #[arg(short, long, global = true)]
    out: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build B, run its tests, apply it to Dirac points and draw samples
    Toolbox {
        /// Also write a JSON result bundle next to the norm report
        #[arg(long)]
        json: bool,
    },
    /// Run the training driver
    Train {
        /// Write the training report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration file against the registered block schemas
    Validate {
        /// Configuration kind: toolbox or train
        #[arg(long, default_value = "toolbox")]
        kind: String,
    },
    /// List registered blocks and their parameters
    Blocks,
    /// Print version information
    Version,
}

// ============================================================================
// JSON Output Structures
// ============================================================================

#[derive(Serialize)]
struct Manifest {
    schema_version: String,
    saber_version: String,
    program_id: String,
    timestamp_utc: String,
    platform: String,
    config_hash: String,
}

#[derive(Serialize)]
struct NormEntry {
    label: String,
    index: usize,
    norm: f64,
}

#[derive(Serialize)]
struct ToolboxSummary {
    components: usize,
    time_slots: usize,
    tests: Vec<TestRecord>,
    dirac: Vec<NormEntry>,
    randomization: Vec<NormEntry>,
    inverse: Option<GmresrOutcome>,
    wall_time_ms: f64,
}

#[derive(Serialize)]
struct ToolboxBundle {
    manifest: Manifest,
    summary: ToolboxSummary,
    config_snapshot: ToolboxConfig,
}

#[derive(Serialize)]
struct TrainingBundle {
    manifest: Manifest,
    report: TrainingReport,
    wall_time_ms: f64,
}

// ============================================================================
// Helper Functions
// ============================================================================

fn compute_hash(data: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn get_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days_since_epoch = now / 86400;
    let secs_today = now % 86400;
    let (hours, mins, secs) = (secs_today / 3600, (secs_today % 3600) / 60, secs_today % 60);

    let is_leap = |y: u64| y % 4 == 0 && (y % 100 != 0 || y % 400 == 0);
    let mut year = 1970u64;
    let mut remaining_days = days_since_epoch;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }
    let month_days = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 1u64;
    for &days in &month_days {
        let d = if month == 2 && is_leap(year) { 29 } else { days };
        if remaining_days < d {
            break;
        }
        remaining_days -= d;
        month += 1;
    }
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        remaining_days + 1,
        hours,
        mins,
        secs
    )
}

fn manifest(cfg_text: &str) -> Manifest {
    Manifest {
        schema_version: SCHEMA_VERSION.to_string(),
        saber_version: VERSION.to_string(),
        program_id: PROGRAM_ID.to_string(),
        timestamp_utc: get_timestamp(),
        platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        config_hash: compute_hash(cfg_text),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// `path` for a single slot, `stem.<slot>.ext` otherwise.
fn slot_path(path: &Path, slot: usize, slots: usize) -> PathBuf {
    if slots == 1 {
        return path.to_path_buf();
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{slot}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{slot}"),
    };
    path.with_file_name(name)
}

fn write_increment(path: &Path, x: &FieldSet4D, geometry: &Geometry) -> Result<()> {
    for (it, slot) in x.iter().enumerate() {
        let target = slot_path(path, it, x.len());
        io::write_fieldset(&target, slot, geometry)?;
        eprintln!("[saber] wrote {}", target.display());
    }
    Ok(())
}

fn read_text(cfg_path: &str) -> Result<String> {
    fs::read_to_string(cfg_path).with_context(|| format!("failed to read config: {}", cfg_path))
}

// ============================================================================
// Toolbox
// ============================================================================

fn run_toolbox(cfg: &ToolboxConfig, cfg_text: &str, out_path: &Path, json: bool) -> Result<()> {
    let start = Instant::now();
    let geometry = Geometry::serial(&cfg.geometry)?;
    let vars = geometry.variables_with_levels(&Variables::from_names(&cfg.input_variables));

    let xb = FieldSet4D::new(
        cfg.background
            .states()
            .iter()
            .map(|state| io::read_state(state, &geometry, &vars))
            .collect::<SaberResult<Vec<_>>>()
            .context("failed to read background")?,
    );
    let fg = xb.clone();

    let params = &cfg.background_error;
    let mut covariance = ErrorCovariance::load_config(&geometry, &vars, params)
        .context("failed to load background error inputs")?;
    covariance.seeds = Arc::new(SeedStream::new(cfg.seed));
    let b = ErrorCovariance::from_config(&geometry, &vars, params, covariance, &xb, &fg)
        .context("failed to assemble background error covariance")?;
    eprint!("[saber] {b}");

    let tests = b.verification_records();
    for record in &tests {
        eprintln!("  {record}");
    }

    let mut report = NormWriter::create(out_path)?;
    report.write_header()?;

    let mut dirac = b.zero_increment();
    for point in &cfg.dirac {
        let index = point.iy * cfg.geometry.nx + point.ix;
        for slot in dirac.iter_mut() {
            let field = slot.require_mut(&point.variable)?;
            anyhow::ensure!(
                point.level < field.levels(),
                "dirac level {} outside the {} levels of {}",
                point.level,
                field.levels(),
                point.variable
            );
            field.values_mut()[[index, point.level]] = 1.0;
        }
    }
    let mut dirac_norms = Vec::new();
    if !cfg.dirac.is_empty() {
        let response = b.multiply(&dirac).context("B application to Dirac points failed")?;
        for (it, slot) in response.iter().enumerate() {
            let norm = slot.norm(&geometry)?;
            report.write_row("dirac", "B", it, norm)?;
            dirac_norms.push(NormEntry {
                label: "B".to_string(),
                index: it,
                norm,
            });
        }
        eprintln!(
            "[saber] dirac: {} points, response norm {:.6e}",
            cfg.dirac.len(),
            response.norm(&geometry)?
        );
        if let Some(path) = &cfg.output_dirac {
            write_increment(path, &response, &geometry)?;
        }
    }

    let mut randomization_norms = Vec::new();
    for member in 1..=params.randomization_size {
        let sample = b.randomize().with_context(|| format!("randomization {member} failed"))?;
        let norm = sample.norm(&geometry)?;
        report.write_row("randomization", "B", member, norm)?;
        randomization_norms.push(NormEntry {
            label: "B".to_string(),
            index: member,
            norm,
        });
        if let Some(template) = &cfg.output_randomization {
            let path = PathBuf::from(template.replace("%member%", &member.to_string()));
            write_increment(&path, &sample, &geometry)?;
        }
    }
    if params.randomization_size > 0 {
        let mean = randomization_norms.iter().map(|e| e.norm).sum::<f64>()
            / randomization_norms.len() as f64;
        eprintln!(
            "[saber] randomization: {} samples, mean norm {:.6e}",
            params.randomization_size, mean
        );
    }

    let inverse = if cfg.inverse_multiply {
        let x = FieldSet4D::new(
            (0..b.time_slots() as u64)
                .map(|it| {
                    FieldSet::random(&geometry, b.outer_variables(), cfg.seed.wrapping_add(it))
                })
                .collect(),
        );
        let y = b.multiply(&x)?;
        let (mut x_back, outcome) = b.inverse_multiply(&y)?;
        x_back.sub(&x)?;
        let error = x_back.norm(&geometry)? / x.norm(&geometry)?.max(f64::MIN_POSITIVE);
        report.write_row("inverse", "B", outcome.iterations, error)?;
        eprintln!(
            "[saber] inverse multiply: {} iterations, residual reduction {:.3e}, \
             relative error {:.3e}{}",
            outcome.iterations,
            outcome.reduction(),
            error,
            if outcome.converged { "" } else { " (not converged)" }
        );
        Some(outcome)
    } else {
        None
    };
    report.flush()?;
    eprintln!("[saber] wrote {}", out_path.display());

    let wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    if json {
        let bundle = ToolboxBundle {
            manifest: manifest(cfg_text),
            summary: ToolboxSummary {
                components: b.components().len(),
                time_slots: b.time_slots(),
                tests,
                dirac: dirac_norms,
                randomization: randomization_norms,
                inverse,
                wall_time_ms,
            },
            config_snapshot: cfg.clone(),
        };
        let bundle_path = out_path.with_extension("json");
        write_json(&bundle_path, &bundle)?;
        eprintln!("[saber] wrote {}", bundle_path.display());
    }
    eprintln!("[saber] toolbox done in {:.1} ms", wall_time_ms);
    Ok(())
}

// ============================================================================
// Training
// ============================================================================

fn run_train(
    cfg: TrainingConfig,
    cfg_text: &str,
    out_path: Option<&Path>,
    json: bool,
) -> Result<()> {
    let start = Instant::now();
    let driver = TrainingDriver::new(cfg).context("failed to set up training")?;
    let report = driver.run().context("training failed")?;

    eprintln!(
        "[saber] ensemble 1: {} members, ensemble 2: {} members",
        report.ensemble1_members, report.ensemble2_members
    );
    for output in &report.outputs {
        eprintln!(
            "  {} (component {}): norm {:.12e} -> {}",
            output.parameter,
            output.component,
            output.norm,
            output.file.display()
        );
    }

    if json {
        let path = out_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("results/training.json"));
        let bundle = TrainingBundle {
            manifest: manifest(cfg_text),
            report,
            wall_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        write_json(&path, &bundle)?;
        eprintln!("[saber] wrote {}", path.display());
    }
    Ok(())
}

// ============================================================================
// Validation
// ============================================================================

/// Deserializes every block descriptor against its schema, descending into
/// hybrid components.
fn check_blocks(
    factory: &BlockFactory,
    central: &toml::Table,
    outer: &[toml::Table],
    indent: usize,
) -> Result<()> {
    let pad = " ".repeat(indent);
    for table in outer {
        factory.outer_parameters(table)?;
        eprintln!("{pad}outer: {}", block_name(table, "saber outer blocks")?);
    }
    let name = block_name(central, "saber central block")?;
    factory.central_parameters(central)?;
    eprintln!("{pad}central: {name}");
    if name == Hybrid::NAME {
        let hybrid = HybridParameters::from_table(central)?;
        for (jj, component) in hybrid.components.iter().enumerate() {
            let weight = match (component.weight.value, &component.weight.file) {
                (Some(v), _) => format!("{v}"),
                (None, Some(file)) => file.filepath.display().to_string(),
                (None, None) => "1".to_string(),
            };
            eprintln!("{pad}component {jj} (weight {weight}):");
            check_blocks(
                factory,
                &component.covariance.central,
                &component.covariance.outer,
                indent + 2,
            )?;
        }
    }
    Ok(())
}

fn check_background_error(params: &ErrorCovarianceParameters) -> Result<()> {
    params.validate()?;
    let factory = BlockFactory::global()?;
    eprintln!(
        "  background error: adjoint test={}, inverse test={}, time covariance={}, \
         randomization size={}",
        params.adjoint_test, params.inverse_test, params.time_covariance, params.randomization_size
    );
    check_blocks(factory, &params.central, &params.outer, 4)
}

fn validate_config(cfg_path: &str, kind: &str) -> Result<()> {
    let cfg_text = read_text(cfg_path)?;
    match kind {
        "toolbox" => {
            let cfg: ToolboxConfig = toml::from_str(&cfg_text)
                .with_context(|| format!("failed to parse config: {}", cfg_path))?;
            cfg.validate()?;
            eprintln!("[saber] toolbox config valid: {}", cfg_path);
            eprintln!(
                "  geometry: {}x{}, {} levels, halo {}",
                cfg.geometry.nx, cfg.geometry.ny, cfg.geometry.levels, cfg.geometry.halo
            );
            eprintln!("  input variables: {:?}", cfg.input_variables);
            eprintln!("  time slots: {}", cfg.background.states().len());
            check_background_error(&cfg.background_error)?;
            if !cfg.dirac.is_empty() {
                eprintln!("  dirac points: {}", cfg.dirac.len());
            }
        }
        "train" => {
            let cfg: TrainingConfig = toml::from_str(&cfg_text)
                .with_context(|| format!("failed to parse config: {}", cfg_path))?;
            cfg.validate()?;
            eprintln!("[saber] training config valid: {}", cfg_path);
            eprintln!(
                "  geometry: {}x{}, {} levels",
                cfg.geometry.nx, cfg.geometry.ny, cfg.geometry.levels
            );
            eprintln!("  input variables: {:?}", cfg.input_variables);
            if let Some(source) = cfg.ensembles.source("ensemble")? {
                eprintln!("  ensemble 1: {} members", source.size());
            }
            if let Some(source) = cfg.lowres_keys().source("lowres ensemble")? {
                eprintln!("  ensemble 2: {} members", source.size());
            }
            if let Some(params) = &cfg.background_error {
                check_background_error(params)?;
            }
            for output in &cfg.output {
                eprintln!(
                    "  output: {} - {} -> {}",
                    output.parameter, output.component, output.file
                );
            }
        }
        other => anyhow::bail!("unknown config kind: {} (use 'toolbox' or 'train')", other),
    }
    Ok(())
}

fn list_blocks() -> Result<()> {
    let factory = BlockFactory::global()?;
    for (kind, names) in [
        ("central", factory.central_names()),
        ("outer", factory.outer_names()),
    ] {
        eprintln!("{} blocks:", kind);
        for name in names {
            eprintln!("  {}", name);
            for key in factory.schema(name).unwrap_or_default() {
                let default = key
                    .default
                    .map(|d| format!(" = {d}"))
                    .unwrap_or_default();
                eprintln!(
                    "    {:<26} {:<12} {}{}  {}",
                    format!("\"{}\"", key.name),
                    key.kind.to_string(),
                    if key.required { "required" } else { "optional" },
                    default,
                    key.description
                );
            }
        }
    }
    Ok(())
}

fn print_version() {
    eprintln!("SABER - composable background error covariance block chains");
    eprintln!();
    eprintln!("  Version:         {}", VERSION);
    eprintln!("  Schema Version:  {}", SCHEMA_VERSION);
    eprintln!("  Platform:        {}", std::env::consts::OS);
    eprintln!("  Architecture:    {}", std::env::consts::ARCH);
    eprintln!();
    eprintln!("Covariance model:");
    eprintln!("  - B = O_c (sum_k W_k^1/2 B_k W_k^1/2) O_c^T");
    eprintln!(
        "  - GMRESR inverse: {} iterations, tolerance {:.0e}",
        saber::gmresr::GMRESR_MAX_ITERATIONS,
        saber::gmresr::GMRESR_TOLERANCE
    );
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    if let Err(e) = logging::init_tracing("info") {
        eprintln!("[saber] {e}");
    }

    match args.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Blocks => list_blocks(),
        Commands::Validate { kind } => {
            let cfg_path = args.config.context("--config required for validate")?;
            validate_config(&cfg_path, &kind)
        }
        Commands::Toolbox { json } => {
            let cfg_path = args.config.context("--config required")?;
            let out_path = PathBuf::from(
                args.out
                    .unwrap_or_else(|| "results/saber_norms.csv".to_string()),
            );

            let cfg_text = read_text(&cfg_path)?;
            let cfg: ToolboxConfig = toml::from_str(&cfg_text)
                .with_context(|| format!("failed to parse config: {}", cfg_path))?;
            cfg.validate()?;

            eprintln!(
                "[saber] v{} - toolbox, central block {}",
                VERSION,
                cfg.background_error.central_name()?
            );
            run_toolbox(&cfg, &cfg_text, &out_path, json)
        }
        Commands::Train { json } => {
            let cfg_path = args.config.context("--config required")?;
            let cfg_text = read_text(&cfg_path)?;
            let cfg: TrainingConfig = config::load(Path::new(&cfg_path))?;
            cfg.validate()?;

            eprintln!("[saber] v{} - training", VERSION);
            run_train(cfg, &cfg_text, args.out.as_deref().map(Path::new), json)
        }
    }
}
