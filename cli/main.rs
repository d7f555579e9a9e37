#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use ndarray::ArrayView1;
use std::path::PathBuf;
use std::process;

use splinecal::data::{load_calibration_data, load_scores, write_predictions};
use splinecal::estimate::fit_calibration;
use splinecal::metrics::{DEFAULT_EPS, brier_score, log_loss};
use splinecal::model::{CalibrationConfig, CalibrationMethod, SplineCalibrator};

#[derive(Clone, Copy, ValueEnum)]
pub enum MethodCli {
    Logistic,
    Ridge,
}

impl From<MethodCli> for CalibrationMethod {
    fn from(method: MethodCli) -> Self {
        match method {
            MethodCli::Logistic => CalibrationMethod::Logistic,
            MethodCli::Ridge => CalibrationMethod::Ridge,
        }
    }
}

#[derive(Args)]
pub struct FitArgs {
    /// Path to a TSV file with label and score columns
    pub calibration_data: PathBuf,

    /// Where to write the fitted calibrator (.toml)
    #[arg(long, default_value = "calibrator.toml")]
    pub out: PathBuf,

    /// TOML file with calibration settings; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Regression used to map the spline basis to probabilities
    #[arg(long, value_enum)]
    pub method: Option<MethodCli>,

    /// Largest number of spline knots
    #[arg(long, value_name = "N")]
    pub max_knots: Option<usize>,

    /// Seed for knot subsampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Clip ridge output to [eps, 1 - eps]
    #[arg(long)]
    pub eps: Option<f64>,

    /// Leave ridge output unclipped
    #[arg(long)]
    pub no_force_prob: bool,

    /// Folds used to choose the regularization strength
    #[arg(long, value_name = "K")]
    pub inner_folds: Option<usize>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Path to a TSV file with a score column (and optionally sample_id)
    pub score_data: PathBuf,

    /// Path to a fitted calibrator (.toml)
    #[arg(long)]
    pub model: PathBuf,

    /// Where to write calibrated probabilities
    #[arg(long, default_value = "calibrated.tsv")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct EvaluateArgs {
    /// Path to a held-out TSV file with label and score columns
    pub evaluation_data: PathBuf,

    /// Path to a fitted calibrator (.toml)
    #[arg(long)]
    pub model: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "splinecal",
    about = "Spline-based probability calibration for binary classifier scores",
    long_about = "Fits a natural cubic spline map from raw classifier scores to calibrated \
                 probabilities, applies it to new scores, and reports calibration metrics."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a calibrator from labels and raw scores
    Fit(FitArgs),
    /// Calibrate new scores with a fitted calibrator
    Apply(ApplyArgs),
    /// Compare raw and calibrated scores on labelled data
    Evaluate(EvaluateArgs),
}

fn resolve_config(args: &FitArgs) -> Result<CalibrationConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            println!("Loading calibration settings from: {}", path.display());
            CalibrationConfig::load(&path.to_string_lossy())?
        }
        None => CalibrationConfig::default(),
    };
    if let Some(method) = args.method {
        config.method = method.into();
    }
    if let Some(max_knots) = args.max_knots {
        config.max_knots = max_knots;
    }
    if let Some(seed) = args.seed {
        config.random_state = seed;
    }
    if let Some(eps) = args.eps {
        config.eps = eps;
    }
    if let Some(inner_folds) = args.inner_folds {
        config.inner_folds = inner_folds;
    }
    if args.no_force_prob {
        config.force_prob = false;
    }
    Ok(config)
}

pub fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args)?;

    println!("Loading calibration data from: {}", args.calibration_data.display());
    let data = load_calibration_data(&args.calibration_data)?;
    println!("Loaded {} samples", data.labels.len());

    let calibrator = fit_calibration(data.labels.view(), data.scores.view(), &config)?;
    println!(
        "Fitted {:?} calibrator with {} knots (strength {:e})",
        calibrator.method,
        calibrator.knots.len(),
        calibrator.selected_strength
    );

    calibrator.save(&args.out.to_string_lossy())?;
    println!("Calibrator saved to: {}", args.out.display());
    Ok(())
}

pub fn apply(args: ApplyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let calibrator = SplineCalibrator::load(&args.model.to_string_lossy())?;
    let data = load_scores(&args.score_data)?;
    println!("Calibrating {} scores", data.scores.len());

    let probabilities = calibrator.calibrate(data.scores.view())?;
    write_predictions(
        &args.out,
        &data.sample_ids,
        data.scores.view(),
        probabilities.view(),
    )?;
    println!("Calibrated probabilities written to: {}", args.out.display());
    Ok(())
}

pub fn evaluate(args: EvaluateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let calibrator = SplineCalibrator::load(&args.model.to_string_lossy())?;
    let data = load_calibration_data(&args.evaluation_data)?;
    if let Some(bad) = data.labels.iter().find(|&&y| y != 0.0 && y != 1.0) {
        return Err(format!("evaluation labels must be 0 or 1, found {bad}").into());
    }
    let calibrated = calibrator.calibrate(data.scores.view())?;

    let raw = data.scores.mapv(|s| s.clamp(0.0, 1.0));
    println!("Evaluated {} samples", data.labels.len());
    print_metrics("raw", data.labels.view(), raw.view());
    print_metrics("calibrated", data.labels.view(), calibrated.view());
    Ok(())
}

fn print_metrics(name: &str, labels: ArrayView1<f64>, probabilities: ArrayView1<f64>) {
    let loss = log_loss(labels, probabilities, DEFAULT_EPS);
    let brier = brier_score(labels, probabilities);
    println!("{name:>10}  log-loss {loss:.6}  brier {brier:.6}");
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Apply(args)) => apply(args),
        Some(Commands::Evaluate(args)) => evaluate(args),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
