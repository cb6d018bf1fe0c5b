use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use artbow::{
    evaluate, label_distribution, load_global, load_label_table, load_local, load_rgb, sample_fraction,
    BalancedSubindex, BatchLoader, BatchSize, ClassEncoding, Classify, ClassificationTarget, Config, DatasetImages,
    Evaluation, FsArtifactStore, PngVisualizer, Scale, Trainer, TracingProgress, Visualizer,
};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::utils::DurationExt;

mod utils;

const DEFAULT_CONFIG: &str = "config.json";
const DEFAULT_INDEX: &str = "subrandom-index.json";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    /// One palette shared by all classes, compared through histograms
    Global,
    /// One palette per class, compared through quantization error
    Local,
}

impl Method {
    fn name(&self) -> &'static str {
        match self {
            Method::Global => "global",
            Method::Local => "local",
        }
    }
}

/// Classify paintings by artist, genre or style with patch palettes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON); defaults apply when it is absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the root directory of the images
    #[arg(long)]
    dataset_path: Option<PathBuf>,

    /// Override the directory of the label tables
    #[arg(long)]
    dataset_labels_path: Option<PathBuf>,

    /// Override the memory budget of an image batch, e.g. `--batch-size 512 MiB`
    #[arg(long, num_args = 2, value_names = ["VALUE", "UNIT"])]
    batch_size: Option<Vec<String>>,

    /// Label space to classify
    #[arg(short, long, value_parser = |s: &str| s.parse::<ClassificationTarget>(), default_value = "style")]
    target: ClassificationTarget,

    /// Directory for trained artifacts and rendered images
    #[arg(short, long, default_value = "artifacts")]
    artifacts: PathBuf,

    /// Print the output in JSON format
    #[arg(short, long, global = true)]
    json: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a classifier on the training table of the target
    Train {
        #[arg(short, long, value_enum, default_value_t = Method::Global)]
        method: Method,

        /// Keep everything in memory instead of writing artifacts and images
        #[arg(long)]
        no_persist: bool,

        /// Evaluate the trained classifier on the validation table
        #[arg(short, long)]
        evaluate: bool,
    },
    /// Evaluate a previously trained classifier
    Evaluate {
        #[arg(short, long, value_enum, default_value_t = Method::Global)]
        method: Method,

        /// Evaluate only a random fraction of the validation table
        #[arg(short, long)]
        fraction: Option<f64>,
    },
    /// Predict the class of image files
    Predict {
        #[arg(short, long, value_enum, default_value_t = Method::Global)]
        method: Method,

        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Write a balanced sub-index of every target's training table
    Subsample {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Chart the number of labeled images per class of every target
    Summarize {
        /// Count validation rows as well as training rows
        #[arg(long)]
        all: bool,

        /// Directory for the charts (defaults to the artifacts directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Serialize, Debug)]
struct EvaluationReport {
    timestamp: String,
    target: ClassificationTarget,
    method: &'static str,
    accuracy: Option<f64>,
    #[serde(flatten)]
    evaluation: Evaluation,
}

#[derive(Serialize, Debug)]
struct Prediction<'a> {
    path: &'a Path,
    class: &'a str,
}

#[derive(Serialize, Debug)]
struct ClassCount<'a> {
    target: ClassificationTarget,
    class: &'a str,
    images: usize,
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => Config::load(DEFAULT_CONFIG)?,
        None => Config::default(),
    };

    if let Some(path) = &args.dataset_path {
        config.dataset_path = path.clone();
    }
    if let Some(path) = &args.dataset_labels_path {
        config.dataset_labels_path = path.clone();
    }
    if let Some(batch_size) = &args.batch_size {
        config.batch_size = BatchSize::parse(&batch_size[0], &batch_size[1])?;
    }
    config.validate()?;
    Ok(config)
}

fn load_classifier(store: &FsArtifactStore, config: &Config, method: Method) -> anyhow::Result<Box<dyn Classify>> {
    let classifier: Box<dyn Classify> = match method {
        Method::Global => Box::new(load_global(store, config)?),
        Method::Local => Box::new(load_local(store, config)?),
    };
    Ok(classifier)
}

fn run_evaluation(
    config: &Config,
    target: ClassificationTarget,
    classifier: &dyn Classify,
    fraction: Option<f64>,
) -> anyhow::Result<Evaluation> {
    let labels = &config.dataset_labels_path;
    let encoding = ClassEncoding::load(labels, target).context("failed to load class encoding")?;
    let table = target.validation_table(labels);
    let mut entries =
        load_label_table(&table).with_context(|| format!("failed to load validation table {}", table.display()))?;
    if let Some(fraction) = fraction {
        entries = sample_fraction(&entries, fraction, config.random_seed)?;
    }
    info!(entries = entries.len(), "evaluating");

    let images = DatasetImages::new(&config.dataset_path);
    let evaluation = evaluate(&entries, classifier, &encoding, &images, &mut TracingProgress::new(100))?;
    Ok(evaluation)
}

fn print_evaluation(
    args: &Args,
    method: Method,
    evaluation: Evaluation,
    started: Instant,
) -> anyhow::Result<()> {
    let report = EvaluationReport {
        timestamp: Local::now().to_rfc3339(),
        target: args.target,
        method: method.name(),
        accuracy: evaluation.accuracy(),
        evaluation,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "[{}] {} ({} palette): {} in {}",
            report.timestamp,
            report.target,
            report.method,
            evaluation,
            started.elapsed().display_duration(),
        );
    }
    Ok(())
}

fn train(args: &Args, config: &Config, method: Method, no_persist: bool, with_evaluation: bool) -> anyhow::Result<()> {
    let started = Instant::now();
    let root = args.artifacts.join(args.target.stem());
    let loader = BatchLoader::open(config, args.target).context("failed to open training data")?;
    info!(label = %args.target, classes = loader.index().len(), batch = %config.batch_size, "training");

    let mut store = FsArtifactStore::new(&root);
    let mut trainer = Trainer::new(config).with_progress(TracingProgress::new(10));
    if !no_persist {
        trainer = trainer.with_store(&mut store).with_visualizer(PngVisualizer::new(&root));
    }
    let classifier: Box<dyn Classify> = match method {
        Method::Global => Box::new(trainer.train_global(&loader)?),
        Method::Local => Box::new(trainer.train_local(&loader)?),
    };
    info!(
        method = method.name(),
        elapsed = %started.elapsed().display_duration(),
        "training finished"
    );
    if !no_persist {
        println!("artifacts written to {}", root.display());
    }

    if with_evaluation {
        let evaluation = run_evaluation(config, args.target, classifier.as_ref(), config.validation_fraction)?;
        print_evaluation(args, method, evaluation, started)?;
    }
    Ok(())
}

fn predict(args: &Args, config: &Config, method: Method, images: &[PathBuf]) -> anyhow::Result<()> {
    let store = FsArtifactStore::new(args.artifacts.join(args.target.stem()));
    let classifier = load_classifier(&store, config, method).context("failed to load trained classifier")?;

    let mut predictions = Vec::with_capacity(images.len());
    for path in images {
        let image = load_rgb(path).with_context(|| format!("failed to open {}", path.display()))?;
        let class = classifier
            .predict(&image)
            .with_context(|| format!("failed to classify {}", path.display()))?;
        predictions.push(Prediction { path, class });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&predictions)?);
    } else {
        for prediction in &predictions {
            println!("{}\t{}", prediction.path.display(), prediction.class);
        }
    }
    Ok(())
}

fn subsample(config: &Config, output: Option<&Path>) -> anyhow::Result<()> {
    let output = output
        .or(config.index_path.as_deref())
        .unwrap_or(Path::new(DEFAULT_INDEX));
    let subindex = BalancedSubindex::build(&config.dataset_labels_path, config.random_seed)
        .context("failed to build balanced index")?;
    subindex
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    for target in ClassificationTarget::ALL {
        if let Some(index) = subindex.get(target) {
            println!(
                "{}: {} classes x {} images",
                target,
                index.len(),
                target.default_subindex_size()
            );
        }
    }
    println!("index written to {}", output.display());
    Ok(())
}

fn summarize(args: &Args, config: &Config, all: bool, output: Option<&Path>) -> anyhow::Result<()> {
    let mut visualizer = PngVisualizer::new(output.unwrap_or(&args.artifacts));

    let mut summary = Vec::new();
    for target in ClassificationTarget::ALL {
        let counts = label_distribution(&config.dataset_labels_path, target, all)
            .with_context(|| format!("failed to read {target} labels"))?;
        visualizer.class_distribution(&format!("{target}_distribution"), &counts, Scale::Linear)?;
        visualizer.class_distribution(&format!("{target}_distribution_log"), &counts, Scale::Log)?;
        summary.push((target, counts));
    }

    if args.json {
        let rows: Vec<ClassCount> = summary
            .iter()
            .flat_map(|(target, counts)| {
                counts.iter().map(|(class, images)| ClassCount {
                    target: *target,
                    class,
                    images: *images,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for (target, counts) in &summary {
            let total: usize = counts.iter().map(|(_, n)| n).sum();
            println!("{target}: {} classes, {total} images", counts.len());
            for (class, images) in counts {
                println!("  {class:<40} {images:>6}");
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args).context("invalid configuration")?;
    match &args.command {
        Command::Train {
            method,
            no_persist,
            evaluate,
        } => train(&args, &config, *method, *no_persist, *evaluate),
        Command::Evaluate { method, fraction } => {
            let started = Instant::now();
            let store = FsArtifactStore::new(args.artifacts.join(args.target.stem()));
            let classifier = load_classifier(&store, &config, *method).context("failed to load trained classifier")?;
            let fraction = fraction.or(config.validation_fraction);
            let evaluation = run_evaluation(&config, args.target, classifier.as_ref(), fraction)?;
            print_evaluation(&args, *method, evaluation, started)
        }
        Command::Predict { method, images } => predict(&args, &config, *method, images),
        Command::Subsample { output } => subsample(&config, output.as_deref()),
        Command::Summarize { all, output } => summarize(&args, &config, *all, output.as_deref()),
    }
}
