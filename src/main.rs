//! Command line front end for building, training, pruning and symbolically simplifying networks
use std::{
    error::Error,
    fs::File,
    path::{Path, PathBuf},
};

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use multkan::{
    kan::{
        symbolic::{FormulaOptions, SuggestOptions},
        Kan, KanOptions,
    },
    optimizer::{Adam, Sgd},
    regularizer::RegularizationOptions,
    symbolic_layer::symbolic_function::SymbolicFunction,
    to_matrices, train_model,
    topology::LayerWidth,
    training_observer::TrainingObserver,
    training_options::TrainingOptions,
    Dataset, Sample,
};
use rustc_hash::FxHashSet;
use serde::Deserialize;

/// A CLI for training Kolmogorov-Arnold networks with multiplication nodes and turning them into formulas. Appropriate for datasets that can be loaded into memory.
#[derive(Parser, Debug, Clone)]
struct Cli {
    #[command(subcommand)]
    command: WhereCommands,

    /// log training progress to stdout in addition to drawing on the terminal, allowing output to be piped
    #[arg(long, default_value = "false", global = true)]
    log_output: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum WhereCommands {
    /// Build a new model and train it on the provided data
    Build(BuildArgs),
    /// Load an existing model for further training, inference, pruning or symbolic conversion
    Load(LoadArgs),
}

#[derive(Args, Clone, Debug)]
struct BuildArgs {
    /// a comma-separated list of level widths, input level first. `3` is three sum neurons, `3+2` adds two multiplication neurons
    #[arg(short, long, required = true, value_delimiter = ',')]
    widths: Vec<LayerWidth>,

    #[arg(long, default_value = "3")]
    /// The number of grid intervals of every spline
    grid: usize,

    #[arg(short = 'k', long, default_value = "3")]
    /// The degree of the spline basis functions
    degree: usize,

    #[arg(long, default_value = "0")]
    /// seed for parameter initialization
    init_seed: u64,

    #[command(flatten)]
    training_parameters: TrainArgs,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum CliOptimizer {
    Adam,
    Sgd,
}

#[derive(Args, Clone, Debug)]
#[command(group(ArgGroup::new("output").required(true).multiple(false)))]
struct TrainArgs {
    /// path to the file containing the training data.
    /// The file format is determined by the file extension. Supported formats are: pickle, json, avro
    /// Every record needs an ordered list field named 'features' and an ordered list field named 'labels'
    #[arg(short = 'd', long = "data")]
    data_file: PathBuf,

    #[arg(short = 's', long, default_value = "100")]
    /// number of optimizer steps
    steps: usize,

    #[arg(long, value_enum, default_value = "adam")]
    optimizer: CliOptimizer,

    #[arg(long, alias = "lr", default_value = "0.01")]
    /// the learning rate used to update the model weights
    learning_rate: f64,

    #[arg(long)]
    /// samples per step. If not set, every step uses the whole training set
    batch_size: Option<usize>,

    #[arg(long)]
    /// keep the spline grids fixed during training
    no_grid_update: bool,

    #[arg(long, default_value = "10")]
    /// how many grid refreshes to spread over the first `stop-grid-update-step` steps
    grid_update_num: usize,

    #[arg(long, default_value = "50")]
    /// the step after which grids are no longer refreshed
    stop_grid_update_step: usize,

    #[arg(long, default_value = "0")]
    /// overall weight of the sparsity penalty. 0 disables it
    lamb: f64,

    #[arg(long, default_value = "1")]
    lamb_l1: f64,

    #[arg(long, default_value = "2")]
    lamb_entropy: f64,

    #[arg(long, default_value = "0")]
    lamb_coef: f64,

    #[arg(long, default_value = "0")]
    lamb_coefdiff: f64,

    #[arg(long)]
    /// drop samples whose prediction is NaN from the loss
    skip_nan: bool,

    #[arg(long)]
    /// seed for batch sampling and the test split
    seed: Option<u64>,

    #[arg(long, default_value = "0.2")]
    /// the fraction of the data held out to report the test loss
    test_split: f64,

    #[arg(long, default_value = "10")]
    /// print the losses every this many steps
    log_interval: usize,

    /// path to the output file for the model weights. Supported file extensions are .pkl, .json, and .cbor
    #[arg(short = 'o', long = "model-out", group = "output")]
    model_output_file: Option<PathBuf>,

    /// if set, the model will not be saved to a file after training. Useful for experimentation
    #[arg(long, group = "output")]
    no_save: bool,
}

impl TrainArgs {
    fn training_options(&self) -> Result<TrainingOptions, Box<dyn Error>> {
        let regularization = RegularizationOptions {
            lamb: self.lamb,
            lamb_l1: self.lamb_l1,
            lamb_entropy: self.lamb_entropy,
            lamb_coef: self.lamb_coef,
            lamb_coefdiff: self.lamb_coefdiff,
            ..RegularizationOptions::default()
        };
        Ok(TrainingOptions::new(
            self.steps,
            self.batch_size,
            !self.no_grid_update,
            self.grid_update_num,
            self.stop_grid_update_step,
            regularization,
            self.skip_nan,
            self.seed,
        )?)
    }
}

#[derive(Args, Clone, Debug)]
struct LoadArgs {
    /// path to the model weights file.
    model_input_file: PathBuf,

    #[command(subcommand)]
    command: WhyCommands,
}

#[derive(Subcommand, Debug, Clone)]
enum WhyCommands {
    /// Further train the model weights loaded from a file
    Train(TrainArgs),
    /// Use a loaded model to make predictions on new data
    Infer {
        /// path to the file containing the data. Records only need the 'features' field
        #[arg(short = 'd', long = "data", required = true)]
        data_file: PathBuf,
    },
    /// Remove inactive neurons and edges, judged by the activations on the provided data
    Prune {
        #[arg(short = 'd', long = "data", required = true)]
        data_file: PathBuf,
        #[arg(long, default_value = "0.01")]
        node_threshold: f64,
        #[arg(long, default_value = "0.03")]
        edge_threshold: f64,
        /// path to the output file for the pruned model
        #[arg(short = 'o', long = "model-out", required = true)]
        model_output_file: PathBuf,
    },
    /// Replace every numeric edge by its best fitting primitive, judged by the activations on the provided data
    AutoSymbolic {
        #[arg(short = 'd', long = "data", required = true)]
        data_file: PathBuf,
        /// a comma-separated list of primitives to try, e.g. `x,x^2,sin`. If empty, the whole library is tried
        #[arg(long, value_delimiter = ',')]
        library: Option<Vec<SymbolicFunction>>,
        #[arg(long, default_value = "0.02")]
        weight_simple: f64,
        /// path to the output file for the converted model
        #[arg(short = 'o', long = "model-out", required = true)]
        model_output_file: PathBuf,
    },
    /// Print the closed-form formula of a fully symbolic model
    Formula {
        #[arg(long, default_value = "4")]
        /// significant digits kept in every constant
        digits: usize,
        /// a comma-separated list of input variable names
        #[arg(long, value_delimiter = ',')]
        variables: Option<Vec<String>>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();
    info!("Using arguments {cli:?}");
    match cli.command {
        WhereCommands::Build(build_args) => {
            let train_args = build_args.training_parameters;
            // better to fail now than after training
            if let Some(output_file_path) = &train_args.model_output_file {
                validate_output_file_extension(output_file_path)?;
            }
            let options = train_args.training_options()?;
            let dataset = load_training_data(&train_args.data_file, train_args.test_split, train_args.seed)?;
            let untrained_model = Kan::new(&KanOptions {
                grid: build_args.grid,
                k: build_args.degree,
                seed: build_args.init_seed,
                ..KanOptions::new(build_args.widths)
            })?;
            let trained_model = run_training(untrained_model, &dataset, &train_args, &options, cli.log_output)?;
            if let Some(model_output_file) = &train_args.model_output_file {
                serialize_model(model_output_file, &trained_model)?;
            }
            Ok(())
        }
        WhereCommands::Load(load_args) => {
            let mut loaded_model = deserialize_model(&load_args.model_input_file)?;
            match load_args.command {
                WhyCommands::Train(train_args) => {
                    if let Some(output_file_path) = &train_args.model_output_file {
                        validate_output_file_extension(output_file_path)?;
                    }
                    let options = train_args.training_options()?;
                    let dataset =
                        load_training_data(&train_args.data_file, train_args.test_split, train_args.seed)?;
                    let trained_model = run_training(loaded_model, &dataset, &train_args, &options, cli.log_output)?;
                    if let Some(model_output_file) = &train_args.model_output_file {
                        serialize_model(model_output_file, &trained_model)?;
                    }
                    Ok(())
                }
                WhyCommands::Infer { data_file } => {
                    let data = load_inference_data(&data_file)?;
                    let samples: Vec<&Sample> = data.iter().collect();
                    let (x, _) = to_matrices(&samples);
                    let prediction = loaded_model.infer(&x)?;
                    for row in prediction.row_iter() {
                        let output_string = "[".to_string()
                            + &row
                                .iter()
                                .map(|a| a.to_string())
                                .collect::<Vec<String>>()
                                .join(", ")
                            + "]";
                        println!("{}", output_string);
                    }
                    Ok(())
                }
                WhyCommands::Prune {
                    data_file,
                    node_threshold,
                    edge_threshold,
                    model_output_file,
                } => {
                    validate_output_file_extension(&model_output_file)?;
                    forward_on_data(&mut loaded_model, &data_file)?;
                    let pruned_model = loaded_model.prune(node_threshold, edge_threshold)?;
                    println!(
                        "Pruned {} down to {}",
                        loaded_model.topology(),
                        pruned_model.topology()
                    );
                    serialize_model(&model_output_file, &pruned_model)?;
                    Ok(())
                }
                WhyCommands::AutoSymbolic {
                    data_file,
                    library,
                    weight_simple,
                    model_output_file,
                } => {
                    validate_output_file_extension(&model_output_file)?;
                    forward_on_data(&mut loaded_model, &data_file)?;
                    loaded_model.auto_symbolic(&SuggestOptions {
                        library,
                        weight_simple,
                        ..SuggestOptions::default()
                    })?;
                    serialize_model(&model_output_file, &loaded_model)?;
                    Ok(())
                }
                WhyCommands::Formula { digits, variables } => {
                    let formula = loaded_model.symbolic_formula(&FormulaOptions {
                        digits,
                        variables,
                        ..FormulaOptions::default()
                    })?;
                    println!("{}", formula);
                    Ok(())
                }
            }
        }
    }
}

fn run_training(
    model: Kan,
    dataset: &Dataset,
    train_args: &TrainArgs,
    options: &TrainingOptions,
    log_output: bool,
) -> Result<Kan, Box<dyn Error>> {
    let training_observer = TrainingProgress::new(options.steps as u64, train_args.log_interval, log_output)?;
    let (trained_model, history) = match train_args.optimizer {
        CliOptimizer::Adam => train_model(
            model,
            dataset,
            &mut Adam::new(train_args.learning_rate),
            &training_observer,
            options,
        )?,
        CliOptimizer::Sgd => train_model(
            model,
            dataset,
            &mut Sgd::new(train_args.learning_rate),
            &training_observer,
            options,
        )?,
    };
    let final_loss = history.test_loss.last().copied().unwrap_or(f64::NAN);
    training_observer.into_inner().finish_with_message(format!(
        "{} Training complete. Final test loss: {}",
        chrono::Local::now(),
        final_loss
    ));
    Ok(trained_model)
}

/// run the model on every feature row of `data_file`, filling its activation cache
fn forward_on_data(model: &mut Kan, data_file: &Path) -> Result<(), Box<dyn Error>> {
    let data = load_inference_data(data_file)?;
    if data.is_empty() {
        return Err(format!("no samples in {:?}", data_file).into());
    }
    let samples: Vec<&Sample> = data.iter().collect();
    let (x, _) = to_matrices(&samples);
    model.forward(&x)?;
    Ok(())
}

fn file_extension(path: &Path) -> Result<&str, Box<dyn Error>> {
    path.extension()
        .and_then(|extension| extension.to_str())
        .ok_or_else(|| format!("No usable file extension found for {:?}", path).into())
}

fn serialize_model(model_output_file: &Path, trained_model: &Kan) -> Result<File, Box<dyn Error>> {
    println!("Saving model to file: {:?}", model_output_file);
    let file_extension = file_extension(model_output_file)?;
    let mut out_file = File::create(model_output_file)?;
    match file_extension {
        "pkl" => serde_pickle::to_writer(&mut out_file, trained_model, Default::default())?,
        "json" => serde_json::to_writer(&mut out_file, trained_model)?,
        "cbor" => ciborium::into_writer(trained_model, &mut out_file)?,
        _ => return Err(format!("Unsupported file extension: {}", file_extension).into()),
    }
    Ok(out_file)
}

fn validate_output_file_extension(output_file_path: &Path) -> Result<(), Box<dyn Error>> {
    match file_extension(output_file_path)? {
        "pkl" | "json" | "cbor" => Ok(()),
        other => Err(format!("Unsupported file extension: {}", other).into()),
    }
}

fn deserialize_model(model_input_file: &Path) -> Result<Kan, Box<dyn Error>> {
    println!("Loading model from file: {:?}", model_input_file);
    let file_extension = file_extension(model_input_file)?;
    let file = File::open(model_input_file)?;
    let model: Kan = match file_extension {
        "pkl" => serde_pickle::from_reader(file, Default::default())?,
        "json" => serde_json::from_reader(file)?,
        "cbor" => ciborium::from_reader(file)?,
        _ => return Err(format!("Unsupported file extension: {}", file_extension).into()),
    };
    Ok(model)
}

struct TrainingProgress {
    pb: ProgressBar,
    log_interval: usize,
    should_log: bool,
}

impl TrainingProgress {
    fn new(total: u64, log_interval: usize, should_log: bool) -> Result<Self, Box<dyn Error>> {
        let pb = ProgressBar::new(total);
        pb.set_style(ProgressStyle::default_bar().template(
            "[{elapsed_precise}] [{bar:40.green/white}] {human_pos}/{human_len} {per_sec} ({eta}) {msg}",
        )?);
        Ok(TrainingProgress {
            pb,
            log_interval: log_interval.max(1),
            should_log,
        })
    }

    fn into_inner(self) -> ProgressBar {
        self.pb
    }
}

impl TrainingObserver for TrainingProgress {
    fn on_step_end(&self, step: usize, train_loss: f64, test_loss: f64, reg: f64) {
        self.pb.inc(1);
        if step % self.log_interval != 0 {
            return;
        }
        let line = format!(
            "{} Step {}: Train Loss: {:.4e}, Test Loss: {:.4e}, Reg: {:.4e}",
            chrono::Local::now(),
            step,
            train_loss,
            test_loss,
            reg
        );
        if self.should_log {
            println!("{}", line);
        }
        self.pb.println(line);
    }

    fn on_grid_update(&self, step: usize) {
        self.pb.set_message(format!("grids refreshed at step {}", step));
    }
}

#[derive(Deserialize, Debug)]
#[cfg_attr(test, derive(serde::Serialize, PartialEq))]
struct InferenceSample {
    features: Vec<f64>,
}

const SUPPORTED_EXTENSIONS: [&str; 3] = ["pkl", "json", "avro"];

fn read_records<T: for<'de> Deserialize<'de>>(data_file_path: &Path) -> Result<Vec<T>, Box<dyn Error>> {
    let file_extension = file_extension(data_file_path)?;
    let file = File::open(data_file_path)?;
    let records: Vec<T> = match file_extension {
        "pkl" => serde_pickle::from_reader(file, Default::default())?,
        "json" => serde_json::from_reader(file)?,
        "avro" => {
            let mut data: Vec<T> = vec![];
            let avro_reader = apache_avro::Reader::new(file)?;
            for value in avro_reader {
                data.push(apache_avro::from_value(&value?)?);
            }
            data
        }
        _ => {
            return Err(format!(
                "UNABLE TO LOAD DATA: unsupported file extension: {}. Supported extensions are: {}",
                file_extension,
                SUPPORTED_EXTENSIONS.join(", ")
            )
            .into())
        }
    };
    Ok(records)
}

fn load_training_data(
    data_file_path: &Path,
    test_split: f64,
    seed: Option<u64>,
) -> Result<Dataset, Box<dyn Error>> {
    println!("Loading data from file: {:?}", data_file_path);
    let data: Vec<Sample> = read_records(data_file_path)?;
    split_data(test_split, data, seed)
}

fn load_inference_data(data_file_path: &Path) -> Result<Vec<Sample>, Box<dyn Error>> {
    let raw_data: Vec<InferenceSample> = read_records(data_file_path)?;
    Ok(raw_data
        .into_iter()
        .map(|raw_sample| Sample::new(raw_sample.features, vec![]))
        .collect())
}

fn split_data(test_split: f64, data: Vec<Sample>, seed: Option<u64>) -> Result<Dataset, Box<dyn Error>> {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    if !(0.0..1.0).contains(&test_split) {
        return Err(format!("test split must be in [0, 1), got {}", test_split).into());
    }
    let rows_loaded = data.len();
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut test_indices: FxHashSet<usize> = FxHashSet::default();
    while test_indices.len() < (test_split * rows_loaded as f64) as usize {
        test_indices.insert(rng.gen_range(0..rows_loaded));
    }
    let mut dataset = Dataset::default();
    for (i, sample) in data.into_iter().enumerate() {
        if test_indices.contains(&i) {
            dataset.test.push(sample);
        } else {
            dataset.train.push(sample);
        }
    }
    println!(
        "Data loaded. Training: {}, Test: {}",
        dataset.train.len(),
        dataset.test.len()
    );
    Ok(dataset)
}
