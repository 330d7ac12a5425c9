use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::info;

use neumf::{
    default_output_path, fetch_dataset, load_train_matrix, parse_list, prepare_dataset, train, Dataset, Flt, IdMapping,
    Learner, ModelConfig, NeuMF, RandomState, TrainConfig,
};

#[derive(Debug, Parser)]
#[command(name = "neumf", version, about = "Neural matrix factorization recommender")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train NeuMF on a leave-one-out dataset
    Train(TrainArgs),
    /// Print the top items for one user from saved weights
    Recommend(RecommendArgs),
    /// Build a leave-one-out dataset from a raw interaction log
    Prepare(PrepareArgs),
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// Input data path
    #[arg(long, default_value = "Data/")]
    path: String,
    #[arg(long, default_value = "ml-1m")]
    dataset: String,
    #[arg(long, default_value_t = 100)]
    epochs: usize,
    #[arg(long, default_value_t = 256)]
    batch_size: usize,
    /// Embedding size of the MF branch
    #[arg(long, default_value_t = 8)]
    num_factors: usize,
    /// MLP layer widths; layers[0] is the concatenated embedding size
    #[arg(long, default_value = "[64,32,16,8]")]
    layers: String,
    #[arg(long, default_value_t = 0.0)]
    reg_mf: Flt,
    #[arg(long, default_value = "[0,0,0,0]")]
    reg_layers: String,
    /// Negative instances per positive
    #[arg(long, default_value_t = 4)]
    num_neg: usize,
    #[arg(long, default_value_t = 0.001)]
    lr: Flt,
    /// adagrad, adam, rmsprop or sgd
    #[arg(long, default_value = "adam")]
    learner: String,
    /// Evaluate every X epochs
    #[arg(long, default_value_t = 1)]
    verbose: usize,
    /// Whether to save the trained model (0 disables)
    #[arg(long, default_value_t = 1)]
    out: u8,
    #[arg(long)]
    mf_pretrain: Option<PathBuf>,
    #[arg(long)]
    mlp_pretrain: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    top_k: usize,
    #[arg(long, default_value_t = 1)]
    threads: usize,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = 10000)]
    id_headroom: usize,
    #[arg(long, default_value = "Pretrain")]
    out_dir: PathBuf,
    /// Fetch the published NCF files into --path when missing
    #[arg(long)]
    download: bool,
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Args)]
struct RecommendArgs {
    /// Weights written by `train`
    #[arg(long)]
    weights: PathBuf,
    /// Original user id (a model index when no user mapping is found)
    #[arg(long)]
    user: String,
    #[arg(long, default_value_t = 10)]
    top_k: usize,
    #[arg(long, default_value = "Data/")]
    path: PathBuf,
    #[arg(long, default_value = "ml-1m")]
    dataset: String,
    /// Defaults to <path>/user_mapping.csv
    #[arg(long)]
    user_mapping: Option<PathBuf>,
    /// Defaults to <path>/room_mapping.csv
    #[arg(long)]
    item_mapping: Option<PathBuf>,
    /// Also rank items the user already has in the train file
    #[arg(long)]
    keep_seen: bool,
}

#[derive(Debug, Args)]
struct PrepareArgs {
    /// Raw `user item rating timestamp` log
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value_t = '\t')]
    separator: char,
    /// The first line of the log is a header
    #[arg(long)]
    header: bool,
    /// Output directory
    #[arg(long, default_value = "Data/")]
    path: PathBuf,
    #[arg(long)]
    dataset: String,
    /// Test negatives per held-out item
    #[arg(long, default_value_t = 99)]
    num_neg: usize,
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match Cli::parse().command {
        Command::Train(args) => run_train(args),
        Command::Recommend(args) => run_recommend(args),
        Command::Prepare(args) => run_prepare(args),
    }
}

fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let model_config = ModelConfig {
        mf_dim: args.num_factors,
        layers: parse_list(&args.layers)?,
        reg_layers: parse_list(&args.reg_layers)?,
        reg_mf: args.reg_mf,
    };
    let out = (args.out > 0).then(|| default_output_path(&args.out_dir, &args.dataset, &model_config));
    let config = TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        num_negatives: args.num_neg,
        learning_rate: args.lr,
        learner: args.learner.parse::<Learner>()?,
        verbose: args.verbose,
        top_k: args.top_k,
        num_threads: args.threads,
        id_headroom: args.id_headroom,
        seed: args.seed,
        out,
        mf_pretrain: args.mf_pretrain,
        mlp_pretrain: args.mlp_pretrain,
        progress: args.progress,
    };
    info!("NeuMF arguments: {}", args_summary(&model_config, &config));

    let dataset = if args.download {
        fetch_dataset(Some(args.path.as_str()), &args.dataset, true)
    } else {
        Dataset::load(&args.path, &args.dataset)
    }
    .with_context(|| format!("loading dataset {} from {}", args.dataset, args.path))?;

    train(&dataset, &model_config, &config)?;
    Ok(())
}

fn args_summary(model_config: &ModelConfig, config: &TrainConfig) -> String {
    format!(
        "num_factors={}, layers={}, reg_mf={}, reg_layers={:?}, num_neg={}, lr={}, learner={}, epochs={}, batch_size={}",
        model_config.mf_dim,
        model_config.layers_label(),
        model_config.reg_mf,
        model_config.reg_layers,
        config.num_negatives,
        config.learning_rate,
        config.learner,
        config.epochs,
        config.batch_size
    )
}

fn run_recommend(args: RecommendArgs) -> anyhow::Result<()> {
    let model = NeuMF::load(&args.weights).with_context(|| format!("loading weights {}", args.weights.display()))?;
    let users = load_mapping(args.user_mapping.as_deref(), &args.path, "user_mapping.csv")?;
    let items = load_mapping(args.item_mapping.as_deref(), &args.path, "room_mapping.csv")?;

    let user = match &users {
        Some(mapping) => match mapping.index_of(&args.user) {
            Some(idx) => idx,
            None => bail!("unknown user id {}", args.user),
        },
        None => args
            .user
            .parse::<usize>()
            .with_context(|| format!("user {} is not an index and no user mapping was found", args.user))?,
    };

    let train_file = args.path.join(format!("{}.train.rating", args.dataset));
    let seen = if !args.keep_seen && train_file.is_file() {
        let matrix = load_train_matrix(&args.path, &args.dataset)
            .with_context(|| format!("loading {}", train_file.display()))?;
        Some(matrix)
    } else {
        None
    };
    let recommendations = model.recommend(user, args.top_k, seen.as_ref())?;
    for (item, score) in recommendations {
        let id = items
            .as_ref()
            .and_then(|mapping| mapping.id_of(item))
            .map(str::to_string)
            .unwrap_or_else(|| item.to_string());
        println!("{}\t{:.6}", id, score);
    }
    Ok(())
}

fn load_mapping(explicit: Option<&Path>, dir: &Path, default_name: &str) -> anyhow::Result<Option<IdMapping>> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = dir.join(default_name);
            if !path.is_file() {
                return Ok(None);
            }
            path
        }
    };
    let mapping = IdMapping::load(&path).with_context(|| format!("loading mapping {}", path.display()))?;
    Ok(Some(mapping))
}

fn run_prepare(args: PrepareArgs) -> anyhow::Result<()> {
    if !args.separator.is_ascii() {
        bail!("separator must be a single ASCII character, got {:?}", args.separator);
    }
    let mut random_state = RandomState::new(args.seed);
    prepare_dataset(
        &args.input,
        args.separator as u8,
        args.header,
        &args.path,
        &args.dataset,
        args.num_neg,
        &mut random_state,
    )
    .with_context(|| format!("preparing {} from {}", args.dataset, args.input.display()))?;
    Ok(())
}
