use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;

use mmqa_prep_core::{
    config::EncoderConfig,
    dataset::{DatasetTask, QaDataset},
    encoder::InstanceEncoder,
    store::SafetensorsFeatureStore,
    tokenizer::TokenizerWrapper,
};

mod logging;

#[derive(Parser)]
#[command(name = "mmqa-prep", about = "Multimodal QA instance-to-tensor encode driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TaskArg {
    /// Evidence filtering: per-choice relevance labels.
    Filter,
    /// Answer generation: masked-span targets.
    Generation,
}

impl From<TaskArg> for DatasetTask {
    fn from(task: TaskArg) -> Self {
        match task {
            TaskArg::Filter => DatasetTask::Filter,
            TaskArg::Generation => DatasetTask::Generation,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Encode one epoch of a dataset and report shape statistics
    Encode {
        /// Dataset JSON keyed by sample id
        #[arg(long)]
        dataset: PathBuf,

        /// `tokenizer.json` vocabulary file
        #[arg(long)]
        tokenizer: PathBuf,

        /// Encoder configuration JSON (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Image metadata JSON; enables image-context encoding together
        /// with --features
        #[arg(long)]
        image_metadata: Option<PathBuf>,

        /// Directory of per-id region-feature records
        #[arg(long)]
        features: Option<PathBuf>,

        /// Dataset split to load
        #[arg(long, default_value = "train")]
        split: String,

        /// Objective to encode for
        #[arg(long, value_enum, default_value_t = TaskArg::Filter)]
        task: TaskArg,

        /// Instances per batch
        #[arg(long, default_value_t = 64)]
        batch_size: usize,

        /// Cap on loaded instances
        #[arg(long)]
        max_samples: Option<usize>,

        /// Seed for deterministic encoding
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Encode {
            dataset,
            tokenizer,
            config,
            image_metadata,
            features,
            split,
            task,
            batch_size,
            max_samples,
            seed,
        } => encode(
            dataset,
            tokenizer,
            config,
            image_metadata,
            features,
            split,
            task.into(),
            batch_size,
            max_samples,
            seed,
        ),
    }
}

#[allow(clippy::too_many_arguments)] // CLI surface, called once
fn encode(
    dataset_path: PathBuf,
    tokenizer_path: PathBuf,
    config_path: Option<PathBuf>,
    image_metadata: Option<PathBuf>,
    features: Option<PathBuf>,
    split: String,
    task: DatasetTask,
    batch_size: usize,
    max_samples: Option<usize>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let config: EncoderConfig = match &config_path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => EncoderConfig::default(),
    };
    let tokenizer = Arc::new(TokenizerWrapper::from_file(&tokenizer_path)?);
    let splits = vec![split];

    let mut encoder = InstanceEncoder::new(config, tokenizer.clone())?;
    let dataset = match (&image_metadata, &features) {
        (Some(metadata), Some(feature_root)) => {
            let store = Arc::new(SafetensorsFeatureStore::new(feature_root));
            let dataset = QaDataset::load_image(
                &dataset_path,
                metadata,
                store.as_ref(),
                &splits,
                max_samples,
                task,
                &tokenizer,
            )?;
            encoder = encoder.with_feature_store(store);
            dataset
        }
        (None, None) => QaDataset::load_text(
            &dataset_path,
            &splits,
            max_samples,
            task,
            &tokenizer,
        )?,
        _ => anyhow::bail!("--image-metadata and --features must be given together"),
    };
    if dataset.is_empty() {
        anyhow::bail!("no instances loaded for split {}", splits[0]);
    }

    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut batches = 0usize;
    let mut examples = 0usize;
    for batch in dataset.epoch_iter(&encoder, batch_size, rng) {
        let batch = batch?;
        batches += 1;
        examples += batch.len();
        if let Some(first) = batch.first() {
            tracing::debug!(
                batch = batches,
                input_ids = ?first.input_ids.dims(),
                attention = ?first.attention_mask.dims(),
                "encoded batch"
            );
        }
    }

    tracing::info!(
        instances = dataset.len(),
        batches,
        examples,
        "epoch encoded"
    );
    Ok(())
}
