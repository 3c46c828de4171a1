//! rlpack CLI - group, pack, and inspect RL fine-tuning batches.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rlpack_core::{Channel, RlPackConfig};
use rlpack_data::{
    packed_tensors_to_dir, ChannelSlice, PackedDataset, PromptGroup, PromptGrouper, SequencePacker,
};

#[derive(Parser)]
#[command(name = "rlpack")]
#[command(author, version, about = "Sequence packing for GRPO-style RL fine-tuning", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Group sibling completions, pack them into rows, and write the tensors
    Pack {
        /// JSONL file, one `{"completions": [...]}` object per prompt
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory (overrides `output_dir` in the config file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Path to configuration file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Row width
        #[arg(long)]
        seq_len: Option<usize>,

        /// Token id written into padding positions
        #[arg(long, allow_hyphen_values = true)]
        pad_token_id: Option<i64>,

        /// Drop results longer than a row instead of truncating them
        #[arg(long)]
        no_truncate: bool,

        /// Seed for shuffling and id draws
        #[arg(long)]
        seed: Option<u64>,

        /// Keep siblings in input order
        #[arg(long)]
        no_shuffle: bool,
    },

    /// Show the shape and contents of a packed tensor directory
    Inspect {
        /// Directory written by `rlpack pack`
        #[arg(short, long)]
        dir: PathBuf,

        /// Dump every channel of this row
        #[arg(long)]
        row: Option<usize>,

        /// Only dump this channel (e.g. `group_ids`); requires --row
        #[arg(long, requires = "row")]
        channel: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Pack {
            input,
            output,
            config,
            seq_len,
            pad_token_id,
            no_truncate,
            seed,
            no_shuffle,
        } => {
            let mut config = match config {
                Some(path) => RlPackConfig::from_yaml_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => RlPackConfig::default(),
            };

            // Override with CLI args if provided
            if let Some(seq_len) = seq_len {
                config.packing.seq_len = seq_len;
            }
            if let Some(pad_token_id) = pad_token_id {
                config.packing.pad_token_id = pad_token_id;
            }
            if no_truncate {
                config.packing.truncate_long_results = false;
            }
            if seed.is_some() {
                config.packing.seed = seed;
            }
            if no_shuffle {
                config.grouping.shuffle = false;
            }
            config.packing.validate()?;

            let output = match output.or_else(|| config.output_dir.as_ref().map(PathBuf::from)) {
                Some(output) => output,
                None => anyhow::bail!("Output directory is required. Use --output or set output_dir in the config file."),
            };

            run_pack(&input, &output, &config)
        }
        Commands::Inspect { dir, row, channel } => run_inspect(&dir, row, channel.as_deref()),
    }
}

fn read_groups(path: &Path) -> anyhow::Result<Vec<PromptGroup>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut groups = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let group: PromptGroup = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid prompt group", path.display(), index + 1))?;
        groups.push(group);
    }
    Ok(groups)
}

fn run_pack(input: &Path, output: &Path, config: &RlPackConfig) -> anyhow::Result<()> {
    let groups = read_groups(input)?;
    tracing::info!("Loaded {} prompt groups from {}", groups.len(), input.display());

    let mut grouper = PromptGrouper::new(config.grouping.clone(), config.packing.seed);
    let results = grouper.group_all(groups)?;

    let mut packer = SequencePacker::new(config.packing.clone());
    let (tensors, stats) = packer.pack_with_stats(&results)?;
    let disk = packed_tensors_to_dir(&tensors, output)?;

    println!("{}", stats.summary());
    println!(
        "Wrote {} x {} to {}",
        disk.num_sequences,
        disk.sequence_length,
        disk.dir.display()
    );
    Ok(())
}

fn run_inspect(dir: &Path, row: Option<usize>, channel: Option<&str>) -> anyhow::Result<()> {
    let dataset = PackedDataset::from_dir(dir)
        .with_context(|| format!("Failed to open packed tensors in {}", dir.display()))?;

    println!("Directory: {}", dataset.descriptor().dir.display());
    println!("Shape:     {} x {}", dataset.len(), dataset.sequence_length());

    match row {
        Some(index) => {
            let row = dataset.get(index)?;
            if let Some(name) = channel {
                let Some(channel) = Channel::from_name(name) else {
                    anyhow::bail!("Unknown channel '{name}'");
                };
                match row.channel(channel) {
                    ChannelSlice::Int64(values) => println!("Row {index} {channel}: {values:?}"),
                    ChannelSlice::Float32(values) => println!("Row {index} {channel}: {values:?}"),
                    ChannelSlice::Bool(values) => println!("Row {index} {channel}: {values:?}"),
                }
                return Ok(());
            }
            println!("Row {index}:");
            println!("  tokens:         {:?}", row.tokens);
            println!("  group_ids:      {:?}", row.group_ids);
            println!("  parent_ids:     {:?}", row.parent_ids);
            println!("  input_pos:      {:?}", row.input_pos);
            println!("  assistant_mask: {:?}", row.assistant_mask);
            println!("  logprobs:       {:?}", row.logprobs);
            println!("  advantages:     {:?}", row.advantages);
            println!("  weights:        {:?}", row.weights);
            println!("  deferred:       {:?}", row.deferred);
        }
        None => {
            let mut total = 0;
            for (index, row) in dataset.iter().enumerate() {
                let supervised = row?.num_assistant_tokens();
                total += supervised;
                println!("  row {index:>5}: {supervised} supervised tokens");
            }
            println!("Supervised tokens: {total}");
        }
    }
    Ok(())
}
