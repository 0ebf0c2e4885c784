//! Trains the BERT-style classifier on a batch x model mesh spread over several clients,
//! then saves a checkpoint and restores it.
//!
//! ```bash
//! cargo run -p meshtrain-demos --bin bert-train -- --num-clients 2 --prefix /tmp/meshtrain
//! ```
//!
//! Each client is a thread with `num_global_devices / num_clients` virtual CPUs. Settings come
//! from defaults, then `--config`, then `MESHTRAIN_*` variables, then the flags below.

use anyhow::{Context, Result};
use clap::Parser;
use meshtrain::checkpoint::DTensorCheckpoint;
use meshtrain::config::RunConfig;
use meshtrain::data::{BatchCollate, DataLoader, ShardingPacker, SyntheticDataset, derive_partition};
use meshtrain::distributed::{Client, Cluster};
use meshtrain::loss::SparseCategoricalCrossentropy;
use meshtrain::mesh::{DeviceType, create_distributed_mesh};
use meshtrain::models::{BertClassifier, default_layout_map};
use meshtrain::nn::{Module, ParameterBuilder};
use meshtrain::train::{log_parameter_layouts, train_model};
use meshtrain::run_on;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bert-train")]
#[command(about = "Train a BERT classifier over a multi-client device mesh")]
struct Args {
    /// Prefix for checkpointing: a directory, file://... or mem://...
    #[arg(long)]
    prefix: Option<String>,

    /// Device type of the mesh (CPU, GPU or TPU)
    #[arg(long)]
    device_type: Option<DeviceType>,

    /// TOML run configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of clients to launch
    #[arg(long)]
    num_clients: Option<usize>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<RunConfig> {
    let config = match &args.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    let mut config = config.from_env()?;
    if let Some(prefix) = &args.prefix {
        config.checkpoint.prefix = prefix.clone();
    }
    if let Some(device_type) = args.device_type {
        config.mesh.device_type = device_type;
    }
    if let Some(num_clients) = args.num_clients {
        config.mesh.num_clients = num_clients;
    }
    Ok(config.validate()?)
}

/// Runs on every client. Collective from start to end.
fn run_client(client: Client, config: &RunConfig) -> meshtrain::Result<Vec<f32>> {
    info!(
        device_type = %client.device_type(),
        num_local_devices = client.num_local_devices(),
        "client ready"
    );
    let settings = &config.mesh;
    let mesh = create_distributed_mesh(
        &client,
        &settings.dims,
        settings.device_type,
        settings.num_global_devices,
    )?;

    let params = derive_partition(&client, &mesh, &settings.batch_dim)?;
    let global_batch = config.data.batch_size;
    let local_batch = params.local_batch_size(global_batch, mesh.dim_size(&settings.batch_dim)?)?;
    info!(?params, local_batch, "input pipeline");
    let dataset = SyntheticDataset::generate(config.data, params.input_pipeline_id)?;
    let loader = DataLoader::<_, _, BatchCollate>::with_collate(dataset, local_batch).repeat(true);
    let packer = ShardingPacker::new(&mesh, &settings.batch_dim)?;

    let layout_map = default_layout_map(&mesh, &settings.model_dim)?;
    let mut builder = ParameterBuilder::new(&layout_map, config.train.seed);
    let mut model = run_on(&mesh, || BertClassifier::new(config.model, &mut builder))?;
    log_parameter_layouts(&client, &model);
    info!(parameters = model.num_parameters(), "model built");

    let mut optimizer = config.train.optimizer.build(config.train.learning_rate);
    let loss = SparseCategoricalCrossentropy::new(true);
    let losses = train_model(
        &client,
        &mut model,
        optimizer.as_mut(),
        &loss,
        &packer,
        &mut loader.iter(),
        global_batch,
        config.train.options,
    )?;

    let mut checkpoint = DTensorCheckpoint::new(&mesh);
    let saved = checkpoint.save(&client, &model, &config.checkpoint.location())?;
    info!(path = %saved, "checkpoint saved");
    checkpoint.restore(&client, &mut model, &saved)?;
    info!(path = %saved, "checkpoint restored");
    Ok(losses)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    let config = load_config(&args).context("invalid run configuration")?;
    info!(
        num_clients = config.mesh.num_clients,
        num_global_devices = config.mesh.num_global_devices,
        "launching clients"
    );

    let cluster = Cluster::new(
        config.mesh.num_clients,
        config.mesh.device_type,
        config.mesh.devices_per_client(),
    );
    let losses = cluster
        .run(|client| run_client(client, &config))
        .context("training failed")?;

    if let Some(leader) = losses.first() {
        info!(epoch_losses = ?leader, "done");
    }
    Ok(())
}
