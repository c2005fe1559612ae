use anyhow::{Context, Result};
use clap::Parser;
use pair_dataset::PairPipeline;
use pair_tools::{init_tracing, SourceArgs, ToolConfig};

#[derive(Parser, Debug)]
#[command(
    name = "pair_stream",
    about = "Drive epochs through the streaming pipeline and print per-epoch stats as JSON"
)]
struct Args {
    #[command(flatten)]
    source: SourceArgs,
    /// Number of epochs to run.
    #[arg(long, default_value_t = 1)]
    epochs: u64,
    /// Stop each epoch after this many batches.
    #[arg(long)]
    max_batches: Option<usize>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let tools = ToolConfig::load();
    let cfg = args.source.pipeline_config(&tools)?;
    let descriptors = args.source.resolve(&tools)?;

    let mut pipeline = PairPipeline::new(descriptors, cfg).context("build pipeline")?;
    for _ in 0..args.epochs {
        let mut delivered = 0usize;
        for batch in pipeline.epoch_iter() {
            let batch = batch.context("epoch aborted")?;
            delivered += 1;
            tracing::debug!(shape = ?batch.shape, "batch");
            if args.max_batches.is_some_and(|max| delivered >= max) {
                break;
            }
        }
        println!("{}", serde_json::to_string(&pipeline.stats())?);
        pipeline.reset_epoch();
    }
    Ok(())
}
