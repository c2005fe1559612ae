use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use image::ImageFormat;
use pair_dataset::{
    check_value_range, map_parallel_with_progress, ImageTensor, PairDeriver, SampleDescriptor,
    TransformChain, TransformRegistry,
};
use pair_tools::{init_tracing, output_stems, SourceArgs, ToolConfig};

#[derive(Parser, Debug)]
#[command(
    name = "pair_convert",
    about = "Derive and transform every sample into <stem>_input.png / <stem>_target.png"
)]
struct Args {
    #[command(flatten)]
    source: SourceArgs,
    /// Output directory (defaults to the tools config output_root).
    #[arg(long)]
    out: Option<PathBuf>,
    /// Worker threads (defaults to the pipeline parallelism).
    #[arg(long)]
    workers: Option<usize>,
    /// Per-read timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<f64>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let tools = ToolConfig::load();
    let cfg = args.source.pipeline_config(&tools)?;
    let descriptors = args.source.resolve(&tools)?;

    let out_root = args.out.clone().unwrap_or_else(|| tools.output_root.clone());
    fs::create_dir_all(&out_root).with_context(|| format!("create {}", out_root.display()))?;

    let chain = TransformRegistry::with_builtins()
        .build(&cfg.transforms)
        .context("build transform chain")?;
    let timeout = match args.timeout_secs {
        Some(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => bail!("--timeout-secs must be > 0, got {secs}"),
        None => cfg.sample_timeout(),
    };
    let deriver = match timeout {
        Some(t) => PairDeriver::new(cfg.derive).guarded(t),
        None => PairDeriver::new(cfg.derive),
    };
    let workers = args
        .workers
        .or(tools.workers)
        .unwrap_or(cfg.parallelism)
        .max(1);

    let total = descriptors.len();
    tracing::info!(
        samples = total,
        workers,
        out = %out_root.display(),
        chain = %chain.describe(),
        "converting samples"
    );
    let stems = output_stems(&descriptors);
    let jobs: Vec<(SampleDescriptor, String)> = descriptors.into_iter().zip(stems).collect();
    let results = map_parallel_with_progress("convert", jobs, workers, |(descriptor, stem)| {
        convert_one(&descriptor, &stem, &deriver, &chain, cfg.value_range, &out_root)
    });

    let mut written = 0usize;
    let mut failed = 0usize;
    for result in results {
        match result {
            Ok(Ok(())) => written += 1,
            Ok(Err(e)) => {
                failed += 1;
                tracing::warn!(error = %format!("{e:#}"), "sample failed");
            }
            Err(fault) => {
                failed += 1;
                tracing::warn!(%fault, "worker fault");
            }
        }
    }

    println!(
        "Convert complete: samples {}, written {}, failed {}",
        total, written, failed
    );
    if total > 0 && written == 0 {
        bail!("every sample failed");
    }
    Ok(())
}

fn convert_one(
    descriptor: &SampleDescriptor,
    stem: &str,
    deriver: &PairDeriver,
    chain: &TransformChain,
    value_range: (f32, f32),
    out_root: &Path,
) -> Result<()> {
    let identity = descriptor.identity();
    let pair = deriver
        .derive(descriptor)
        .with_context(|| format!("derive {identity}"))?;
    let pair = chain.apply(pair, &identity)?;
    check_value_range(&pair, value_range, &identity)?;
    save_png(&pair.input, &out_root.join(format!("{stem}_input.png")))?;
    save_png(&pair.target, &out_root.join(format!("{stem}_target.png")))?;
    Ok(())
}

fn save_png(tensor: &ImageTensor, path: &Path) -> Result<()> {
    let img = tensor
        .to_dynamic()
        .ok_or_else(|| anyhow!("cannot encode {} channels as PNG", tensor.channels))?;
    img.save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("write {}", path.display()))
}
