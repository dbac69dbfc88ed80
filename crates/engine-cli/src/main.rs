//! vision-infer - build and benchmark cached ONNX inference engines

mod settings;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use gpu_device::{DeviceImage, Normalization};
use inference_engine::{BuildOutcome, Engine, FeatureVectors, InferenceBatcher};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use settings::{LoggingSettings, Settings};

#[derive(Parser)]
#[command(name = "vision-infer", about = "Cached, batched ONNX inference on the GPU", version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List CUDA devices and their memory
    Devices,
    /// Build the engine for a model, or confirm the cached one
    Build {
        /// ONNX model (defaults to `model_path` from the configuration)
        model: Option<PathBuf>,
    },
    /// Build, load and time inference on a batch of images
    Bench {
        /// ONNX model (defaults to `model_path` from the configuration)
        model: Option<PathBuf>,
        /// Picture to feed the network; a mid-grey frame when omitted
        #[arg(long)]
        image: Option<PathBuf>,
        /// Images per inference call
        #[arg(long, default_value = "1")]
        batch: usize,
        /// Timed inference calls
        #[arg(long, default_value = "100")]
        iterations: usize,
        /// Untimed calls before measuring
        #[arg(long, default_value = "5")]
        warmup: usize,
        /// Submit single images from this many concurrent clients through the
        /// request batcher instead of calling the engine directly
        #[arg(long)]
        clients: Option<usize>,
    },
}

#[derive(Serialize)]
struct DeviceReport {
    index: u32,
    name: String,
    fingerprint: String,
    memory_free: usize,
    memory_total: usize,
}

#[derive(Serialize)]
struct BuildReport {
    engine_path: PathBuf,
    cached: bool,
    precision: String,
    backend: &'static str,
}

#[derive(Serialize)]
struct BenchReport {
    engine_path: PathBuf,
    batch: usize,
    iterations: usize,
    input: [u32; 2],
    output_lengths: Vec<usize>,
    latency_ms: LatencyStats,
    images_per_second: f64,
}

#[derive(Serialize)]
struct LatencyStats {
    mean: f64,
    p50: f64,
    p95: f64,
    min: f64,
    max: f64,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<f64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.total_cmp(b));
        let at = |q: f64| samples[((samples.len() - 1) as f64 * q).round() as usize];
        Some(Self {
            mean: samples.iter().sum::<f64>() / samples.len() as f64,
            p50: at(0.5),
            p95: at(0.95),
            min: samples[0],
            max: samples[samples.len() - 1],
        })
    }
}

/// Initialize logging
fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let level: Level = settings
        .level
        .parse()
        .map_err(|_| anyhow!("invalid log level '{}'", settings.level))?;
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr);

    if settings.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .context("failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings =
        Settings::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    settings.logging.json |= cli.json_logs;
    init_logging(&settings.logging)?;
    info!("vision-infer v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Devices => devices(),
        Command::Build { model } => build(&settings, model),
        Command::Bench {
            model,
            image,
            batch,
            iterations,
            warmup,
            clients,
        } => {
            let images = BenchImages {
                path: image,
                batch,
            };
            match clients {
                Some(clients) => bench_batched(&settings, model, images, iterations, clients).await,
                None => bench(&settings, model, images, iterations, warmup),
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn devices() -> Result<()> {
    let names = gpu_device::device_names().context("unable to enumerate CUDA devices")?;
    let mut reports = Vec::with_capacity(names.len());
    for (index, name) in names.into_iter().enumerate() {
        let index = index as u32;
        gpu_device::set_device(index)?;
        let memory = gpu_device::memory_info()?;
        reports.push(DeviceReport {
            index,
            fingerprint: inference_engine::fingerprint::sanitize_device_name(&name),
            name,
            memory_free: memory.free,
            memory_total: memory.total,
        });
    }
    print_json(&reports)
}

fn model_path(settings: &Settings, model: Option<PathBuf>) -> Result<PathBuf> {
    model
        .or_else(|| settings.model_path.clone())
        .ok_or_else(|| anyhow!("no model given on the command line or in the configuration"))
}

fn build_engine<'a>(settings: &'a Settings, model: &Path) -> Result<(Engine<'a>, BuildOutcome)> {
    let mut engine = Engine::new(&settings.engine).with_cache_dir(&settings.cache_dir);
    let outcome = engine
        .build(model)
        .with_context(|| format!("failed to build engine for {}", model.display()))?;
    Ok((engine, outcome))
}

fn build(settings: &Settings, model: Option<PathBuf>) -> Result<()> {
    let model = model_path(settings, model)?;
    let (engine, outcome) = build_engine(settings, &model)?;
    print_json(&BuildReport {
        engine_path: engine.engine_path().map(Path::to_path_buf).unwrap_or_default(),
        cached: outcome == BuildOutcome::Cached,
        precision: engine.precision().map(|p| p.as_str().to_string()).unwrap_or_default(),
        backend: engine.backend_name(),
    })
}

struct BenchImages {
    path: Option<PathBuf>,
    batch: usize,
}

impl BenchImages {
    /// Decode the picture, or synthesize a grey one at the network's input size
    fn frame(&self, width: u32, height: u32) -> Result<DeviceImage> {
        let image = match &self.path {
            Some(path) => {
                let rgb = image::open(path)
                    .with_context(|| format!("failed to decode {}", path.display()))?
                    .to_rgb8();
                DeviceImage::upload(rgb.as_raw(), rgb.width(), rgb.height())?
            }
            None => DeviceImage::filled(width, height, [128, 128, 128])?,
        };
        Ok(image)
    }

    /// `batch` copies of one frame
    fn upload(&self, width: u32, height: u32) -> Result<Vec<DeviceImage>> {
        if self.batch == 0 {
            bail!("--batch must be at least 1");
        }
        let first = self.frame(width, height)?;
        let mut images = Vec::with_capacity(self.batch);
        for _ in 1..self.batch {
            images.push(first.try_clone()?);
        }
        images.push(first);
        Ok(images)
    }
}

fn loaded_engine<'a>(
    settings: &'a Settings,
    model: Option<PathBuf>,
) -> Result<(Engine<'a>, u32, u32)> {
    let model = model_path(settings, model)?;
    let (mut engine, _) = build_engine(settings, &model)?;
    engine.load_network().context("failed to load engine")?;
    let width = engine.input_width().ok_or_else(|| anyhow!("engine reports no input width"))?;
    let height = engine.input_height().ok_or_else(|| anyhow!("engine reports no input height"))?;
    Ok((engine, width, height))
}

fn bench(
    settings: &Settings,
    model: Option<PathBuf>,
    images: BenchImages,
    iterations: usize,
    warmup: usize,
) -> Result<()> {
    let (mut engine, width, height) = loaded_engine(settings, model)?;
    let normalization = Normalization::from(&settings.normalization);
    let batch = images.upload(width, height)?;

    let mut last: FeatureVectors = Vec::new();
    for _ in 0..warmup {
        last = engine.run_inference(&batch, &normalization)?;
    }
    let mut samples = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let started = Instant::now();
        last = engine.run_inference(&batch, &normalization)?;
        samples.push(started.elapsed().as_secs_f64() * 1e3);
    }

    let latency = LatencyStats::from_samples(samples)
        .ok_or_else(|| anyhow!("--iterations must be at least 1"))?;
    let images_per_second = batch.len() as f64 * 1e3 / latency.mean;
    print_json(&BenchReport {
        engine_path: engine.engine_path().map(Path::to_path_buf).unwrap_or_default(),
        batch: batch.len(),
        iterations,
        input: [width, height],
        output_lengths: last
            .first()
            .map(|item| item.iter().map(Vec::len).collect())
            .unwrap_or_default(),
        latency_ms: latency,
        images_per_second,
    })
}

async fn bench_batched(
    settings: &Settings,
    model: Option<PathBuf>,
    images: BenchImages,
    iterations: usize,
    clients: usize,
) -> Result<()> {
    if clients == 0 {
        bail!("--clients must be at least 1");
    }
    let (mut engine, width, height) = loaded_engine(settings, model)?;
    let normalization = Normalization::from(&settings.normalization);
    let batch_size = images.batch.max(1);
    let (sender, mut batcher) = InferenceBatcher::channel(batch_size, 2);

    let mut frames = Vec::with_capacity(clients);
    for _ in 0..clients {
        frames.push(images.frame(width, height)?);
    }

    let started = Instant::now();
    let requests = async move {
        let mut samples = Vec::with_capacity(iterations);
        let mut output_lengths = Vec::new();
        for _ in 0..iterations {
            let round = Instant::now();
            let copies = frames.iter().map(|f| f.try_clone()).collect::<Result<Vec<_>, _>>()?;
            let results = submit_all(&sender, copies).await;
            samples.push(round.elapsed().as_secs_f64() * 1e3);
            for result in results {
                output_lengths = result?.iter().map(Vec::len).collect();
            }
        }
        drop(sender);
        Ok::<_, anyhow::Error>((samples, output_lengths))
    };

    let (outcome, served) = tokio::join!(requests, batcher.run(&mut engine, &normalization));
    served?;
    let (samples, output_lengths) = outcome?;
    let elapsed = started.elapsed().as_secs_f64();

    let latency = LatencyStats::from_samples(samples)
        .ok_or_else(|| anyhow!("--iterations must be at least 1"))?;
    print_json(&BenchReport {
        engine_path: engine.engine_path().map(Path::to_path_buf).unwrap_or_default(),
        batch: batch_size,
        iterations,
        input: [width, height],
        output_lengths,
        latency_ms: latency,
        images_per_second: (clients * iterations) as f64 / elapsed,
    })
}

/// Submit every image concurrently and collect the replies in order
async fn submit_all(
    sender: &inference_engine::BatchSender,
    images: Vec<DeviceImage>,
) -> Vec<Result<inference_engine::ImageFeatures, inference_engine::EngineError>> {
    let mut pending = tokio::task::JoinSet::new();
    for (index, image) in images.into_iter().enumerate() {
        let sender = sender.clone();
        pending.spawn(async move { (index, sender.infer(image).await) });
    }
    let mut results = Vec::with_capacity(pending.len());
    while let Some(joined) = pending.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => results.push((
                usize::MAX,
                Err(inference_engine::EngineError::Runtime(format!("client task failed: {}", e))),
            )),
        }
    }
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_stats() {
        let stats = LatencyStats::from_samples(vec![4.0, 1.0, 3.0, 2.0, 5.0]).unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.p50, 3.0);
        assert!((stats.mean - 3.0).abs() < 1e-9);
        assert!(LatencyStats::from_samples(Vec::new()).is_none());
    }

    #[test]
    fn test_cli_parses_bench() {
        let cli = Cli::try_parse_from([
            "vision-infer",
            "--log-level",
            "debug",
            "bench",
            "resnet.onnx",
            "--batch",
            "4",
            "--clients",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Bench {
                model, batch, clients, ..
            } => {
                assert_eq!(model, Some(PathBuf::from("resnet.onnx")));
                assert_eq!(batch, 4);
                assert_eq!(clients, Some(2));
            }
            _ => panic!("expected bench"),
        }
    }

    #[test]
    fn test_model_path_falls_back_to_settings() {
        let mut settings = Settings::default();
        assert!(model_path(&settings, None).is_err());
        settings.model_path = Some(PathBuf::from("configured.onnx"));
        assert_eq!(model_path(&settings, None).unwrap(), PathBuf::from("configured.onnx"));
        assert_eq!(
            model_path(&settings, Some(PathBuf::from("cli.onnx"))).unwrap(),
            PathBuf::from("cli.onnx")
        );
    }

    #[test]
    fn test_bench_images_copies_frame() {
        let images = BenchImages { path: None, batch: 3 };
        let uploaded = images.upload(8, 6).unwrap();
        assert_eq!(uploaded.len(), 3);
        assert!(uploaded.iter().all(|i| i.dimensions() == (8, 6)));
        assert!(BenchImages { path: None, batch: 0 }.upload(8, 6).is_err());
    }
}
