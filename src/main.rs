//! deepfake-detector CLI: 学習・推論・モデル情報表示

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Parser, Subcommand};

use deepfake_detector_lib::{
    ml::{download_weights, EpochMetrics, InferenceEngine, ModelBuilder, DEFAULT_WEIGHTS_PATH, MOBILENET_V2_WEIGHTS_URL},
    model::{load_metadata, print_metadata_info, AppConfig, DeviceType},
    CpuAutodiffBackend, CpuBackend,
};

#[derive(Parser)]
#[command(name = "deepfake-detector")]
#[command(about = "Real / fake image classifier (transfer learning + inference)")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a detector from a directory with two class subdirectories
    Train {
        /// Training data directory (overrides config)
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Output model file (overrides config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of epochs (overrides config)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Pretrained backbone weights (overrides config)
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Train on a randomly initialised backbone when no weights file is available
        #[arg(long)]
        random_backbone: bool,
    },

    /// Classify images as REAL or FAKE
    Classify {
        /// Trained model file (defaults to the configured path)
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Image files to classify
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// Display model information
    Info {
        /// Model file (defaults to the configured path)
        #[arg(short, long)]
        model: Option<PathBuf>,
    },

    /// Pretrained backbone weights management
    Weights {
        #[command(subcommand)]
        command: WeightsCommands,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum WeightsCommands {
    /// Download the ImageNet MobileNetV2 weights (safetensors)
    Fetch {
        /// Source URL
        #[arg(long, default_value = MOBILENET_V2_WEIGHTS_URL)]
        url: String,

        /// Destination (defaults to the configured backbone weights path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default configuration file
    Init {
        /// Destination (defaults to config.json)
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);

    match cli.command {
        Commands::Train {
            data,
            output,
            epochs,
            weights,
            random_backbone,
        } => {
            let mut config = AppConfig::load_or_default(&config_path);
            if let Some(data) = data {
                config.training.data_dir = data;
            }
            if let Some(output) = output {
                config.model.model_path = output;
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if weights.is_some() {
                config.model.backbone_weights = weights;
            }
            if random_backbone {
                config.model.allow_random_backbone = true;
            }
            config.display();

            let builder = ModelBuilder::from_config(&config);
            match config.device_type {
                DeviceType::Cpu => run_train::<CpuAutodiffBackend>(builder, Default::default()),
                DeviceType::Wgpu => train_on_gpu(builder),
            }
        }
        Commands::Classify { model, images } => {
            let config = AppConfig::load_or_default(&config_path);
            let model_path = model.unwrap_or(config.model.model_path);
            match config.device_type {
                DeviceType::Cpu => run_classify::<CpuBackend>(&model_path, &images, Default::default()),
                DeviceType::Wgpu => classify_on_gpu(&model_path, &images),
            }
        }
        Commands::Info { model } => {
            let model_path = model.unwrap_or_else(|| AppConfig::load_or_default(&config_path).model.model_path);
            let metadata = load_metadata(&model_path)?;
            print_metadata_info(&metadata);
            Ok(())
        }
        Commands::Weights {
            command: WeightsCommands::Fetch { url, output, force },
        } => {
            let output = output
                .or_else(|| AppConfig::load_or_default(&config_path).model.backbone_weights)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WEIGHTS_PATH));
            if output.exists() && !force {
                bail!(
                    "重みファイルは既に存在します: {}（上書きする場合は --force）",
                    output.display()
                );
            }

            let runtime = tokio::runtime::Runtime::new().context("非同期ランタイムを起動できません")?;
            let size = runtime
                .block_on(download_weights(&url, &output))
                .context("重みのダウンロードに失敗しました")?;
            println!("重みを保存しました: {} ({} bytes)", output.display(), size);
            Ok(())
        }
        Commands::Config {
            command: ConfigCommands::Init { path },
        } => {
            let path = path.unwrap_or(config_path);
            if path.exists() {
                bail!("設定ファイルは既に存在します: {}", path.display());
            }
            AppConfig::default().save(&path)?;
            println!("デフォルト設定を書き込みました: {}", path.display());
            Ok(())
        }
    }
}

fn run_train<B: AutodiffBackend>(builder: ModelBuilder, device: B::Device) -> Result<()> {
    let report = builder
        .train::<B, _>(device, |metrics: &EpochMetrics| {
            log::debug!("エポック {} 完了", metrics.epoch);
        })
        .context("学習に失敗しました")?;

    println!("\n=== 学習完了 ===");
    println!("クラス対応: {:?}", report.class_indices);
    println!(
        "サンプル数: 学習 {} / 検証 {}",
        report.num_train_samples, report.num_valid_samples
    );
    if let Some(metrics) = report.final_metrics() {
        println!(
            "最終エポック: loss={:.4} accuracy={:.2}%",
            metrics.train_loss,
            metrics.train_accuracy * 100.0
        );
    }
    println!("モデル: {}", report.model_path.display());
    Ok(())
}

fn run_classify<B: Backend>(model_path: &Path, images: &[PathBuf], device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model_path, device)?;

    let mut failures = 0usize;
    for (path, result) in images.iter().zip(engine.classify_batch(images)) {
        match result {
            Ok(result) => println!(
                "{}\t{}\t{}",
                path.display(),
                result.label,
                result.confidence_display()
            ),
            Err(e) => {
                failures += 1;
                eprintln!("{}\tエラー: {}", path.display(), e);
            }
        }
    }

    if failures > 0 {
        bail!("{} / {} 枚の画像で分類に失敗しました", failures, images.len());
    }
    Ok(())
}

#[cfg(feature = "wgpu")]
fn train_on_gpu(builder: ModelBuilder) -> Result<()> {
    run_train::<deepfake_detector_lib::GpuAutodiffBackend>(builder, Default::default())
}

#[cfg(not(feature = "wgpu"))]
fn train_on_gpu(_builder: ModelBuilder) -> Result<()> {
    Err(gpu_unavailable().into())
}

#[cfg(feature = "wgpu")]
fn classify_on_gpu(model_path: &Path, images: &[PathBuf]) -> Result<()> {
    run_classify::<deepfake_detector_lib::GpuBackend>(model_path, images, Default::default())
}

#[cfg(not(feature = "wgpu"))]
fn classify_on_gpu(_model_path: &Path, _images: &[PathBuf]) -> Result<()> {
    Err(gpu_unavailable().into())
}

#[cfg(not(feature = "wgpu"))]
fn gpu_unavailable() -> deepfake_detector_lib::DetectorError {
    deepfake_detector_lib::DetectorError::Configuration(
        "WGPU バックエンドは無効です（`--features wgpu` でビルドしてください）".to_string(),
    )
}
