//! 実画像 / ディープフェイク画像の2値分類
//!
//! - [`ml::training::ModelBuilder`]: 事前学習済みバックボーンを凍結した転移学習
//! - [`ml::inference::InferenceEngine`]: 学習済みアーカイブを読み込んで REAL / FAKE を判定
//! - [`service::DetectorService`]: 非同期呼び出し用のサービス層

pub mod error;
pub mod types;
pub mod ml;
pub mod model;
pub mod service;

pub use error::{DetectorError, DetectorResult};
pub use ml::{InferenceEngine, ModelBuilder, TrainingReport};
pub use model::AppConfig;
pub use service::DetectorService;
pub use types::{ClassificationResult, Label, DECISION_THRESHOLD};

/// CPU バックエンド
pub type CpuBackend = burn_ndarray::NdArray<f32>;
/// CPU 学習用バックエンド
pub type CpuAutodiffBackend = burn_autodiff::Autodiff<CpuBackend>;

/// GPU バックエンド
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;
/// GPU 学習用バックエンド
#[cfg(feature = "wgpu")]
pub type GpuAutodiffBackend = burn_autodiff::Autodiff<GpuBackend>;
