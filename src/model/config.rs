//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデルパス、学習・前処理設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DetectorError, DetectorResult};
use crate::ml::preprocess::PreprocessSettings;
use crate::ml::pretrained::DEFAULT_WEIGHTS_PATH;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド（`wgpu` feature が必要）
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    /// モデルファイルのパス（学習の出力先、推論の読み込み元）
    pub model_path: PathBuf,
    /// バックボーンの事前学習済み重み（ImageNet の `.safetensors` または Burn バイナリレコード）
    #[serde(default = "default_backbone_weights")]
    pub backbone_weights: Option<PathBuf>,
    /// 重みファイルが無い場合にランダム初期化のバックボーンで学習する
    #[serde(default)]
    pub allow_random_backbone: bool,
    /// バックボーンの幅係数
    #[serde(default = "default_width_multiplier")]
    pub width_multiplier: f64,
}

fn default_width_multiplier() -> f64 {
    1.0
}

fn default_backbone_weights() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_WEIGHTS_PATH))
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/deepfake_detector.tar.gz"),
            backbone_weights: default_backbone_weights(),
            allow_random_backbone: false,
            width_multiplier: default_width_multiplier(),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingSettings {
    /// 学習データディレクトリ（クラスディレクトリを2つ含む）
    pub data_dir: PathBuf,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 検証データの割合
    pub validation_split: f32,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/train"),
            num_epochs: 5,
            batch_size: 10,
            learning_rate: 1e-3,
            seed: 42,
            validation_split: 0.2,
        }
    }
}

impl TrainingSettings {
    /// 設定値の妥当性を検証
    pub fn validate(&self) -> DetectorResult<()> {
        if self.num_epochs == 0 {
            return Err(DetectorError::Configuration(
                "エポック数は1以上である必要があります".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(DetectorError::Configuration(
                "バッチサイズは1以上である必要があります".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(DetectorError::Configuration(format!(
                "学習率が不正です: {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(DetectorError::Configuration(format!(
                "検証データの割合は [0, 1) の範囲で指定してください: {}",
                self.validation_split
            )));
        }
        Ok(())
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// 前処理設定
    #[serde(default)]
    pub preprocessing: PreprocessSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> DetectorResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            DetectorError::Configuration(format!(
                "設定ファイルを読み込めません ({}): {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            DetectorError::Configuration(format!(
                "設定ファイルを解析できません ({}): {}",
                path.display(),
                e
            ))
        })
    }

    /// 設定を読み込む、存在しない・読み込めない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                log::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("{}", e);
                log::warn!("デフォルト設定を使用します");
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> DetectorResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DetectorError::Configuration(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログへ出力
    pub fn display(&self) {
        log::info!("=== アプリケーション設定 ===");
        log::info!("計算デバイス: {}", self.device_type);
        log::info!("モデルパス: {}", self.model.model_path.display());
        match &self.model.backbone_weights {
            Some(weights) => log::info!("バックボーン重み: {}", weights.display()),
            None => log::info!("バックボーン重み: (未指定)"),
        }
        if self.model.allow_random_backbone {
            log::info!("重みが無い場合はランダム初期化のバックボーンを使用します");
        }
        log::info!("学習データ: {}", self.training.data_dir.display());
        log::info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}, シード: {}, 検証割合: {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed,
            self.training.validation_split
        );
        log::info!(
            "前処理: {0}x{0} {1:?} / {2:?}",
            self.preprocessing.image_size,
            self.preprocessing.mode,
            self.preprocessing.filter
        );
    }
}
