//! モデル学習（転移学習）
//!
//! 凍結したバックボーンの上に分類ヘッドを載せ、2値交差エントロピーで
//! ヘッドのみを学習します。学習済みモデルは tar.gz アーカイブとして保存します。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, DetectorResult};
use crate::ml::dataset::{ImageBatcher, LabeledImageDataset};
use crate::ml::ml_model::{DeepfakeDetector, DetectorConfig};
use crate::ml::preprocess::{PreprocessSettings, Preprocessor};
use crate::ml::pretrained::DEFAULT_WEIGHTS_PATH;
use crate::model::config::{AppConfig, TrainingSettings};
use crate::model::model_storage::{encode_module, save_model_with_metadata};
use crate::model::ModelMetadata;

/// 1エポック分の学習指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    /// 検証データが無い場合は None
    pub valid_loss: Option<f64>,
    pub valid_accuracy: Option<f64>,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// 保存先
    pub model_path: PathBuf,
    /// 実際に使用したクラス名 -> ラベルの対応
    pub class_indices: BTreeMap<String, usize>,
    pub num_train_samples: usize,
    pub num_valid_samples: usize,
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingReport {
    pub fn final_metrics(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}

/// モデルビルダー（学習ジョブ）
///
/// 一度きりのバッチ処理で、途中失敗時の再開はサポートしません。
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    output_model_path: PathBuf,
    backbone_weights: Option<PathBuf>,
    allow_random_backbone: bool,
    training: TrainingSettings,
    preprocessing: PreprocessSettings,
    detector: DetectorConfig,
}

impl ModelBuilder {
    pub fn new(data_dir: impl Into<PathBuf>, output_model_path: impl Into<PathBuf>) -> Self {
        Self {
            output_model_path: output_model_path.into(),
            backbone_weights: Some(PathBuf::from(DEFAULT_WEIGHTS_PATH)),
            allow_random_backbone: false,
            training: TrainingSettings {
                data_dir: data_dir.into(),
                ..TrainingSettings::default()
            },
            preprocessing: PreprocessSettings::default(),
            detector: DetectorConfig::mobilenet_v2(),
        }
    }

    /// アプリケーション設定から作成
    pub fn from_config(config: &AppConfig) -> Self {
        let mut detector = DetectorConfig::mobilenet_v2();
        detector.backbone.width_multiplier = config.model.width_multiplier;

        Self {
            output_model_path: config.model.model_path.clone(),
            backbone_weights: config.model.backbone_weights.clone(),
            allow_random_backbone: config.model.allow_random_backbone,
            training: config.training.clone(),
            preprocessing: config.preprocessing,
            detector,
        }
    }

    /// 学習設定を差し替える（データディレクトリを含む）
    pub fn with_training(mut self, training: TrainingSettings) -> Self {
        self.training = training;
        self
    }

    pub fn with_preprocessing(mut self, preprocessing: PreprocessSettings) -> Self {
        self.preprocessing = preprocessing;
        self
    }

    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_backbone_weights(mut self, weights: Option<PathBuf>) -> Self {
        self.backbone_weights = weights;
        self
    }

    /// 重みファイルが無い場合にランダム初期化のバックボーンを許可する
    pub fn with_random_backbone(mut self, allow: bool) -> Self {
        self.allow_random_backbone = allow;
        self
    }

    pub fn output_model_path(&self) -> &Path {
        &self.output_model_path
    }

    /// モデル学習を実行して保存
    ///
    /// `progress_callback` はエポック終了ごとに呼び出されます。
    pub fn train<B, F>(&self, device: B::Device, mut progress_callback: F) -> DetectorResult<TrainingReport>
    where
        B: AutodiffBackend,
        F: FnMut(&EpochMetrics),
    {
        self.training.validate()?;
        self.ensure_output_dir()?;
        let backbone_weights = self.resolve_backbone_weights()?;

        // === データ読み込みと検証 ===
        log::info!("学習データの検証を開始します: {}", self.training.data_dir.display());
        let dataset = LabeledImageDataset::from_directory(&self.training.data_dir)?;
        dataset.validate_images()?;

        let class_indices = dataset.class_indices();
        log::info!("クラス対応: {:?}", class_indices);

        let (dataset_train, dataset_valid) = dataset.split(self.training.validation_split);
        let num_train_samples = dataset_train.items().len();
        let num_valid_samples = dataset_valid.items().len();
        if num_train_samples == 0 {
            return Err(DetectorError::Data("学習用サンプルがありません".to_string()));
        }
        log::info!("学習データ: {} 枚", num_train_samples);
        log::info!("検証データ: {} 枚", num_valid_samples);

        // === モデル構築 ===
        let model = self.init_model::<B>(backbone_weights, &device)?;

        let preprocessor = Preprocessor::new(self.preprocessing);
        let batcher_train = ImageBatcher::<B>::new(preprocessor);
        let batcher_valid = ImageBatcher::<B::InnerBackend>::new(preprocessor);
        let train_failures = batcher_train.failures();
        let valid_failures = batcher_valid.failures();

        let dataloader_train = DataLoaderBuilder::new(batcher_train)
            .batch_size(self.training.batch_size)
            .shuffle(self.training.seed)
            .num_workers(0)
            .set_device(device.clone())
            .build(dataset_train);

        let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
            .batch_size(self.training.batch_size)
            .num_workers(0)
            .set_device(device.clone())
            .build(dataset_valid);

        let mut optim = AdamConfig::new().init();
        let mut model = model;
        let mut epochs = Vec::with_capacity(self.training.num_epochs);

        log::info!(
            "学習を開始します（エポック数: {}, バッチサイズ: {}, 学習率: {}）",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate
        );

        for epoch in 1..=self.training.num_epochs {
            // --- 学習 ---
            let mut tracker = MetricTracker::default();
            for batch in dataloader_train.iter() {
                train_failures.check()?;
                let (loss, logits) = model.forward_loss(batch.images, batch.targets);
                tracker.update(scalar(loss.clone()), logits, &batch.labels)?;

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optim.step(self.training.learning_rate, model, grads);
            }
            let (train_loss, train_accuracy) = tracker
                .finish()
                .ok_or_else(|| DetectorError::Training("学習バッチが空です".to_string()))?;

            // --- 検証 ---
            let model_valid = model.valid();
            let mut tracker = MetricTracker::default();
            for batch in dataloader_valid.iter() {
                valid_failures.check()?;
                let (loss, logits) = model_valid.forward_loss(batch.images, batch.targets);
                tracker.update(scalar(loss), logits, &batch.labels)?;
            }
            let valid = tracker.finish();

            if !train_loss.is_finite() {
                return Err(DetectorError::Training(format!(
                    "エポック {} で損失が発散しました",
                    epoch
                )));
            }

            let metrics = EpochMetrics {
                epoch,
                train_loss,
                train_accuracy,
                valid_loss: valid.map(|(loss, _)| loss),
                valid_accuracy: valid.map(|(_, acc)| acc),
            };
            log_epoch(&metrics, self.training.num_epochs);
            progress_callback(&metrics);
            epochs.push(metrics);
        }

        // === 保存 ===
        let trained_model = model.valid();
        let model_binary = encode_module(trained_model)?;

        let mut metadata = ModelMetadata::new(
            dataset.class_names().to_vec(),
            self.preprocessing,
            self.detector.clone(),
            self.training.num_epochs as u32,
        );
        metadata.num_train_samples = num_train_samples;
        metadata.num_valid_samples = num_valid_samples;
        metadata.final_metrics = epochs.last().copied();

        save_model_with_metadata(&self.output_model_path, &metadata, &model_binary)?;

        Ok(TrainingReport {
            model_path: self.output_model_path.clone(),
            class_indices,
            num_train_samples,
            num_valid_samples,
            epochs,
        })
    }

    /// 出力先ディレクトリを作成（学習前に失敗させる）
    fn ensure_output_dir(&self) -> DetectorResult<()> {
        match self.output_model_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DetectorError::Configuration(format!(
                        "出力ディレクトリを作成できません ({}): {}",
                        parent.display(),
                        e
                    ))
                })
            }
            _ => Ok(()),
        }
    }

    /// 使用する事前学習済み重みを決定（データ読み込み前に失敗させる）
    ///
    /// 重みが無い場合は、明示的に許可されたときだけランダム初期化を使います。
    fn resolve_backbone_weights(&self) -> DetectorResult<Option<&Path>> {
        match self.backbone_weights.as_deref() {
            Some(path) if path.exists() => Ok(Some(path)),
            _ if self.allow_random_backbone => {
                log::warn!("事前学習済み重みが無いため、ランダム初期化のバックボーンを使用します");
                Ok(None)
            }
            Some(path) => Err(DetectorError::Configuration(format!(
                "事前学習済み重みファイルが存在しません: {}（`deepfake-detector weights fetch` で取得できます）",
                path.display()
            ))),
            None => Err(DetectorError::Configuration(
                "事前学習済み重みが指定されていません（ランダム初期化で学習する場合は allow_random_backbone を有効にしてください）"
                    .to_string(),
            )),
        }
    }

    /// モデルを初期化し、事前学習済み重みを読み込んでバックボーンを凍結
    fn init_model<B: AutodiffBackend>(
        &self,
        backbone_weights: Option<&Path>,
        device: &B::Device,
    ) -> DetectorResult<DeepfakeDetector<B>> {
        let model = match backbone_weights {
            Some(weights) => {
                log::info!("事前学習済み重みを読み込みます: {}", weights.display());
                let backbone = self.detector.backbone.load_pretrained::<B>(weights, device)?;
                self.detector.init::<B>(device).with_backbone(backbone)
            }
            None => self.detector.init::<B>(device),
        };

        Ok(model.freeze_backbone())
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

fn log_epoch(metrics: &EpochMetrics, num_epochs: usize) {
    match (metrics.valid_loss, metrics.valid_accuracy) {
        (Some(valid_loss), Some(valid_accuracy)) => log::info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            metrics.epoch,
            num_epochs,
            metrics.train_loss,
            metrics.train_accuracy,
            valid_loss,
            valid_accuracy
        ),
        _ => log::info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4}",
            metrics.epoch,
            num_epochs,
            metrics.train_loss,
            metrics.train_accuracy
        ),
    }
}

/// バッチ単位の損失と正解数を集計
#[derive(Debug, Default)]
struct MetricTracker {
    loss_sum: f64,
    correct: usize,
    count: usize,
}

impl MetricTracker {
    fn update<B: Backend>(&mut self, loss: f64, logits: Tensor<B, 2>, labels: &[usize]) -> DetectorResult<()> {
        let values = logits
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| DetectorError::Training(format!("出力の取得エラー: {:?}", e)))?;

        // ロジット > 0 ⇔ 確率 > 0.5 ⇔ ラベル1
        self.correct += values
            .iter()
            .zip(labels)
            .filter(|(logit, label)| usize::from(**logit > 0.0) == **label)
            .count();
        self.loss_sum += loss * labels.len() as f64;
        self.count += labels.len();
        Ok(())
    }

    /// (平均損失, 精度)
    fn finish(&self) -> Option<(f64, f64)> {
        (self.count > 0).then(|| {
            (
                self.loss_sum / self.count as f64,
                self.correct as f64 / self.count as f64,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestAutodiff = Autodiff<NdArray<f32>>;

    #[test]
    fn test_metric_tracker_accuracy() {
        let device = Default::default();
        let logits = Tensor::<NdArray<f32>, 2>::from_floats([[2.0], [-1.0], [0.5], [-3.0]], &device);

        let mut tracker = MetricTracker::default();
        tracker.update(0.5, logits, &[1, 0, 0, 1]).unwrap();

        let (loss, accuracy) = tracker.finish().unwrap();
        assert!((loss - 0.5).abs() < 1e-9);
        assert!((accuracy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_tracker() {
        assert!(MetricTracker::default().finish().is_none());
    }

    #[test]
    fn test_from_config_uses_training_settings() {
        let mut config = AppConfig::default();
        config.training.num_epochs = 2;
        config.model.width_multiplier = 0.5;

        let builder = ModelBuilder::from_config(&config);
        assert_eq!(builder.training.num_epochs, 2);
        assert_eq!(builder.detector.backbone.width_multiplier, 0.5);
        assert_eq!(builder.output_model_path(), config.model.model_path.as_path());
        assert_eq!(builder.backbone_weights, config.model.backbone_weights);
        assert!(!builder.allow_random_backbone);
    }

    #[test]
    fn test_unwritable_output_dir_fails_before_data_loading() {
        let tmp = TempDir::new().unwrap();
        // 出力先の親がディレクトリではなく通常ファイル
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let output = blocker.join("models").join("detector.tar.gz");

        // データディレクトリも存在しないが、先に出力先の検査で失敗する
        let result = ModelBuilder::new(tmp.path().join("missing_data"), &output)
            .with_random_backbone(true)
            .train::<TestAutodiff, _>(Default::default(), |_| panic!("学習が開始されてはならない"));

        match result {
            Err(DetectorError::Configuration(message)) => assert!(message.contains("出力ディレクトリ")),
            other => panic!("設定エラーを期待しました: {:?}", other.map(|r| r.model_path)),
        }
        assert!(!output.exists());
    }

    #[test]
    fn test_missing_backbone_weights_require_opt_in() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("detector.tar.gz");
        let builder = ModelBuilder::new(tmp.path().join("missing_data"), &output)
            .with_backbone_weights(Some(tmp.path().join("absent.safetensors")));

        // 重みが無ければデータ読み込みより前に設定エラー
        let result = builder.train::<TestAutodiff, _>(Default::default(), |_| {});
        match result {
            Err(DetectorError::Configuration(message)) => assert!(message.contains("weights fetch")),
            other => panic!("設定エラーを期待しました: {:?}", other.map(|r| r.model_path)),
        }
        let result = builder
            .clone()
            .with_backbone_weights(None)
            .train::<TestAutodiff, _>(Default::default(), |_| {});
        assert!(matches!(result, Err(DetectorError::Configuration(_))));

        // 明示的に許可すればランダム初期化で続行し、データの検査に進む
        let result = builder
            .with_random_backbone(true)
            .train::<TestAutodiff, _>(Default::default(), |_| {});
        assert!(matches!(result, Err(DetectorError::Data(_))));
        assert!(!output.exists());
    }
}
