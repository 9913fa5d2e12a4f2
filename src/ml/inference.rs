//! モデル推論機能
//!
//! 学習済みアーカイブを1度だけ読み込み、画像ごとに REAL / FAKE を判定します。
//! 1枚の失敗（デコード失敗や順伝播中のパニック）はその画像のエラーとして返し、
//! エンジン自体は引き続き利用できます。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Mutex;

use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;

use crate::error::{DetectorError, DetectorResult};
use crate::ml::ml_model::DeepfakeDetector;
use crate::ml::preprocess::{PreprocessedImage, Preprocessor};
use crate::model::model_storage::{decode_module, load_model_with_metadata};
use crate::model::ModelMetadata;
use crate::types::ClassificationResult;

/// 学習時のクラス対応（fake = 0, real = 1）
const EXPECTED_CLASS_NAMES: [&str; 2] = ["fake", "real"];

/// 推論エンジン
///
/// 順伝播はロックで直列化されるため、`Arc` で共有して複数スレッドから呼び出せます。
pub struct InferenceEngine<B: Backend> {
    model: Mutex<DeepfakeDetector<B>>,
    metadata: ModelMetadata,
    preprocessor: Preprocessor,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> DetectorResult<Self> {
        let model_path = model_path.as_ref();
        let (metadata, model_binary) = load_model_with_metadata(model_path)?;

        if metadata.class_names != EXPECTED_CLASS_NAMES {
            log::warn!(
                "クラス名が想定と異なります: {:?}（スコアはラベル1 = {:?} の確率として扱います）",
                metadata.class_names,
                metadata.positive_class()
            );
        }

        // メタデータのネットワーク構成で初期化してから重みを復元
        let model = metadata.detector.init::<B>(&device);
        let model = decode_module(model, model_binary, &device)?;
        let preprocessor = Preprocessor::new(metadata.preprocessing);

        log::info!("モデルを読み込みました: {}", model_path.display());

        Ok(Self {
            model: Mutex::new(model),
            metadata,
            preprocessor,
            device,
        })
    }

    /// エンコード済み画像（PNG/JPEG など）を分類
    pub fn classify_bytes(&self, bytes: &[u8]) -> DetectorResult<ClassificationResult> {
        let image = self.preprocessor.preprocess_bytes(bytes)?;
        self.classify_preprocessed(&image)
    }

    /// デコード済み画像を分類
    pub fn classify_image(&self, image: &DynamicImage) -> DetectorResult<ClassificationResult> {
        let image = self.preprocessor.preprocess(image)?;
        self.classify_preprocessed(&image)
    }

    /// 画像ファイルを分類
    pub fn classify_path<P: AsRef<Path>>(&self, image_path: P) -> DetectorResult<ClassificationResult> {
        let image = self.preprocessor.preprocess_path(image_path.as_ref())?;
        self.classify_preprocessed(&image)
    }

    /// 複数画像を分類（1枚の失敗は他に影響しない）
    pub fn classify_batch<P: AsRef<Path>>(&self, image_paths: &[P]) -> Vec<DetectorResult<ClassificationResult>> {
        image_paths
            .iter()
            .map(|path| self.classify_path(path))
            .collect()
    }

    /// 前処理済み画像を分類
    pub fn classify_preprocessed(&self, image: &PreprocessedImage) -> DetectorResult<ClassificationResult> {
        let score = self.score(image)?;
        Ok(ClassificationResult::from_score(score))
    }

    /// 前処理済み画像の生スコア（real である確率）を計算
    pub fn score(&self, image: &PreprocessedImage) -> DetectorResult<f32> {
        let expected = self.preprocessor.image_size();
        if image.size != expected || image.data.len() != image.shape().iter().product::<usize>() {
            return Err(DetectorError::inference(
                "入力テンソルの形状が不正です",
                format!("size={} len={} (期待サイズ {})", image.size, image.data.len(), expected),
            ));
        }

        // ロック保持中のパニックはここで捕捉するため、ロックが汚染されることはない
        let model = self.model.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let output = catch_unwind(AssertUnwindSafe(|| {
            let tensor = Tensor::<B, 1>::from_floats(image.data.as_slice(), &self.device).reshape(image.shape());
            model.predict_proba(tensor).into_data().convert::<f32>().to_vec::<f32>()
        }));
        drop(model);

        let values = match output {
            Ok(Ok(values)) => values,
            Ok(Err(e)) => {
                return Err(DetectorError::inference(
                    "推論結果の取得に失敗しました",
                    format!("{:?}", e),
                ))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "不明なパニック".to_string());
                log::error!("順伝播中にパニックが発生しました: {}", message);
                return Err(DetectorError::inference("順伝播に失敗しました", message));
            }
        };

        match values.first() {
            Some(score) if score.is_finite() => Ok(*score),
            Some(score) => Err(DetectorError::inference(
                "モデル出力が不正です",
                format!("score={}", score),
            )),
            None => Err(DetectorError::inference("モデル出力が空です", "empty output")),
        }
    }

    /// モデルメタデータへの参照を取得
    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::{InvertedResidualStage, MobileNetV2Config};
    use crate::ml::ml_model::DetectorConfig;
    use crate::ml::preprocess::PreprocessSettings;
    use crate::model::model_storage::{encode_module, save_model_with_metadata};
    use burn_ndarray::NdArray;
    use std::sync::Arc;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn tiny_detector() -> DetectorConfig {
        let backbone = MobileNetV2Config::new(vec![InvertedResidualStage::new(1, 8, 1, 2)])
            .with_stem_channels(8)
            .with_last_channels(16);
        DetectorConfig::new(backbone)
    }

    fn write_artifact(dir: &Path, class_names: &[&str]) -> std::path::PathBuf {
        let device = Default::default();
        let detector = tiny_detector();
        let model = detector.init::<TestBackend>(&device);
        let binary = encode_module(model).unwrap();

        let preprocessing = PreprocessSettings {
            image_size: 32,
            ..PreprocessSettings::default()
        };
        let metadata = ModelMetadata::new(
            class_names.iter().map(|s| s.to_string()).collect(),
            preprocessing,
            detector,
            1,
        );
        let path = dir.join("detector.tar.gz");
        save_model_with_metadata(&path, &metadata, &binary).unwrap();
        path
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(width, height, image::Rgb([120, 60, 200])));
        let mut bytes = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_missing_model_is_not_found() {
        let result = InferenceEngine::<TestBackend>::load("/nonexistent/detector.tar.gz", Default::default());
        assert!(matches!(result, Err(DetectorError::ModelNotFound(_))));
    }

    #[test]
    fn test_classify_returns_consistent_result() {
        let tmp = TempDir::new().unwrap();
        let path = write_artifact(tmp.path(), &["fake", "real"]);
        let engine = InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap();

        let result = engine.classify_bytes(&png_bytes(50, 40)).unwrap();
        assert!((0.0..=1.0).contains(&result.raw_score));
        assert!(result.confidence_percent >= 50.0 && result.confidence_percent <= 100.0);
        assert_eq!(result, ClassificationResult::from_score(result.raw_score));
    }

    #[test]
    fn test_corrupt_bytes_do_not_break_engine() {
        let tmp = TempDir::new().unwrap();
        let path = write_artifact(tmp.path(), &["fake", "real"]);
        let engine = InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap();

        let err = engine.classify_bytes(b"not an image").unwrap_err();
        assert!(err.is_recoverable());

        // 後続のリクエストは正常に処理される
        assert!(engine.classify_bytes(&png_bytes(32, 32)).is_ok());
    }

    #[test]
    fn test_wrong_input_shape_is_inference_error() {
        let tmp = TempDir::new().unwrap();
        let path = write_artifact(tmp.path(), &["fake", "real"]);
        let engine = InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap();

        let image = PreprocessedImage {
            data: vec![0.0; 10],
            size: 32,
        };
        assert!(matches!(engine.score(&image), Err(DetectorError::Inference { .. })));
    }

    #[test]
    fn test_empty_image_is_inference_error() {
        let tmp = TempDir::new().unwrap();
        let path = write_artifact(tmp.path(), &["fake", "real"]);
        let engine = InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap();

        let empty = DynamicImage::ImageRgb8(image::RgbImage::new(0, 0));
        assert!(matches!(
            engine.classify_image(&empty),
            Err(DetectorError::Inference { .. })
        ));
        assert!(engine.classify_image(&DynamicImage::ImageRgb8(image::RgbImage::new(8, 8))).is_ok());
    }

    #[test]
    fn test_unexpected_class_names_still_load() {
        let tmp = TempDir::new().unwrap();
        let path = write_artifact(tmp.path(), &["a", "b"]);
        let engine = InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap();
        assert_eq!(engine.metadata().positive_class(), Some("b"));
    }

    #[test]
    fn test_concurrent_classification() {
        let tmp = TempDir::new().unwrap();
        let path = write_artifact(tmp.path(), &["fake", "real"]);
        let engine = Arc::new(InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap());
        let bytes = Arc::new(png_bytes(32, 32));
        let expected = engine.classify_bytes(&bytes).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let bytes = Arc::clone(&bytes);
                std::thread::spawn(move || engine.classify_bytes(&bytes).unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
