//! 非同期サービス層
//!
//! 読み込み済みの推論エンジンを共有し、ブロッキング処理を tokio の
//! ブロッキングスレッドプールで実行します。UI などの呼び出し側はこの層を
//! 通してエンジンを利用します。

use std::path::PathBuf;
use std::sync::Arc;

use burn::tensor::backend::{AutodiffBackend, Backend};
use tokio::task;

use crate::error::{DetectorError, DetectorResult};
use crate::ml::inference::InferenceEngine;
use crate::ml::training::{EpochMetrics, ModelBuilder, TrainingReport};
use crate::model::ModelMetadata;
use crate::types::ClassificationResult;

/// 検出サービス
///
/// クローンしても読み込み済みモデルは共有されます。
pub struct DetectorService<B: Backend> {
    engine: Arc<InferenceEngine<B>>,
}

impl<B: Backend> Clone for DetectorService<B> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<B: Backend> DetectorService<B> {
    /// 読み込み済みエンジンから作成
    pub fn new(engine: InferenceEngine<B>) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// 別スレッドでモデルを読み込んでサービスを作成
    pub async fn load(model_path: PathBuf, device: B::Device) -> DetectorResult<Self> {
        let engine = task::spawn_blocking(move || InferenceEngine::<B>::load(&model_path, device))
            .await
            .map_err(|e| DetectorError::Configuration(format!("モデル読み込みタスクが異常終了しました: {}", e)))??;

        Ok(Self::new(engine))
    }

    /// エンコード済み画像を分類
    pub async fn classify(&self, bytes: Vec<u8>) -> DetectorResult<ClassificationResult> {
        let engine = Arc::clone(&self.engine);
        task::spawn_blocking(move || engine.classify_bytes(&bytes))
            .await
            .map_err(|e| DetectorError::inference("推論タスクが異常終了しました", e))?
    }

    /// 画像ファイルを分類
    pub async fn classify_path(&self, image_path: PathBuf) -> DetectorResult<ClassificationResult> {
        let engine = Arc::clone(&self.engine);
        task::spawn_blocking(move || engine.classify_path(&image_path))
            .await
            .map_err(|e| DetectorError::inference("推論タスクが異常終了しました", e))?
    }

    pub fn metadata(&self) -> &ModelMetadata {
        self.engine.metadata()
    }

    pub fn engine(&self) -> &Arc<InferenceEngine<B>> {
        &self.engine
    }
}

/// モデル学習を別スレッドで実行（非同期）
pub async fn train_in_background<B, F>(
    builder: ModelBuilder,
    device: B::Device,
    progress_callback: F,
) -> DetectorResult<TrainingReport>
where
    B: AutodiffBackend,
    F: FnMut(&EpochMetrics) + Send + 'static,
{
    task::spawn_blocking(move || builder.train::<B, F>(device, progress_callback))
        .await
        .map_err(|e| DetectorError::Training(format!("学習タスクが異常終了しました: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    #[tokio::test]
    async fn test_load_missing_model() {
        let result =
            DetectorService::<NdArray<f32>>::load(PathBuf::from("/nonexistent/detector.tar.gz"), Default::default())
                .await;
        assert!(matches!(result, Err(DetectorError::ModelNotFound(_))));
    }
}
