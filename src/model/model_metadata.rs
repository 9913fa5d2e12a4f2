//! モデルメタデータの定義
//!
//! モデルアーカイブ（tar.gz）内の `metadata.json` として保存され、
//! 推論時にネットワーク構成と前処理を復元するために使用します。

use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, DetectorResult};
use crate::ml::ml_model::DetectorConfig;
use crate::ml::preprocess::PreprocessSettings;
use crate::ml::training::EpochMetrics;

/// アーカイブ形式のバージョン
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バックボーン + 分類ヘッド）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// アーカイブ形式のバージョン
    pub format_version: u32,

    /// ラベル順のクラス名
    /// 例: ["fake", "real"]（fake = 0, real = 1）
    pub class_names: Vec<String>,

    /// 学習時の前処理（推論でも同じものを使う）
    pub preprocessing: PreprocessSettings,

    /// ネットワーク構成
    pub detector: DetectorConfig,

    /// 学習エポック数
    pub num_epochs: u32,

    /// 学習用サンプル数
    #[serde(default)]
    pub num_train_samples: usize,

    /// 検証用サンプル数
    #[serde(default)]
    pub num_valid_samples: usize,

    /// 最終エポックの指標
    #[serde(default)]
    pub final_metrics: Option<EpochMetrics>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        preprocessing: PreprocessSettings,
        detector: DetectorConfig,
        num_epochs: u32,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            class_names,
            preprocessing,
            detector,
            num_epochs,
            num_train_samples: 0,
            num_valid_samples: 0,
            final_metrics: None,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> DetectorResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            DetectorError::InvalidArtifact(format!("メタデータのシリアライズに失敗しました: {}", e))
        })
    }

    /// JSON文字列からメタデータを生成（バージョンを検証）
    pub fn from_json_string(json: &str) -> DetectorResult<Self> {
        let metadata: Self = serde_json::from_str(json).map_err(|e| {
            DetectorError::InvalidArtifact(format!("metadata.json を解析できません: {}", e))
        })?;

        if metadata.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(DetectorError::InvalidArtifact(format!(
                "未対応のアーカイブバージョンです: {} (対応: {})",
                metadata.format_version, ARTIFACT_FORMAT_VERSION
            )));
        }

        Ok(metadata)
    }

    /// ラベル1（スコアが高いほど該当）のクラス名
    pub fn positive_class(&self) -> Option<&str> {
        self.class_names.get(1).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelMetadata {
        ModelMetadata::new(
            vec!["fake".to_string(), "real".to_string()],
            PreprocessSettings::default(),
            DetectorConfig::mobilenet_v2(),
            5,
        )
    }

    #[test]
    fn test_json_round_trip_keeps_topology() {
        let metadata = sample();
        let restored = ModelMetadata::from_json_string(&metadata.to_json_string().unwrap()).unwrap();

        assert_eq!(restored.class_names, metadata.class_names);
        assert_eq!(restored.preprocessing, metadata.preprocessing);
        assert_eq!(restored.detector.backbone.stages.len(), 7);
        assert_eq!(restored.positive_class(), Some("real"));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut metadata = sample();
        metadata.format_version = ARTIFACT_FORMAT_VERSION + 1;
        let json = serde_json::to_string(&metadata).unwrap();

        assert!(matches!(
            ModelMetadata::from_json_string(&json),
            Err(DetectorError::InvalidArtifact(_))
        ));
    }
}
