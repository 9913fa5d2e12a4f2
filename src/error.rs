//! エラー型の定義
//!
//! 学習（Model Builder）ではすべてのエラーが致命的、
//! 推論（Inference Engine）ではリクエスト単位で回復可能なエラーとして扱います。

use std::path::PathBuf;
use thiserror::Error;

/// 内部エラーを包むための型
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 検出器のエラー
#[derive(Debug, Error)]
pub enum DetectorError {
    /// パスや設定値が不正
    #[error("設定エラー: {0}")]
    Configuration(String),

    /// 学習データが不正または不足
    #[error("データエラー: {0}")]
    Data(String),

    /// モデルファイルが存在しない
    #[error("モデルファイルが見つかりません: {}", .0.display())]
    ModelNotFound(PathBuf),

    /// 前処理・順伝播中の失敗
    #[error("推論エラー: {context}")]
    Inference {
        context: String,
        #[source]
        source: BoxError,
    },

    /// モデルアーカイブが壊れている、またはバージョン不一致
    #[error("モデルアーカイブが不正です: {0}")]
    InvalidArtifact(String),

    /// 事前学習済み重みの取得に失敗
    #[error("ダウンロードエラー: {0}")]
    Download(String),

    /// 学習ループ中の致命的エラー
    #[error("学習エラー: {0}")]
    Training(String),

    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),
}

impl DetectorError {
    /// 原因を包んだ推論エラーを作成
    pub fn inference<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        DetectorError::Inference {
            context: context.into(),
            source: source.into(),
        }
    }

    /// リクエスト単位で回復可能なエラーかどうか
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DetectorError::Inference { .. })
    }
}

/// 検出器の結果型
pub type DetectorResult<T> = Result<T, DetectorError>;
