//! 画像前処理
//!
//! 任意サイズ・任意カラーモードの画像を、モデルが期待する
//! `[1, 3, 224, 224]`（NCHW、値域 [0, 1]）のテンソルデータへ変換します。
//! 学習時と推論時で同じ前処理を使うため、設定はモデルアーカイブに記録されます。

use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, DetectorResult};

/// モデル入力サイズ（正方形）
pub const IMAGE_SIZE: usize = 224;

/// 入力チャネル数（RGB）
pub const NUM_CHANNELS: usize = 3;

/// リサイズ方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessMode {
    /// アスペクト比を無視して目標サイズへ引き伸ばす
    #[default]
    Stretch,
    /// アスペクト比を保ったまま中央を切り出してから目標サイズへ縮小
    Fit,
}

/// リサンプリングフィルタ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResampleFilter {
    Nearest,
    Triangle,
    /// バイキュービック
    #[default]
    CatmullRom,
    Lanczos3,
}

impl From<ResampleFilter> for FilterType {
    fn from(filter: ResampleFilter) -> Self {
        match filter {
            ResampleFilter::Nearest => FilterType::Nearest,
            ResampleFilter::Triangle => FilterType::Triangle,
            ResampleFilter::CatmullRom => FilterType::CatmullRom,
            ResampleFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// 前処理設定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessSettings {
    /// 入力画像サイズ（正方形、ピクセル）
    pub image_size: u32,
    pub mode: PreprocessMode,
    pub filter: ResampleFilter,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            image_size: IMAGE_SIZE as u32,
            mode: PreprocessMode::default(),
            filter: ResampleFilter::default(),
        }
    }
}

/// 前処理済み画像（C, H, W の順で平坦化）
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
    pub data: Vec<f32>,
    pub size: usize,
}

impl PreprocessedImage {
    /// バッチ次元を含むテンソル形状 `[1, 3, size, size]`
    pub fn shape(&self) -> [usize; 4] {
        [1, NUM_CHANNELS, self.size, self.size]
    }
}

/// 画像前処理器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessor {
    settings: PreprocessSettings,
}

impl Preprocessor {
    pub fn new(settings: PreprocessSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PreprocessSettings {
        &self.settings
    }

    pub fn image_size(&self) -> usize {
        self.settings.image_size as usize
    }

    /// デコード済み画像を前処理
    ///
    /// 1. RGB 3チャネルへ変換
    /// 2. 目標サイズへリサイズ（すでに目標サイズならリサンプリングしない）
    /// 3. 255 で割って [0, 1] へスケーリング
    ///
    /// 幅または高さが 0 の画像は推論エラーになります。
    pub fn preprocess(&self, image: &DynamicImage) -> DetectorResult<PreprocessedImage> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::inference(
                "画像サイズが不正です",
                format!("{}x{}", image.width(), image.height()),
            ));
        }

        let size = self.settings.image_size;
        let filter: FilterType = self.settings.filter.into();

        let resized = if image.width() == size && image.height() == size {
            image.to_rgb8()
        } else {
            match self.settings.mode {
                PreprocessMode::Stretch => image.resize_exact(size, size, filter).to_rgb8(),
                PreprocessMode::Fit => image.resize_to_fill(size, size, filter).to_rgb8(),
            }
        };

        let size = size as usize;
        let hw = size * size;
        let mut data = vec![0.0f32; NUM_CHANNELS * hw];

        // HWC -> CHW
        for (i, pixel) in resized.into_raw().chunks_exact(NUM_CHANNELS).enumerate() {
            for channel in 0..NUM_CHANNELS {
                data[channel * hw + i] = pixel[channel] as f32 / 255.0;
            }
        }

        Ok(PreprocessedImage { data, size })
    }

    /// エンコード済みバイト列（PNG/JPEG など）をデコードして前処理
    pub fn preprocess_bytes(&self, bytes: &[u8]) -> DetectorResult<PreprocessedImage> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| DetectorError::inference("画像のデコードに失敗しました", e))?;
        self.preprocess(&image)
    }

    /// 画像ファイルを読み込んで前処理
    pub fn preprocess_path(&self, path: &std::path::Path) -> DetectorResult<PreprocessedImage> {
        let image = image::open(path).map_err(|e| {
            DetectorError::inference(format!("画像の読み込みに失敗しました: {}", path.display()), e)
        })?;
        self.preprocess(&image)
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(PreprocessSettings::default())
    }
}
