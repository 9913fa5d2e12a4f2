//! 特徴抽出器（バックボーン）
//!
//! MobileNetV2 のトポロジーを Burn で定義します。
//! 推論専用の事前学習済み重みを想定し、BatchNorm は畳み込みのバイアスへ
//! 畳み込み済み（folded）として扱います（取り込みは [`crate::ml::pretrained`]）。
//!
//! # アーキテクチャ
//! - Stem: Conv 3x3 stride 2 + ReLU6
//! - Inverted Residual ブロック x N
//!   - (拡張率 > 1 の場合) Conv 1x1 + ReLU6
//!   - Depthwise Conv 3x3 + ReLU6
//!   - Conv 1x1（線形射影）
//!   - stride 1 かつ入出力チャネルが同じ場合は残差接続
//! - Conv 1x1 + ReLU6（最終特徴チャネル）

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, DetectorResult};
use crate::ml::pretrained;
use crate::model::model_storage::decode_module;

/// 特徴抽出ステージの共通インターフェース
///
/// 画像バッチ `[batch, 3, H, W]` を特徴マップ `[batch, C, h, w]` へ変換します。
pub trait FeatureExtractor<B: Backend> {
    fn extract(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    /// 出力特徴マップのチャネル数
    fn feature_channels(&self) -> usize;
}

/// Inverted Residual ステージ設定 (t, c, n, s)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvertedResidualStage {
    /// 拡張率 t
    pub expansion: usize,
    /// 出力チャネル c（幅係数適用前）
    pub channels: usize,
    /// 繰り返し回数 n
    pub repeats: usize,
    /// 最初のブロックの stride s
    pub stride: usize,
}

impl InvertedResidualStage {
    pub const fn new(expansion: usize, channels: usize, repeats: usize, stride: usize) -> Self {
        Self {
            expansion,
            channels,
            repeats,
            stride,
        }
    }
}

/// ImageNet 版 MobileNetV2 のステージ構成
pub const IMAGENET_STAGES: [InvertedResidualStage; 7] = [
    InvertedResidualStage::new(1, 16, 1, 1),
    InvertedResidualStage::new(6, 24, 2, 2),
    InvertedResidualStage::new(6, 32, 3, 2),
    InvertedResidualStage::new(6, 64, 4, 2),
    InvertedResidualStage::new(6, 96, 3, 1),
    InvertedResidualStage::new(6, 160, 3, 2),
    InvertedResidualStage::new(6, 320, 1, 1),
];

/// バックボーン設定
#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// Inverted Residual ステージ構成
    pub stages: Vec<InvertedResidualStage>,
    /// 幅係数（alpha）
    #[config(default = 1.0)]
    pub width_multiplier: f64,
    /// Stem の出力チャネル（幅係数適用前）
    #[config(default = 32)]
    pub stem_channels: usize,
    /// 最終特徴チャネル
    #[config(default = 1280)]
    pub last_channels: usize,
}

impl MobileNetV2Config {
    /// ImageNet 事前学習モデルと同じ構成
    pub fn imagenet() -> Self {
        Self::new(IMAGENET_STAGES.to_vec())
    }

    /// 幅係数を適用したチャネル数（8の倍数に丸める）
    fn scaled(&self, channels: usize) -> usize {
        make_divisible(channels as f64 * self.width_multiplier, 8)
    }

    /// 最終特徴チャネル数（幅係数が 1.0 を超える場合のみ拡大）
    pub fn output_channels(&self) -> usize {
        if self.width_multiplier > 1.0 {
            self.scaled(self.last_channels)
        } else {
            self.last_channels
        }
    }

    /// 事前学習済み重みでバックボーンを初期化
    ///
    /// 拡張子 `.safetensors` は ImageNet 重み（timm / torchvision 形式）として取り込み、
    /// それ以外は Burn のバイナリレコードとして読み込みます。
    pub fn load_pretrained<B: Backend>(&self, path: &Path, device: &B::Device) -> DetectorResult<MobileNetV2<B>> {
        if !path.exists() {
            return Err(DetectorError::Configuration(format!(
                "事前学習済み重みファイルが存在しません: {}",
                path.display()
            )));
        }

        let backbone = self.init::<B>(device);
        if path.extension().and_then(|ext| ext.to_str()) == Some("safetensors") {
            return pretrained::import_safetensors(backbone, &self.stages, path, device);
        }

        let bytes = std::fs::read(path)?;
        decode_module(backbone, bytes, device).map_err(|e| {
            DetectorError::Configuration(format!(
                "事前学習済み重みを読み込めません ({}): {}",
                path.display(),
                e
            ))
        })
    }

    /// バックボーンを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let stem_out = self.scaled(self.stem_channels);
        let stem = conv([3, stem_out], 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut in_channels = stem_out;
        for stage in &self.stages {
            let out_channels = self.scaled(stage.channels);
            for i in 0..stage.repeats {
                let stride = if i == 0 { stage.stride } else { 1 };
                blocks.push(InvertedResidual::new(
                    in_channels,
                    out_channels,
                    stride,
                    stage.expansion,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let out_channels = self.output_channels();
        let last_conv = conv([in_channels, out_channels], 1, 1, 1, device);

        log::debug!(
            "[Backbone] MobileNetV2: alpha={}, ブロック数={}, 出力チャネル={}",
            self.width_multiplier,
            blocks.len(),
            out_channels
        );

        MobileNetV2 {
            stem,
            blocks,
            last_conv,
            out_channels,
        }
    }
}

/// `v` を `divisor` の倍数へ丸める（10% 以上小さくならないよう調整）
fn make_divisible(v: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let mut new_v = (((v + d / 2.0) / d).floor() * d).max(d);
    if new_v < 0.9 * v {
        new_v += d;
    }
    new_v as usize
}

/// 畳み込み層（BatchNorm 畳み込み済みのためバイアスあり）
fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    groups: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let padding = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_groups(groups)
        .init(device)
}

fn relu6<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clamp(0.0, 6.0)
}

/// ブロック内の畳み込みの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPart {
    Expand,
    Depthwise,
    Project,
}

/// バックボーン内の畳み込み層の位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvSlot {
    Stem,
    Block {
        /// ステージ番号
        stage: usize,
        /// ステージ内の番号
        index: usize,
        /// 通し番号
        block: usize,
        part: BlockPart,
        /// 拡張層を持つか（拡張率 > 1）
        has_expand: bool,
    },
    Head {
        num_blocks: usize,
    },
}

/// Inverted Residual ブロック
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<Conv2d<B>>,
    depthwise: Conv2d<B>,
    project: Conv2d<B>,
    use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expansion: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expansion;
        let expand = (expansion != 1).then(|| conv([in_channels, hidden], 1, 1, 1, device));

        Self {
            expand,
            depthwise: conv([hidden, hidden], 3, stride, hidden, device),
            project: conv([hidden, out_channels], 1, 1, 1, device),
            use_residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => relu6(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = relu6(self.depthwise.forward(x));
        let x = self.project.forward(x);

        if self.use_residual {
            x + input
        } else {
            x
        }
    }
}

/// MobileNetV2 特徴抽出器
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: Conv2d<B>,
    blocks: Vec<InvertedResidual<B>>,
    last_conv: Conv2d<B>,
    out_channels: usize,
}

impl<B: Backend> MobileNetV2<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - 特徴マップ [batch_size, out_channels, size / 32, size / 32]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu6(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        relu6(self.last_conv.forward(x))
    }

    /// すべての畳み込み層を位置情報つきで順に変換する
    ///
    /// `stages` は初期化に使ったステージ構成と一致している必要があります。
    pub fn map_convs<F>(self, stages: &[InvertedResidualStage], mut f: F) -> DetectorResult<Self>
    where
        F: FnMut(ConvSlot, Conv2d<B>) -> DetectorResult<Conv2d<B>>,
    {
        let Self {
            stem,
            blocks,
            last_conv,
            out_channels,
        } = self;

        let positions: Vec<(usize, usize)> = stages
            .iter()
            .enumerate()
            .flat_map(|(stage, config)| (0..config.repeats).map(move |index| (stage, index)))
            .collect();
        if positions.len() != blocks.len() {
            return Err(DetectorError::Configuration(format!(
                "ステージ構成とブロック数が一致しません: {} != {}",
                positions.len(),
                blocks.len()
            )));
        }

        let stem = f(ConvSlot::Stem, stem)?;

        let mut mapped = Vec::with_capacity(blocks.len());
        for (block_index, ((stage, index), block)) in positions.into_iter().zip(blocks).enumerate() {
            let InvertedResidual {
                expand,
                depthwise,
                project,
                use_residual,
            } = block;
            let has_expand = expand.is_some();
            let slot = |part| ConvSlot::Block {
                stage,
                index,
                block: block_index,
                part,
                has_expand,
            };

            let expand = match expand {
                Some(conv) => Some(f(slot(BlockPart::Expand), conv)?),
                None => None,
            };
            let depthwise = f(slot(BlockPart::Depthwise), depthwise)?;
            let project = f(slot(BlockPart::Project), project)?;
            mapped.push(InvertedResidual {
                expand,
                depthwise,
                project,
                use_residual,
            });
        }

        let num_blocks = mapped.len();
        let last_conv = f(ConvSlot::Head { num_blocks }, last_conv)?;

        Ok(Self {
            stem,
            blocks: mapped,
            last_conv,
            out_channels,
        })
    }
}

impl<B: Backend> FeatureExtractor<B> for MobileNetV2<B> {
    fn extract(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(images)
    }

    fn feature_channels(&self) -> usize {
        self.out_channels
    }
}
