//! 検出モデルの定義
//!
//! 凍結したバックボーン（特徴抽出器）と学習可能な分類ヘッドの2段構成です。
//! 両者は1つの Burn レコードとしてまとめて保存されます。

use burn::{
    config::Config,
    module::Module,
    nn::{
        loss::BinaryCrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig,
    },
    tensor::{activation::sigmoid, backend::Backend, Int, Tensor},
};

use crate::ml::backbone::{FeatureExtractor, MobileNetV2, MobileNetV2Config};

/// 分類ヘッド設定
#[derive(Config, Debug)]
pub struct ClassificationHeadConfig {
    /// 入力特徴チャネル数
    pub in_features: usize,
}

impl ClassificationHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassificationHead<B> {
        ClassificationHead {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            output: LinearConfig::new(self.in_features, 1).init(device),
        }
    }
}

/// 分類ヘッド
///
/// Global Average Pooling → 全結合層（出力1、ロジット）
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    output: Linear<B>,
}

impl<B: Backend> ClassificationHead<B> {
    /// 特徴マップ [batch, C, h, w] からロジット [batch, 1] を計算
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();
        let x = self.pool.forward(features);
        let x = x.reshape([batch_size, channels]);
        self.output.forward(x)
    }
}

/// モデル設定
#[derive(Config, Debug)]
pub struct DetectorConfig {
    /// バックボーン設定
    pub backbone: MobileNetV2Config,
}

impl DetectorConfig {
    /// ImageNet 版 MobileNetV2 をバックボーンとする構成
    pub fn mobilenet_v2() -> Self {
        Self::new(MobileNetV2Config::imagenet())
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> DeepfakeDetector<B> {
        let backbone = self.backbone.init(device);
        let head = ClassificationHeadConfig::new(backbone.feature_channels()).init(device);

        DeepfakeDetector { backbone, head }
    }
}

/// 実画像/偽画像の2値分類モデル
///
/// 出力はラベル1（ソート順で後ろのクラス、通常 "real"）である確率です。
#[derive(Module, Debug)]
pub struct DeepfakeDetector<B: Backend> {
    backbone: MobileNetV2<B>,
    head: ClassificationHead<B>,
}

impl<B: Backend> DeepfakeDetector<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - ロジット [batch_size, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.extract(images);
        self.head.forward(features)
    }

    /// 確率 [batch_size, 1]（シグモイド適用後）
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images))
    }

    /// 順伝播と2値交差エントロピー損失
    ///
    /// # 戻り値
    /// - (損失, ロジット)
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let logits = self.forward(images);
        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits.clone(), targets);

        (loss, logits)
    }

    /// バックボーンを差し替える
    pub fn with_backbone(self, backbone: MobileNetV2<B>) -> Self {
        Self {
            backbone,
            head: self.head,
        }
    }

    /// バックボーンのパラメータを凍結（勾配を計算しない）
    pub fn freeze_backbone(self) -> Self {
        Self {
            backbone: self.backbone.no_grad(),
            head: self.head,
        }
    }

    pub fn backbone(&self) -> &MobileNetV2<B> {
        &self.backbone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::InvertedResidualStage;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn tiny_config() -> DetectorConfig {
        DetectorConfig::new(
            MobileNetV2Config::new(vec![InvertedResidualStage::new(2, 8, 1, 2)])
                .with_stem_channels(8)
                .with_last_channels(16),
        )
    }

    #[test]
    fn test_output_is_probability() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([3, 3, 32, 32], &device);

        let proba = model.predict_proba(images);
        assert_eq!(proba.dims(), [3, 1]);

        let values = proba.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_frozen_backbone_receives_no_gradient() {
        let device = Default::default();
        let model = tiny_config()
            .init::<TestAutodiffBackend>(&device)
            .freeze_backbone();
        let images = Tensor::<TestAutodiffBackend, 4>::ones([2, 3, 32, 32], &device);
        let targets = Tensor::<TestAutodiffBackend, 2, Int>::from_ints([[0], [1]], &device);

        let (loss, _) = model.forward_loss(images, targets);
        let grads = loss.backward();
        let grads = burn::optim::GradientsParams::from_grads(grads, &model);

        let backbone_params = model.backbone().num_params();
        assert!(backbone_params > 0);
        assert_eq!(grads.len(), 2, "出力層の重みとバイアスのみ勾配を持つ");
    }
}
