//! ImageNet 事前学習済み重みの取り込み
//!
//! timm / torchvision 形式の MobileNetV2 safetensors を読み込み、BatchNorm を直前の
//! 畳み込みへ畳み込んでバックボーンへ設定します。ImageNet の入力正規化（mean / std）も
//! Stem の畳み込みへ畳み込むため、取り込んだバックボーンは [0, 1] の画素値をそのまま受け取ります。
//!
//! # safetensors の構造
//! ```text
//! [u64 LE: ヘッダ長][JSON ヘッダ: name -> {dtype, shape, data_offsets}][テンソルデータ]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::{
    module::Param,
    nn::conv::Conv2d,
    tensor::{backend::Backend, Tensor, TensorData},
};
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::error::{DetectorError, DetectorResult};
use crate::ml::backbone::{BlockPart, ConvSlot, InvertedResidualStage, MobileNetV2};

/// timm の MobileNetV2 (alpha = 1.0) ImageNet 重み
pub const MOBILENET_V2_WEIGHTS_URL: &str =
    "https://huggingface.co/timm/mobilenetv2_100.ra_in1k/resolve/main/model.safetensors";

/// 重みの既定の保存先
pub const DEFAULT_WEIGHTS_PATH: &str = "models/mobilenetv2_100.safetensors";

/// PyTorch BatchNorm2d の既定値
const BN_EPS: f32 = 1e-5;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// ヘッダ内のテンソル情報
#[derive(Debug, Clone, Deserialize)]
struct TensorEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// f32 へ変換済みのテンソル
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// 読み込んだ safetensors ファイル
///
/// テンソルは要求された時点で f32 へ変換します（`num_batches_tracked` など
/// 使わない整数テンソルが含まれていても読み込みは失敗しない）。
#[derive(Debug)]
pub struct SafeTensors {
    entries: BTreeMap<String, TensorEntry>,
    data: Vec<u8>,
}

impl SafeTensors {
    pub fn read(path: &Path) -> DetectorResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(bytes).map_err(|e| {
            DetectorError::Configuration(format!(
                "safetensors を解析できません ({}): {}",
                path.display(),
                e
            ))
        })
    }

    fn parse(mut bytes: Vec<u8>) -> Result<Self, String> {
        let header_len = bytes
            .get(..8)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_le_bytes)
            .ok_or("ファイルが短すぎます")?;
        let data_start = usize::try_from(header_len)
            .ok()
            .and_then(|len| len.checked_add(8))
            .filter(|&end| end <= bytes.len())
            .ok_or("ヘッダがファイル末尾を超えています")?;

        let header: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(&bytes[8..data_start]).map_err(|e| format!("ヘッダの JSON が不正です: {}", e))?;

        let mut entries = BTreeMap::new();
        for (name, value) in header {
            if name == "__metadata__" {
                continue;
            }
            let entry: TensorEntry = serde_json::from_value(value).map_err(|e| format!("{}: {}", name, e))?;
            entries.insert(name, entry);
        }

        let data = bytes.split_off(data_start);
        Ok(Self { entries, data })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 名前を指定して f32 テンソルを取得
    pub fn tensor(&self, name: &str) -> DetectorResult<RawTensor> {
        let entry = self.entries.get(name).ok_or_else(|| {
            DetectorError::Configuration(format!("事前学習済み重みにテンソル {} がありません", name))
        })?;
        if entry.dtype != "F32" {
            return Err(DetectorError::Configuration(format!(
                "{}: 未対応のデータ型 {}（F32 のみ対応）",
                name, entry.dtype
            )));
        }

        let [start, end] = entry.data_offsets;
        let numel: usize = entry.shape.iter().product();
        let raw = self
            .data
            .get(start..end)
            .filter(|raw| raw.len() == numel * 4)
            .ok_or_else(|| DetectorError::Configuration(format!("{}: データ範囲が不正です", name)))?;

        let data = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(RawTensor {
            shape: entry.shape.clone(),
            data,
        })
    }
}

/// 重みファイルのキー命名規則
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// timm `mobilenetv2_*`
    Timm,
    /// torchvision `mobilenet_v2`
    Torchvision,
}

impl WeightLayout {
    pub fn detect(tensors: &SafeTensors) -> DetectorResult<Self> {
        if tensors.contains("conv_stem.weight") {
            Ok(WeightLayout::Timm)
        } else if tensors.contains("features.0.0.weight") {
            Ok(WeightLayout::Torchvision)
        } else {
            Err(DetectorError::Configuration(
                "MobileNetV2 の重みとして認識できません（timm / torchvision 形式のみ対応）".to_string(),
            ))
        }
    }

    /// 畳み込み層と対応する BatchNorm のキー接頭辞
    pub fn keys(self, slot: ConvSlot) -> (String, String) {
        match self {
            WeightLayout::Timm => match slot {
                ConvSlot::Stem => ("conv_stem".into(), "bn1".into()),
                ConvSlot::Block {
                    stage,
                    index,
                    part,
                    has_expand,
                    ..
                } => {
                    let (conv, bn) = match (has_expand, part) {
                        (false, BlockPart::Depthwise) => ("conv_dw", "bn1"),
                        (false, _) => ("conv_pw", "bn2"),
                        (true, BlockPart::Expand) => ("conv_pw", "bn1"),
                        (true, BlockPart::Depthwise) => ("conv_dw", "bn2"),
                        (true, BlockPart::Project) => ("conv_pwl", "bn3"),
                    };
                    (
                        format!("blocks.{}.{}.{}", stage, index, conv),
                        format!("blocks.{}.{}.{}", stage, index, bn),
                    )
                }
                ConvSlot::Head { .. } => ("conv_head".into(), "bn2".into()),
            },
            WeightLayout::Torchvision => match slot {
                ConvSlot::Stem => ("features.0.0".into(), "features.0.1".into()),
                ConvSlot::Block {
                    block,
                    part,
                    has_expand,
                    ..
                } => {
                    let (conv, bn) = match (has_expand, part) {
                        (false, BlockPart::Depthwise) => ("conv.0.0", "conv.0.1"),
                        (false, _) => ("conv.1", "conv.2"),
                        (true, BlockPart::Expand) => ("conv.0.0", "conv.0.1"),
                        (true, BlockPart::Depthwise) => ("conv.1.0", "conv.1.1"),
                        (true, BlockPart::Project) => ("conv.2", "conv.3"),
                    };
                    (
                        format!("features.{}.{}", block + 1, conv),
                        format!("features.{}.{}", block + 1, bn),
                    )
                }
                ConvSlot::Head { num_blocks } => (
                    format!("features.{}.0", num_blocks + 1),
                    format!("features.{}.1", num_blocks + 1),
                ),
            },
        }
    }
}

/// BatchNorm を畳み込み済みの重みとバイアス
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedConv {
    pub weight: RawTensor,
    pub bias: Vec<f32>,
}

/// BatchNorm を畳み込みへ畳み込む
///
/// `w' = w * γ / sqrt(var + eps)`, `b' = β - mean * γ / sqrt(var + eps)`
pub fn fold_batch_norm(
    weight: RawTensor,
    gamma: &[f32],
    beta: &[f32],
    mean: &[f32],
    var: &[f32],
    eps: f32,
) -> DetectorResult<FoldedConv> {
    let out_channels = weight.shape.first().copied().unwrap_or(0);
    if out_channels == 0 || [gamma, beta, mean, var].iter().any(|v| v.len() != out_channels) {
        return Err(DetectorError::Configuration(format!(
            "BatchNorm のチャネル数が畳み込みと一致しません（出力チャネル {}）",
            out_channels
        )));
    }

    let per_channel = weight.data.len() / out_channels;
    if per_channel == 0 || weight.data.len() % out_channels != 0 {
        return Err(DetectorError::Configuration(format!(
            "畳み込みの重みが不正です: shape={:?}",
            weight.shape
        )));
    }
    let mut data = weight.data;
    let mut bias = Vec::with_capacity(out_channels);
    for (c, chunk) in data.chunks_mut(per_channel).enumerate() {
        let scale = gamma[c] / (var[c] + eps).sqrt();
        chunk.iter_mut().for_each(|w| *w *= scale);
        bias.push(beta[c] - mean[c] * scale);
    }

    Ok(FoldedConv {
        weight: RawTensor {
            shape: weight.shape,
            data,
        },
        bias,
    })
}

/// ImageNet の入力正規化を Stem の畳み込みへ畳み込む
///
/// 境界のゼロパディングは正規化前の 0 に対応するため、画像端の出力はわずかに異なります。
fn fold_input_normalization(conv: &mut FoldedConv) -> DetectorResult<()> {
    let [out_channels, in_channels, kh, kw] = <[usize; 4]>::try_from(conv.weight.shape.as_slice())
        .map_err(|_| DetectorError::Configuration("Stem の重みは4次元である必要があります".to_string()))?;
    if in_channels != IMAGENET_MEAN.len() {
        return Err(DetectorError::Configuration(format!(
            "Stem の入力チャネル数が不正です: {}",
            in_channels
        )));
    }

    let kernel = kh * kw;
    for o in 0..out_channels {
        let mut shift = 0.0;
        for c in 0..in_channels {
            let start = (o * in_channels + c) * kernel;
            for w in &mut conv.weight.data[start..start + kernel] {
                *w /= IMAGENET_STD[c];
                shift += *w * IMAGENET_MEAN[c];
            }
        }
        conv.bias[o] -= shift;
    }
    Ok(())
}

/// safetensors の ImageNet 重みをバックボーンへ設定
pub fn import_safetensors<B: Backend>(
    backbone: MobileNetV2<B>,
    stages: &[InvertedResidualStage],
    path: &Path,
    device: &B::Device,
) -> DetectorResult<MobileNetV2<B>> {
    let tensors = SafeTensors::read(path)?;
    let layout = WeightLayout::detect(&tensors)?;
    log::info!(
        "ImageNet 重みを取り込みます: {} ({:?} 形式, テンソル数 {})",
        path.display(),
        layout,
        tensors.len()
    );

    let mut imported = 0usize;
    let backbone = backbone.map_convs(stages, |slot, conv| {
        let (conv_key, bn_key) = layout.keys(slot);
        let bn = |name: &str| tensors.tensor(&format!("{}.{}", bn_key, name)).map(|t| t.data);

        let mut folded = fold_batch_norm(
            tensors.tensor(&format!("{}.weight", conv_key))?,
            &bn("weight")?,
            &bn("bias")?,
            &bn("running_mean")?,
            &bn("running_var")?,
            BN_EPS,
        )?;
        if slot == ConvSlot::Stem {
            fold_input_normalization(&mut folded)?;
        }

        imported += 1;
        assign_conv(conv, folded, device)
            .map_err(|e| DetectorError::Configuration(format!("{}: {}", conv_key, e)))
    })?;

    log::info!("畳み込み層 {} 個の重みを設定しました", imported);
    Ok(backbone)
}

fn assign_conv<B: Backend>(mut conv: Conv2d<B>, folded: FoldedConv, device: &B::Device) -> DetectorResult<Conv2d<B>> {
    let expected = conv.weight.val().dims();
    if folded.weight.shape != expected {
        return Err(DetectorError::Configuration(format!(
            "重みの形状が一致しません: {:?} != {:?}",
            folded.weight.shape, expected
        )));
    }

    let bias_len = folded.bias.len();
    conv.weight = Param::from_tensor(Tensor::from_data(TensorData::new(folded.weight.data, expected), device));
    conv.bias = Some(Param::from_tensor(Tensor::from_data(
        TensorData::new(folded.bias, [bias_len]),
        device,
    )));
    Ok(conv)
}

/// 事前学習済み重みをダウンロード
///
/// `.part` ファイルへ書き込み、取り込み可能な形式であることを確認してから配置します。
/// 戻り値はダウンロードしたバイト数です。
pub async fn download_weights(url: &str, dest: &Path) -> DetectorResult<u64> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    log::info!("事前学習済み重みをダウンロードします: {}", url);
    let response = reqwest::get(url)
        .await
        .map_err(|e| DetectorError::Download(format!("{}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(DetectorError::Download(format!("{}: HTTP {}", url, response.status())));
    }

    let total_size = response.content_length().unwrap_or(0);
    let partial = partial_path(dest);
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut stream = response.bytes_stream();
    let mut downloaded = 0u64;
    let mut last_logged = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(DetectorError::Download(format!("{}: {}", url, e)));
            }
        };
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if total_size > 0 {
            let progress = downloaded * 100 / total_size;
            if progress >= last_logged + 10 {
                log::info!("ダウンロード中: {}%", progress);
                last_logged = progress;
            }
        }
    }
    file.flush().await?;
    drop(file);

    let check = partial.clone();
    let verified = tokio::task::spawn_blocking(move || {
        let tensors = SafeTensors::read(&check)?;
        WeightLayout::detect(&tensors)
    })
    .await
    .map_err(|e| DetectorError::Download(format!("検証タスクが失敗しました: {}", e)))?;
    if let Err(e) = verified {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }

    tokio::fs::rename(&partial, dest).await?;
    log::info!("保存しました: {} ({} bytes)", dest.display(), downloaded);
    Ok(downloaded)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::MobileNetV2Config;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> MobileNetV2Config {
        MobileNetV2Config::new(vec![
            InvertedResidualStage::new(1, 8, 1, 2),
            InvertedResidualStage::new(2, 8, 2, 2),
        ])
        .with_stem_channels(8)
        .with_last_channels(16)
    }

    enum Value {
        F32(Vec<f32>),
        I64(i64),
    }

    fn write_safetensors(path: &Path, tensors: Vec<(String, Vec<usize>, Value)>) {
        let mut header = serde_json::Map::new();
        header.insert("__metadata__".into(), serde_json::json!({ "format": "pt" }));
        let mut data = Vec::new();
        for (name, shape, value) in tensors {
            let start = data.len();
            let dtype = match value {
                Value::F32(values) => {
                    values.iter().for_each(|v| data.extend_from_slice(&v.to_le_bytes()));
                    "F32"
                }
                Value::I64(v) => {
                    data.extend_from_slice(&v.to_le_bytes());
                    "I64"
                }
            };
            header.insert(
                name,
                serde_json::json!({ "dtype": dtype, "shape": shape, "data_offsets": [start, data.len()] }),
            );
        }
        let header = serde_json::to_vec(&serde_json::Value::Object(header)).unwrap();

        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&data);
        std::fs::write(path, bytes).unwrap();
    }

    /// 畳み込みの重みは 0、BatchNorm は β = 1（出力がすべてバイアス 1 になる）
    fn synthetic_weights(config: &MobileNetV2Config, layout: WeightLayout) -> Vec<(String, Vec<usize>, Value)> {
        let device = Default::default();
        let mut slots = Vec::new();
        config
            .init::<TestBackend>(&device)
            .map_convs(&config.stages, |slot, conv| {
                slots.push((slot, conv.weight.val().dims()));
                Ok(conv)
            })
            .unwrap();

        let mut tensors = Vec::new();
        for (slot, dims) in slots {
            let (conv, bn) = layout.keys(slot);
            let numel = dims.iter().product();
            let out = dims[0];
            tensors.push((format!("{}.weight", conv), dims.to_vec(), Value::F32(vec![0.0; numel])));
            for (name, value) in [("weight", 1.0), ("bias", 1.0), ("running_mean", 0.0), ("running_var", 1.0)] {
                tensors.push((format!("{}.{}", bn, name), vec![out], Value::F32(vec![value; out])));
            }
            tensors.push((format!("{}.num_batches_tracked", bn), vec![], Value::I64(100)));
        }
        tensors
    }

    #[test]
    fn test_fold_batch_norm() {
        let weight = RawTensor {
            shape: vec![2, 1, 1, 2],
            data: vec![1.0, 2.0, 3.0, 4.0],
        };
        let folded = fold_batch_norm(weight, &[2.0, 1.0], &[0.5, 0.0], &[1.0, 2.0], &[4.0, 0.25], 0.0).unwrap();

        // scale = [2 / 2, 1 / 0.5] = [1, 2]
        assert_eq!(folded.weight.data, vec![1.0, 2.0, 6.0, 8.0]);
        assert_eq!(folded.bias, vec![0.5 - 1.0, -4.0]);
    }

    #[test]
    fn test_fold_batch_norm_channel_mismatch() {
        let weight = RawTensor {
            shape: vec![2, 1, 1, 1],
            data: vec![1.0, 1.0],
        };
        let result = fold_batch_norm(weight, &[1.0], &[0.0], &[0.0], &[1.0], BN_EPS);
        assert!(matches!(result, Err(DetectorError::Configuration(_))));
    }

    #[test]
    fn test_input_normalization_fold_matches_normalized_input() {
        // 1x1 カーネル、出力1チャネル
        let mut conv = FoldedConv {
            weight: RawTensor {
                shape: vec![1, 3, 1, 1],
                data: vec![0.5, -1.0, 2.0],
            },
            bias: vec![0.25],
        };
        let pixel = [0.2f32, 0.7, 0.9];
        let expected: f32 = (0..3)
            .map(|c| conv.weight.data[c] * (pixel[c] - IMAGENET_MEAN[c]) / IMAGENET_STD[c])
            .sum::<f32>()
            + 0.25;

        fold_input_normalization(&mut conv).unwrap();
        let actual: f32 = (0..3).map(|c| conv.weight.data[c] * pixel[c]).sum::<f32>() + conv.bias[0];
        assert!((actual - expected).abs() < 1e-5);
    }

    #[test]
    fn test_layout_keys() {
        let expand = ConvSlot::Block {
            stage: 1,
            index: 1,
            block: 2,
            part: BlockPart::Project,
            has_expand: true,
        };
        assert_eq!(
            WeightLayout::Timm.keys(expand),
            ("blocks.1.1.conv_pwl".to_string(), "blocks.1.1.bn3".to_string())
        );
        assert_eq!(
            WeightLayout::Torchvision.keys(expand),
            ("features.3.conv.2".to_string(), "features.3.conv.3".to_string())
        );
        assert_eq!(
            WeightLayout::Torchvision.keys(ConvSlot::Head { num_blocks: 17 }),
            ("features.18.0".to_string(), "features.18.1".to_string())
        );
    }

    #[test]
    fn test_import_sets_folded_weights() {
        let tmp = TempDir::new().unwrap();
        let config = tiny_config();
        let device = Default::default();

        for layout in [WeightLayout::Timm, WeightLayout::Torchvision] {
            let path = tmp.path().join(format!("{:?}.safetensors", layout));
            write_safetensors(&path, synthetic_weights(&config, layout));

            let backbone = config.load_pretrained::<TestBackend>(&path, &device).unwrap();
            let images = Tensor::<TestBackend, 4>::random(
                [2, 3, 32, 32],
                burn::tensor::Distribution::Uniform(0.0, 1.0),
                &device,
            );
            let features = backbone
                .forward(images)
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .unwrap();

            // すべての畳み込み出力がバイアス ≈ 1 になる（入力に依存しない）
            assert_eq!(features.len(), 2 * 16 * 4 * 4);
            assert!(features.iter().all(|v| (v - 1.0).abs() < 1e-3), "{:?}", layout);
        }
    }

    #[test]
    fn test_missing_tensor_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let config = tiny_config();
        let path = tmp.path().join("weights.safetensors");
        let tensors = synthetic_weights(&config, WeightLayout::Timm)
            .into_iter()
            .filter(|(name, _, _)| name != "conv_head.weight")
            .collect();
        write_safetensors(&path, tensors);

        let err = config
            .load_pretrained::<TestBackend>(&path, &Default::default())
            .unwrap_err();
        assert!(matches!(err, DetectorError::Configuration(_)));
        assert!(err.to_string().contains("conv_head.weight"));
    }

    #[test]
    fn test_topology_mismatch_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("weights.safetensors");
        write_safetensors(&path, synthetic_weights(&tiny_config(), WeightLayout::Timm));

        let wider = tiny_config().with_last_channels(32);
        let result = wider.load_pretrained::<TestBackend>(&path, &Default::default());
        assert!(matches!(result, Err(DetectorError::Configuration(_))));
    }

    #[test]
    fn test_unknown_layout_and_broken_header() {
        let tmp = TempDir::new().unwrap();
        let unknown = tmp.path().join("unknown.safetensors");
        write_safetensors(&unknown, vec![("fc.weight".into(), vec![1], Value::F32(vec![1.0]))]);
        let tensors = SafeTensors::read(&unknown).unwrap();
        assert_eq!(tensors.len(), 1);
        assert!(WeightLayout::detect(&tensors).is_err());

        let broken = tmp.path().join("broken.safetensors");
        std::fs::write(&broken, [0xff; 12]).unwrap();
        assert!(matches!(
            SafeTensors::read(&broken),
            Err(DetectorError::Configuration(_))
        ));
    }

    #[test]
    fn test_non_f32_tensor_is_rejected_on_access() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("weights.safetensors");
        write_safetensors(&path, vec![("bn1.num_batches_tracked".into(), vec![], Value::I64(3))]);

        let tensors = SafeTensors::read(&path).unwrap();
        assert!(matches!(
            tensors.tensor("bn1.num_batches_tracked"),
            Err(DetectorError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_download_failure_leaves_no_file() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("weights").join("mobilenet.safetensors");

        let result = download_weights("http://127.0.0.1:9/model.safetensors", &dest).await;
        assert!(matches!(result, Err(DetectorError::Download(_))));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
