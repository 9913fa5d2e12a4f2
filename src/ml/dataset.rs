//! 学習データセット
//!
//! ルートディレクトリ直下にちょうど2つのクラスディレクトリを持つ構成を読み込みます。
//! クラス名を辞書順にソートした順序でラベルを割り当てます（先頭 = 0、2番目 = 1）。
//!
//! ```text
//! data/train/
//!   fake/  -> ラベル 0
//!   real/  -> ラベル 1
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use walkdir::WalkDir;

use crate::error::{DetectorError, DetectorResult};
use crate::ml::preprocess::{Preprocessor, NUM_CHANNELS};

/// クラス数（2値分類）
pub const NUM_CLASSES: usize = 2;

/// 学習に使用する画像の拡張子
const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// ラベル付き画像データセット
#[derive(Debug, Clone)]
pub struct LabeledImageDataset {
    root: PathBuf,
    class_names: Vec<String>,
    /// クラスごとのサンプル（パス順にソート済み）
    samples_per_class: Vec<Vec<PathBuf>>,
}

impl LabeledImageDataset {
    /// ディレクトリから学習データを読み込む
    pub fn from_directory(root: &Path) -> DetectorResult<Self> {
        if !root.is_dir() {
            return Err(DetectorError::Data(format!(
                "学習データディレクトリが存在しません: {}",
                root.display()
            )));
        }

        let mut class_names = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_str().map(str::to_string).ok_or_else(|| {
                DetectorError::Data(format!(
                    "クラスディレクトリ名が不正です: {}",
                    entry.path().display()
                ))
            })?;
            if name.starts_with('.') {
                continue;
            }
            class_names.push(name);
        }

        if class_names.is_empty() {
            return Err(DetectorError::Data(format!(
                "学習データディレクトリが空です: {}",
                root.display()
            )));
        }
        if class_names.len() != NUM_CLASSES {
            return Err(DetectorError::Data(format!(
                "クラスディレクトリはちょうど{}個必要です（検出: {}個: {}）",
                NUM_CLASSES,
                class_names.len(),
                class_names.join(", ")
            )));
        }

        // ラベルはクラス名の辞書順で決まる
        class_names.sort();

        let mut samples_per_class = Vec::with_capacity(NUM_CLASSES);
        for class_name in &class_names {
            let files = collect_images(&root.join(class_name));
            if files.is_empty() {
                return Err(DetectorError::Data(format!(
                    "クラス '{}' に画像が1枚もありません",
                    class_name
                )));
            }
            samples_per_class.push(files);
        }

        let dataset = Self {
            root: root.to_path_buf(),
            class_names,
            samples_per_class,
        };

        log::info!(
            "{} クラスから {} 枚を読み込みました",
            dataset.num_classes(),
            dataset.len()
        );
        for (label, name) in dataset.class_names.iter().enumerate() {
            log::info!(
                "  クラス {}: {} ({} 枚)",
                label,
                name,
                dataset.samples_per_class[label].len()
            );
        }

        Ok(dataset)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// ラベル順のクラス名
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラス名 -> ラベルの対応
    pub fn class_indices(&self) -> BTreeMap<String, usize> {
        self.class_names
            .iter()
            .enumerate()
            .map(|(label, name)| (name.clone(), label))
            .collect()
    }

    /// 全サンプル数
    pub fn len(&self) -> usize {
        self.samples_per_class.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// すべての画像を最後までデコードできるか検証
    ///
    /// ヘッダだけ正しく本体が壊れている画像もここで検出します。
    pub fn validate_images(&self) -> DetectorResult<()> {
        let mut invalid = Vec::new();
        for path in self.samples_per_class.iter().flatten() {
            match image::open(path) {
                Ok(image) if image.width() == 0 || image.height() == 0 => {
                    invalid.push(format!("{}: 画像サイズが 0 です", path.display()));
                }
                Ok(_) => {}
                Err(e) => invalid.push(format!("{}: {}", path.display(), e)),
            }
        }

        if invalid.is_empty() {
            Ok(())
        } else {
            Err(DetectorError::Data(format!(
                "読み込めない画像があります:\n{}",
                invalid.join("\n")
            )))
        }
    }

    /// 学習用と検証用に分割
    ///
    /// クラスごとにソート順の先頭 `floor(validation_split * n)` 枚を検証用、
    /// 残りを学習用とします（層化・決定的）。
    pub fn split(&self, validation_split: f32) -> (ImageSubset, ImageSubset) {
        let mut train = Vec::new();
        let mut valid = Vec::new();

        for (label, files) in self.samples_per_class.iter().enumerate() {
            let num_valid = (validation_split * files.len() as f32) as usize;
            for (i, path) in files.iter().enumerate() {
                let item = ImageItem {
                    path: path.clone(),
                    label,
                };
                if i < num_valid {
                    valid.push(item);
                } else {
                    train.push(item);
                }
            }
        }

        (ImageSubset { items: train }, ImageSubset { items: valid })
    }
}

/// クラスディレクトリ以下の画像を再帰的に収集（パス順）
fn collect_images(class_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(class_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_image_file(path))
        .collect();
    files.sort();
    files
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// 分割後のデータセット
#[derive(Debug, Clone, Default)]
pub struct ImageSubset {
    items: Vec<ImageItem>,
}

impl ImageSubset {
    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    /// ラベルごとの枚数
    pub fn label_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0; NUM_CLASSES];
        for item in &self.items {
            counts[item.label] += 1;
        }
        counts
    }
}

impl Dataset<ImageItem> for ImageSubset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// [batch_size, 1]
    pub targets: Tensor<B, 2, Int>,
    /// ラベル（精度計算用）
    pub labels: Vec<usize>,
}

/// バッチ作成中の画像読み込み失敗
///
/// `Batcher` は `Result` を返せないため、失敗はここに記録して学習ループ側で確認します。
#[derive(Clone, Debug, Default)]
pub struct LoadFailures(Arc<Mutex<Vec<String>>>);

impl LoadFailures {
    fn record(&self, message: String) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }

    /// 記録された失敗があれば `DetectorError::Data` を返す
    pub fn check(&self) -> DetectorResult<()> {
        let failures = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DetectorError::Data(format!(
                "学習中に画像を読み込めませんでした:\n{}",
                failures.join("\n")
            )))
        }
    }
}

/// バッチャー
///
/// 読み込みに失敗した画像はバッチから除外し、[`LoadFailures`] へ記録します。
#[derive(Clone, Debug)]
pub struct ImageBatcher<B: Backend> {
    preprocessor: Preprocessor,
    failures: LoadFailures,
    _backend: PhantomData<B>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(preprocessor: Preprocessor) -> Self {
        Self {
            preprocessor,
            failures: LoadFailures::default(),
            _backend: PhantomData,
        }
    }

    /// 読み込み失敗の記録（クローン間で共有）
    pub fn failures(&self) -> LoadFailures {
        self.failures.clone()
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let size = self.preprocessor.image_size();
        let mut all_pixels = Vec::with_capacity(items.len() * NUM_CHANNELS * size * size);
        let mut targets_vec = Vec::with_capacity(items.len());
        let mut labels = Vec::with_capacity(items.len());

        for item in items {
            match self.preprocessor.preprocess_path(&item.path) {
                Ok(image) => {
                    all_pixels.extend_from_slice(&image.data);
                    targets_vec.push(item.label as i64);
                    labels.push(item.label);
                }
                Err(e) => {
                    log::error!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    self.failures.record(format!("{}: {}", item.path.display(), e));
                }
            }
        }

        let batch_size = labels.len();
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([batch_size, NUM_CHANNELS, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device)
            .reshape([batch_size, 1]);

        ImageBatch {
            images,
            targets,
            labels,
        }
    }
}
