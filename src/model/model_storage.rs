//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、前処理、ネットワーク構成など）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! 書き込みは同じディレクトリの一時ファイルへ行ってからリネームするため、
//! 読み込み側が書きかけのファイルを見ることはありません。

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tempfile::NamedTempFile;

use crate::error::{DetectorError, DetectorResult};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

type WeightsRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// モジュールの重みをバイト列へシリアライズ（f32精度）
pub fn encode_module<B: Backend, M: Module<B>>(module: M) -> DetectorResult<Vec<u8>> {
    let recorder = WeightsRecorder::default();
    <WeightsRecorder as Recorder<B>>::record(&recorder, module.into_record(), ()).map_err(|e| {
        DetectorError::InvalidArtifact(format!("モデル重みのシリアライズに失敗しました: {:?}", e))
    })
}

/// バイト列から重みを復元してモジュールへ読み込む
pub fn decode_module<B: Backend, M: Module<B>>(
    module: M,
    bytes: Vec<u8>,
    device: &B::Device,
) -> DetectorResult<M> {
    let recorder = WeightsRecorder::default();
    let record = <WeightsRecorder as Recorder<B>>::load(&recorder, bytes, device).map_err(|e| {
        DetectorError::InvalidArtifact(format!("モデル重みの読み込みエラー: {:?}", e))
    })?;
    Ok(module.load_record(record))
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> DetectorResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;
    Ok(())
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 出力先の親ディレクトリが存在しない場合は作成します。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> DetectorResult<()> {
    let parent = match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| {
        DetectorError::Configuration(format!(
            "出力ディレクトリを作成できません ({}): {}",
            parent.display(),
            e
        ))
    })?;

    let temp_file = NamedTempFile::new_in(parent)?;
    {
        let encoder = GzEncoder::new(temp_file.as_file(), Compression::default());
        let mut tar_builder = Builder::new(encoder);

        let json_str = metadata.to_json_string()?;
        append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
        append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

        // tarアーカイブとgzipストリームを完成させる
        tar_builder.into_inner()?.finish()?;
    }
    temp_file.as_file().sync_all()?;
    temp_file
        .persist(output_path)
        .map_err(|e| DetectorError::Io(e.error))?;

    log::info!(
        "モデルを保存しました: {} ({:.2} MB)",
        output_path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    Ok(())
}

fn open_archive(tar_gz_path: &Path) -> DetectorResult<Archive<GzDecoder<File>>> {
    if !tar_gz_path.exists() {
        return Err(DetectorError::ModelNotFound(tar_gz_path.to_path_buf()));
    }
    let tar_gz_file = File::open(tar_gz_path)?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

fn corrupt(tar_gz_path: &Path, e: impl std::fmt::Display) -> DetectorError {
    DetectorError::InvalidArtifact(format!("{}: {}", tar_gz_path.display(), e))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> DetectorResult<ModelMetadata> {
    let mut archive = open_archive(tar_gz_path)?;

    for entry in archive.entries().map_err(|e| corrupt(tar_gz_path, e))? {
        let mut entry = entry.map_err(|e| corrupt(tar_gz_path, e))?;
        let path = entry.path().map_err(|e| corrupt(tar_gz_path, e))?;

        if path.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry
                .read_to_string(&mut json_str)
                .map_err(|e| corrupt(tar_gz_path, e))?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }

    Err(corrupt(tar_gz_path, "metadata.json がありません"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> DetectorResult<(ModelMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries().map_err(|e| corrupt(tar_gz_path, e))? {
        let mut entry = entry.map_err(|e| corrupt(tar_gz_path, e))?;
        let path = entry.path().map_err(|e| corrupt(tar_gz_path, e))?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry
                    .read_to_string(&mut json_str)
                    .map_err(|e| corrupt(tar_gz_path, e))?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry
                    .read_to_end(&mut buffer)
                    .map_err(|e| corrupt(tar_gz_path, e))?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(corrupt(tar_gz_path, "metadata.json がありません")),
        (_, None) => Err(corrupt(tar_gz_path, "model.bin がありません")),
    }
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("形式バージョン: {}", metadata.format_version);
    for (label, name) in metadata.class_names.iter().enumerate() {
        println!("クラス {}: {}", label, name);
    }
    println!(
        "入力サイズ: {0}x{0} ({1:?}, {2:?})",
        metadata.preprocessing.image_size, metadata.preprocessing.mode, metadata.preprocessing.filter
    );
    println!(
        "バックボーン: MobileNetV2 (alpha={}, 出力チャネル={})",
        metadata.detector.backbone.width_multiplier,
        metadata.detector.backbone.output_channels()
    );
    println!("学習エポック数: {}", metadata.num_epochs);
    println!(
        "サンプル数: 学習 {} / 検証 {}",
        metadata.num_train_samples, metadata.num_valid_samples
    );
    if let Some(metrics) = &metadata.final_metrics {
        println!(
            "最終指標: loss={:.4} acc={:.2}%",
            metrics.train_loss,
            metrics.train_accuracy * 100.0
        );
        if let (Some(valid_loss), Some(valid_accuracy)) = (metrics.valid_loss, metrics.valid_accuracy) {
            println!(
                "検証指標: val_loss={:.4} val_acc={:.2}%",
                valid_loss,
                valid_accuracy * 100.0
            );
        }
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}
