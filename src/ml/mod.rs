pub mod backbone;
pub mod dataset;
pub mod preprocess;
pub mod pretrained;
pub mod ml_model;
pub mod training;
pub mod inference;

pub use backbone::{BlockPart, ConvSlot, FeatureExtractor, InvertedResidualStage, MobileNetV2, MobileNetV2Config, IMAGENET_STAGES};
pub use dataset::{ImageBatch, ImageBatcher, ImageItem, ImageSubset, LabeledImageDataset, LoadFailures, NUM_CLASSES};
pub use preprocess::{PreprocessMode, PreprocessSettings, PreprocessedImage, Preprocessor, ResampleFilter, IMAGE_SIZE};
pub use pretrained::{download_weights, WeightLayout, DEFAULT_WEIGHTS_PATH, MOBILENET_V2_WEIGHTS_URL};
pub use ml_model::{ClassificationHead, ClassificationHeadConfig, DeepfakeDetector, DetectorConfig};
pub use training::{EpochMetrics, ModelBuilder, TrainingReport};
pub use inference::InferenceEngine;
