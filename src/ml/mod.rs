pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod training;

pub use dataset::{load_arrays, DatasetError, FaceArrays, FaceBatch, FaceBatcher, FaceDataset, FaceItem};
pub use inference::{load_classifier, load_grayscale_image, InferenceEngine, Prediction};
pub use ml_model::{
    EngagementClassifier, LayerKind, LayerParams, ModelConfig, RawTensor, IMAGE_SIZE, MIN_IMAGE_SIZE,
    NUM_CLASSES,
};
pub use training::{evaluate, model_to_bytes, train_model, Evaluation, TrainingReport};
