//! openWakeWord engine over ONNX Runtime
//!
//! Each 80 ms frame goes through a shared melspectrogram model. The last 76
//! mel frames feed a shared speech-embedding model. Each keyword's classifier
//! then scores the last 16 embeddings.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use ndarray::{Array, Array2, Array3, Array4, ArrayD, Dimension};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::wake_word::{EngineFactory, FrameSpec, WakeSettings, WakeWordEngine};
use crate::{Error, Result};

const SAMPLE_RATE: u32 = 16_000;
const FRAME_LENGTH: usize = 1280;

const MEL_BINS: usize = 32;
const EMBEDDING_WINDOW: usize = 76;
const EMBEDDING_DIM: usize = 96;
const CLASSIFICATION_FRAMES: usize = 16;
const MAX_EMBEDDINGS: usize = 120;

/// Predictions forced to zero while the buffers fill with real audio
const WARMUP_PREDICTIONS: usize = 5;

const MELSPECTROGRAM_MODEL: &str = "melspectrogram.onnx";
const EMBEDDING_MODEL: &str = "embedding_model.onnx";

/// Creates openWakeWord engines from per-keyword classifier `.onnx` files
///
/// The shared feature models are read from `model_path`, or from the first
/// keyword's directory when unset.
#[derive(Debug, Default)]
pub struct OpenWakeWordFactory;

impl EngineFactory for OpenWakeWordFactory {
    fn frame_spec(&self) -> FrameSpec {
        FrameSpec {
            sample_rate: SAMPLE_RATE,
            frame_length: FRAME_LENGTH,
        }
    }

    fn requires_credential(&self) -> bool {
        false
    }

    fn create(&self, settings: &WakeSettings) -> Result<Box<dyn WakeWordEngine>> {
        let model_dir = feature_model_dir(settings)?;

        let melspectrogram = load_model(&model_dir.join(MELSPECTROGRAM_MODEL))?;
        let embedding = load_model(&model_dir.join(EMBEDDING_MODEL))?;

        let mut classifiers = Vec::with_capacity(settings.keyword_paths.len());
        for (path, sensitivity) in settings.keyword_paths.iter().zip(&settings.sensitivities) {
            classifiers.push(Classifier {
                session: load_model(path)?,
                threshold: threshold_for(*sensitivity),
            });
        }

        tracing::debug!(
            model_dir = %model_dir.display(),
            keywords = classifiers.len(),
            "openwakeword initialized"
        );

        Ok(Box::new(OpenWakeWordEngine {
            melspectrogram,
            embedding,
            classifiers,
            mel_frames: VecDeque::with_capacity(EMBEDDING_WINDOW * 2),
            embeddings: VecDeque::with_capacity(MAX_EMBEDDINGS),
            predictions: 0,
        }))
    }
}

fn feature_model_dir(settings: &WakeSettings) -> Result<PathBuf> {
    if let Some(dir) = &settings.model_path {
        return Ok(dir.clone());
    }
    settings
        .keyword_paths
        .first()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::ModelLoad("cannot locate feature models".to_string()))
}

/// Score a classifier must exceed; higher sensitivity lowers the bar
fn threshold_for(sensitivity: f32) -> f32 {
    1.0 - sensitivity.clamp(0.0, 1.0)
}

fn load_model(path: &Path) -> Result<Session> {
    if !path.is_file() {
        return Err(Error::ModelLoad(format!(
            "model file not found: {}",
            path.display()
        )));
    }

    Session::builder()
        .map_err(|e| model_error(path, e))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| model_error(path, e))?
        .with_intra_threads(1)
        .map_err(|e| model_error(path, e))?
        .with_inter_threads(1)
        .map_err(|e| model_error(path, e))?
        .commit_from_file(path)
        .map_err(|e| model_error(path, e))
}

fn model_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::ModelLoad(format!("{}: {e}", path.display()))
}

fn engine_error(e: impl std::fmt::Display) -> Error {
    Error::Engine(e.to_string())
}

/// Run a single-input model and copy out its first output
fn infer<D>(session: &mut Session, input: Array<f32, D>) -> Result<ArrayD<f32>>
where
    D: Dimension + 'static,
{
    let tensor = Tensor::from_array(input).map_err(engine_error)?;
    let outputs = session.run(ort::inputs![tensor]).map_err(engine_error)?;
    let view = outputs[0]
        .try_extract_array::<f32>()
        .map_err(engine_error)?;
    Ok(view.to_owned())
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, cap: usize) {
    if buffer.len() >= cap {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

/// Index of the highest-scoring keyword over its threshold
fn best_match(scores: &[f32], thresholds: &[f32]) -> Option<usize> {
    scores
        .iter()
        .zip(thresholds)
        .enumerate()
        .filter(|(_, (score, threshold))| score > threshold)
        .max_by(|(_, (a, _)), (_, (b, _))| a.total_cmp(b))
        .map(|(index, _)| index)
}

struct Classifier {
    session: Session,
    threshold: f32,
}

struct OpenWakeWordEngine {
    melspectrogram: Session,
    embedding: Session,
    classifiers: Vec<Classifier>,
    mel_frames: VecDeque<[f32; MEL_BINS]>,
    embeddings: VecDeque<[f32; EMBEDDING_DIM]>,
    predictions: usize,
}

impl OpenWakeWordEngine {
    fn push_mel_frames(&mut self, frame: &[i16]) -> Result<()> {
        let samples: Vec<f32> = frame.iter().map(|&s| f32::from(s)).collect();
        let input = Array2::from_shape_vec((1, samples.len()), samples).map_err(engine_error)?;
        let output = infer(&mut self.melspectrogram, input)?;

        let values: Vec<f32> = output.iter().copied().collect();
        for bins in values.chunks_exact(MEL_BINS) {
            let mut mel = [0.0; MEL_BINS];
            for (slot, value) in mel.iter_mut().zip(bins) {
                *slot = value / 10.0 + 2.0;
            }
            push_bounded(&mut self.mel_frames, mel, EMBEDDING_WINDOW * 2);
        }
        Ok(())
    }

    fn push_embedding(&mut self) -> Result<bool> {
        if self.mel_frames.len() < EMBEDDING_WINDOW {
            return Ok(false);
        }

        let start = self.mel_frames.len() - EMBEDDING_WINDOW;
        let window: Vec<f32> = self
            .mel_frames
            .iter()
            .skip(start)
            .flat_map(|mel| mel.iter().copied())
            .collect();
        let input = Array4::from_shape_vec((1, EMBEDDING_WINDOW, MEL_BINS, 1), window)
            .map_err(engine_error)?;
        let output = infer(&mut self.embedding, input)?;

        if output.len() < EMBEDDING_DIM {
            return Err(Error::Engine(format!(
                "embedding model produced {} values",
                output.len()
            )));
        }
        let mut embedding = [0.0; EMBEDDING_DIM];
        for (slot, value) in embedding.iter_mut().zip(output.iter()) {
            *slot = *value;
        }
        push_bounded(&mut self.embeddings, embedding, MAX_EMBEDDINGS);
        Ok(true)
    }

    fn classify(&mut self) -> Result<Vec<f32>> {
        let start = self.embeddings.len() - CLASSIFICATION_FRAMES;
        let features: Vec<f32> = self
            .embeddings
            .iter()
            .skip(start)
            .flat_map(|e| e.iter().copied())
            .collect();

        let mut scores = Vec::with_capacity(self.classifiers.len());
        for classifier in &mut self.classifiers {
            let input = Array3::from_shape_vec(
                (1, CLASSIFICATION_FRAMES, EMBEDDING_DIM),
                features.clone(),
            )
            .map_err(engine_error)?;
            let output = infer(&mut classifier.session, input)?;
            scores.push(output.iter().next().copied().unwrap_or(0.0));
        }
        Ok(scores)
    }
}

impl WakeWordEngine for OpenWakeWordEngine {
    fn process(&mut self, frame: &[i16]) -> Result<i32> {
        self.push_mel_frames(frame)?;

        if !self.push_embedding()? || self.embeddings.len() < CLASSIFICATION_FRAMES {
            return Ok(-1);
        }

        let scores = self.classify()?;
        self.predictions += 1;
        if self.predictions <= WARMUP_PREDICTIONS {
            return Ok(-1);
        }

        let thresholds: Vec<f32> = self.classifiers.iter().map(|c| c.threshold).collect();
        match best_match(&scores, &thresholds) {
            Some(index) => {
                tracing::trace!(keyword = index, score = scores[index], "keyword scored");
                i32::try_from(index).map_err(engine_error)
            }
            None => Ok(-1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(paths: Vec<PathBuf>, model_path: Option<PathBuf>) -> WakeSettings {
        let sensitivities = vec![0.5; paths.len()];
        WakeSettings {
            access_key: None,
            keyword_paths: paths,
            sensitivities,
            model_path,
        }
    }

    #[test]
    fn test_threshold_follows_sensitivity() {
        assert!((threshold_for(0.65) - 0.35).abs() < f32::EPSILON);
        assert!((threshold_for(2.0) - 0.0).abs() < f32::EPSILON);
        assert!((threshold_for(-1.0) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_best_match_picks_highest_over_threshold() {
        assert_eq!(best_match(&[0.2, 0.9, 0.7], &[0.5, 0.5, 0.5]), Some(1));
        assert_eq!(best_match(&[0.6, 0.9], &[0.5, 0.95]), Some(0));
        assert_eq!(best_match(&[0.1, 0.2], &[0.5, 0.5]), None);
    }

    #[test]
    fn test_push_bounded_drops_oldest() {
        let mut buffer = VecDeque::new();
        for i in 0..5 {
            push_bounded(&mut buffer, i, 3);
        }
        assert_eq!(buffer, VecDeque::from([2, 3, 4]));
    }

    #[test]
    fn test_feature_models_default_to_keyword_dir() {
        let s = settings(vec![PathBuf::from("/models/hey_hearken.onnx")], None);
        assert_eq!(feature_model_dir(&s).unwrap(), PathBuf::from("/models"));

        let s = settings(
            vec![PathBuf::from("/models/hey_hearken.onnx")],
            Some(PathBuf::from("/shared")),
        );
        assert_eq!(feature_model_dir(&s).unwrap(), PathBuf::from("/shared"));
    }

    #[test]
    fn test_missing_models_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(vec![dir.path().join("hey_hearken.onnx")], None);

        let err = OpenWakeWordFactory.create(&s).err().unwrap();
        assert!(matches!(err, Error::ModelLoad(msg) if msg.contains(MELSPECTROGRAM_MODEL)));
    }

    #[test]
    fn test_no_credential_needed() {
        assert!(!OpenWakeWordFactory.requires_credential());
        assert_eq!(OpenWakeWordFactory.frame_spec().frame_length, FRAME_LENGTH);
    }
}
