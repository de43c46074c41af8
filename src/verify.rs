use crate::config::Config;
use crate::detector::FaceDetector;
use crate::error::Result;
use crate::recognizer::{euclidean_distance, Embedding, FaceRecognizer};
use std::path::Path;

/// Fixed set of comparison outcomes. The two no-face cases are distinct
/// because they call for different operator actions (rescan the card vs
/// recapture the live face).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    NoFaceInReference,
    NoFaceInCandidate,
    HighConfidenceMatch,
    MediumConfidenceMatch,
    Mismatch,
}

impl MatchOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            MatchOutcome::NoFaceInReference => {
                "No face detected in the CCCD reference image. Please rescan the card."
            }
            MatchOutcome::NoFaceInCandidate => {
                "No face detected in the captured image. Please capture again."
            }
            MatchOutcome::HighConfidenceMatch => {
                "Face verification succeeded (high confidence)."
            }
            MatchOutcome::MediumConfidenceMatch => {
                "Face verification succeeded (medium confidence)."
            }
            MatchOutcome::Mismatch => {
                "Face verification failed. The face does not match the CCCD photo."
            }
        }
    }
}

impl std::fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Outcome of one face-to-face comparison. Ephemeral, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct FaceComparisonResult {
    pub is_match: bool,
    /// Normalized similarity in `[0.0, 1.0]`, derived from the encoding
    /// distance.
    pub confidence: f32,
    pub outcome: MatchOutcome,
}

impl FaceComparisonResult {
    pub fn message(&self) -> &'static str {
        self.outcome.message()
    }

    fn no_face(outcome: MatchOutcome) -> Self {
        Self {
            is_match: false,
            confidence: 0.0,
            outcome,
        }
    }
}

/// Decision over two comparable encodings.
///
/// Two independent criteria, combined with AND to reduce false accepts:
/// the distance must pass `tolerance`, and the derived confidence must
/// reach `confidence_floor`.
pub fn compare_encodings(
    reference: &Embedding,
    candidate: &Embedding,
    tolerance: f32,
    confidence_floor: f32,
    high_confidence: f32,
) -> FaceComparisonResult {
    let distance = euclidean_distance(reference, candidate);
    let confidence = (1.0 - distance).clamp(0.0, 1.0);

    let within_tolerance = distance <= tolerance;
    let is_match = within_tolerance && confidence >= confidence_floor;

    let outcome = if is_match && confidence >= high_confidence {
        MatchOutcome::HighConfidenceMatch
    } else if is_match {
        MatchOutcome::MediumConfidenceMatch
    } else {
        MatchOutcome::Mismatch
    };

    FaceComparisonResult {
        is_match,
        confidence,
        outcome,
    }
}

/// Decides whether two face images depict the same person.
///
/// `compare` is synchronous and CPU-bound, on the order of hundreds of
/// milliseconds; latency-sensitive callers should run it on a worker
/// thread and consume the result from their own context.
pub struct FaceVerifier {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    config: Config,
}

impl FaceVerifier {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            detector: FaceDetector::new(config)?,
            recognizer: FaceRecognizer::new(config)?,
            config: config.clone(),
        })
    }

    /// Compares with the configured tolerance.
    pub fn compare(&self, reference: &Path, candidate: &Path) -> Result<FaceComparisonResult> {
        self.compare_with_tolerance(reference, candidate, self.config.verification.tolerance)
    }

    /// Pure over the two file paths: no network, no persistence. An
    /// unreadable image is an error; an image without a face is a
    /// non-match result, not an error.
    pub fn compare_with_tolerance(
        &self,
        reference: &Path,
        candidate: &Path,
        tolerance: f32,
    ) -> Result<FaceComparisonResult> {
        let reference_encoding = match self.encode_primary_face(reference)? {
            Some(encoding) => encoding,
            None => {
                return Ok(FaceComparisonResult::no_face(
                    MatchOutcome::NoFaceInReference,
                ))
            }
        };
        let candidate_encoding = match self.encode_primary_face(candidate)? {
            Some(encoding) => encoding,
            None => {
                return Ok(FaceComparisonResult::no_face(
                    MatchOutcome::NoFaceInCandidate,
                ))
            }
        };

        Ok(compare_encodings(
            &reference_encoding,
            &candidate_encoding,
            tolerance,
            self.config.verification.confidence_floor,
            self.config.verification.high_confidence,
        ))
    }

    /// Encodes the primary face of an image, or `None` if no face clears
    /// the detection threshold. With multiple detections the largest
    /// bounding box wins.
    fn encode_primary_face(&self, path: &Path) -> Result<Option<Embedding>> {
        let image = image::open(path)?;
        let faces = self.detector.detect(&image)?;

        let primary = match faces.iter().max_by(|a, b| a.area().total_cmp(&b.area())) {
            Some(face) => face,
            None => return Ok(None),
        };
        if faces.len() > 1 {
            tracing::debug!(
                "{} faces detected in {}, using the largest",
                faces.len(),
                path.display()
            );
        }

        self.recognizer.get_embedding(&image, primary).map(Some)
    }
}
