use crate::config::Config;
use crate::error::{Result, VerifyError};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// ONNX face detector (YOLO-family model, center-format boxes).
pub struct FaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    config: Config,
}

impl FaceDetector {
    pub fn new(config: &Config) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .build()
                .map_err(|e| VerifyError::Model(format!("Failed to create environment: {}", e)))?,
        );

        let model_path = &config.models.detector_path;
        if !model_path.exists() {
            return Err(VerifyError::Model(format!(
                "Detector model not found at: {:?}",
                model_path
            )));
        }

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)?;

        Ok(Self {
            session,
            _environment: environment,
            config: config.clone(),
        })
    }

    /// Detects faces and returns boxes in original-image coordinates,
    /// highest confidence first.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let input_width = self.config.detector.input_width;
        let input_height = self.config.detector.input_height;

        let resized = if image.width() == input_width && image.height() == input_height {
            image.clone()
        } else {
            image.resize_exact(input_width, input_height, FilterType::Triangle)
        };

        let img_array = self.image_to_array(&resized);
        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut faces = self.parse_detections(&outputs)?;

        let scale_x = orig_width / input_width as f32;
        let scale_y = orig_height / input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }

    fn image_to_array(&self, img: &DynamicImage) -> Array4<f32> {
        let rgb = img.to_rgb8();
        let width = rgb.width() as usize;
        let height = rgb.height() as usize;
        let mean = self.config.detector.normalization_mean;
        let std = self.config.detector.normalization_std;

        let mut array = Array4::<f32>::zeros((1, 3, height, width));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for channel in 0..3 {
                array[[0, channel, y, x]] = (pixel[channel] as f32 - mean) / std;
            }
        }
        array
    }

    /// Output layout is `[1, N, 5]` or the transposed `[1, 5, N]`, each
    /// prediction being `[x_center, y_center, width, height, score]`.
    fn parse_detections(&self, outputs: &[Value]) -> Result<Vec<FaceBox>> {
        let output = outputs
            .first()
            .ok_or_else(|| VerifyError::Model("Detector produced no output".to_string()))?
            .try_extract::<f32>()?
            .view()
            .to_owned();

        let shape = output.shape().to_vec();
        let (num_predictions, prediction_len, is_transposed) = match shape.as_slice() {
            [_, channels, n] if *channels <= 8 && n > channels => (*n, *channels, true),
            [_, n, len] => (*n, *len, false),
            [n, len] => (*n, *len, false),
            other => {
                tracing::warn!("Unexpected detector output shape: {:?}", other);
                return Ok(Vec::new());
            }
        };
        if prediction_len < 5 {
            tracing::warn!("Detector output carries no confidence channel");
            return Ok(Vec::new());
        }

        let values = output.as_slice().ok_or_else(|| {
            VerifyError::Model("Detector output is not contiguous".to_string())
        })?;
        let input_width = self.config.detector.input_width as f32;
        let input_height = self.config.detector.input_height as f32;

        let mut faces = Vec::new();
        for i in 0..num_predictions {
            let at = |field: usize| {
                if is_transposed {
                    values[field * num_predictions + i]
                } else {
                    values[i * prediction_len + field]
                }
            };
            let confidence = at(4);
            if confidence <= 0.001 {
                continue;
            }

            let (x_center, y_center, width, height) = (at(0), at(1), at(2), at(3));
            // Some exports emit normalized coordinates, some pixel space.
            let scale = if x_center > 1.0 || y_center > 1.0 || width > 1.0 {
                1.0
            } else {
                input_width
            };

            let x1 = ((x_center - width / 2.0) * scale).max(0.0);
            let y1 = ((y_center - height / 2.0) * scale).max(0.0);
            let x2 = ((x_center + width / 2.0) * scale).min(input_width);
            let y2 = ((y_center + height / 2.0) * scale).min(input_height);

            if x2 > x1 && y2 > y1 {
                faces.push(FaceBox {
                    x1,
                    y1,
                    x2,
                    y2,
                    confidence,
                });
            }
        }

        // Deduplicate before the confidence cut so overlapping weak boxes
        // cannot shadow a strong one.
        let mut faces = apply_nms(faces, 0.45);
        faces.retain(|face| face.confidence >= self.config.detector.detection_confidence);
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(faces)
    }
}

fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}
