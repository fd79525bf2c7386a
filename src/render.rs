use crate::{
    api::DetectionMode,
    frame::{decode_image_data, save_frame},
    session::{CaptureArchiveEntry, DetectionResult, TaggedResult},
};
use async_trait::async_trait;
use std::{collections::HashMap, path::PathBuf};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Presentation sink for the capture loop. Called from the dispatcher task only.
#[async_trait]
pub trait Renderer: Send {
    fn render_result(&mut self, result: &TaggedResult);

    fn render_capture(&mut self, entry: &CaptureArchiveEntry);

    /// Transient per-frame message, e.g. an error reported by the service.
    fn render_error(&mut self, mode: DetectionMode, message: &str);

    fn session_ended(&mut self, _session_id: u64, _reason: &str) {}

    /// Waits for output started by earlier calls. Run after a session stops and on shutdown.
    async fn flush(&mut self) {}
}

/// Drops responses older than the newest one already rendered for the same mode.
#[derive(Debug, Default)]
pub struct SequenceGate {
    highest: HashMap<DetectionMode, u64>,
}

impl SequenceGate {
    /// Returns false if `sequence_id` is stale for `mode`, otherwise records it.
    pub fn admit(&mut self, mode: DetectionMode, sequence_id: u64) -> bool {
        let highest = self.highest.entry(mode).or_insert(0);
        if sequence_id < *highest {
            return false;
        }
        *highest = sequence_id;
        true
    }
}

/// Human readable lines for a result, lanes are shown one based.
pub fn describe(result: &DetectionResult) -> Vec<String> {
    match result {
        DetectionResult::Plates { detections, .. } => {
            let lines: Vec<String> = detections
                .iter()
                .filter_map(|d| {
                    d.plate()
                        .map(|plate| format!("{}   {:.1}%", plate, d.confidence * 100_f32))
                })
                .collect();
            if lines.is_empty() {
                vec!["No license plates detected".to_string()]
            } else {
                lines
            }
        }
        DetectionResult::LaneIntrusion { intrusions, .. } => {
            if intrusions.is_empty() {
                return vec!["No lane intrusions detected".to_string()];
            }
            intrusions
                .iter()
                .map(|i| {
                    format!(
                        "Vehicle {}: lane {} -> {}",
                        i.vehicle_id,
                        i.from_lane + 1,
                        i.to_lane + 1
                    )
                })
                .collect()
        }
    }
}

/// Logs results through `tracing` and optionally writes annotated frames to disk.
#[derive(Default)]
pub struct LogRenderer {
    frame_dir: Option<PathBuf>,
    writes: JoinSet<()>,
}

impl LogRenderer {
    pub fn new(frame_dir: Option<PathBuf>) -> Self {
        Self {
            frame_dir,
            writes: JoinSet::new(),
        }
    }

    fn write_frame(&mut self, result: &TaggedResult) {
        let (Some(dir), Some(encoded)) = (self.frame_dir.as_ref(), result.result.rendered_frame())
        else {
            return;
        };
        let jpeg = match decode_image_data(encoded) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!("Frame #{}: undecodable processed image: {:?}", result.sequence_id, e);
                return;
            }
        };
        let path = dir.join(format!(
            "{}-{}-{}.jpg",
            result.mode(),
            result.sequence_id,
            Uuid::new_v4()
        ));
        while self.writes.try_join_next().is_some() {}
        self.writes.spawn(async move {
            if let Err(e) = save_frame(&jpeg, path).await {
                error!("Failed to save frame: {:?}", e);
            }
        });
    }
}

#[async_trait]
impl Renderer for LogRenderer {
    fn render_result(&mut self, result: &TaggedResult) {
        for line in describe(&result.result) {
            info!(
                "[{}] frame #{} ({:#?}): {}",
                result.mode(),
                result.sequence_id,
                result.round_trip,
                line
            );
        }
        self.write_frame(result);
    }

    fn render_capture(&mut self, entry: &CaptureArchiveEntry) {
        info!(
            "Capture {} saved as {} (detection {})",
            entry.capture_id, entry.image_ref, entry.detection_id
        );
    }

    fn render_error(&mut self, mode: DetectionMode, message: &str) {
        warn!("[{}] processing error: {}", mode, message);
    }

    async fn flush(&mut self) {
        while let Some(joined) = self.writes.join_next().await {
            if let Err(e) = joined {
                error!("Frame writer failed: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Intrusion, PlateDetection};

    #[test]
    fn gate_is_per_mode() {
        let mut gate = SequenceGate::default();
        assert!(gate.admit(DetectionMode::Plate, 3));
        assert!(!gate.admit(DetectionMode::Plate, 2));
        assert!(gate.admit(DetectionMode::LaneIntrusion, 1));
        assert!(gate.admit(DetectionMode::Plate, 5));
    }

    #[test]
    fn describes_plates_and_lanes() {
        let plates = DetectionResult::Plates {
            detections: vec![
                PlateDetection {
                    license_plate: Some("粤C1234".into()),
                    confidence: 0.9,
                    bbox: None,
                },
                PlateDetection {
                    license_plate: None,
                    confidence: 0.3,
                    bbox: None,
                },
            ],
            rendered_frame: None,
        };
        assert_eq!(describe(&plates), vec!["粤C1234   90.0%".to_string()]);

        let lanes = DetectionResult::LaneIntrusion {
            intrusions: vec![Intrusion {
                vehicle_id: 4,
                from_lane: 0,
                to_lane: 1,
                ..Default::default()
            }],
            rendered_frame: None,
        };
        assert_eq!(describe(&lanes), vec!["Vehicle 4: lane 1 -> 2".to_string()]);

        let empty = DetectionResult::LaneIntrusion {
            intrusions: vec![],
            rendered_frame: None,
        };
        assert_eq!(describe(&empty), vec!["No lane intrusions detected".to_string()]);
    }

    #[tokio::test]
    async fn annotated_frames_are_on_disk_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut renderer = LogRenderer::new(Some(dir.path().to_path_buf()));
        for sequence_id in 1..=3 {
            renderer.render_result(&TaggedResult {
                sequence_id,
                session_id: 1,
                requested_at: chrono::Utc::now(),
                round_trip: std::time::Duration::from_millis(20),
                result: DetectionResult::Plates {
                    detections: vec![],
                    rendered_frame: Some("data:image/jpeg;base64,AQID".into()),
                },
            });
        }
        renderer.flush().await;

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 3);
        assert!(names[0].starts_with("license_plate-1-"));
        let written = std::fs::read(dir.path().join(&names[2])).unwrap();
        assert_eq!(written, vec![1, 2, 3]);
    }
}
