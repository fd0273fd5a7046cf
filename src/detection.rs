//! Detection records and the datagram wire message.
//!
//! A `DetectionBatch` is the unit that goes on the wire: one frame's worth of
//! detections plus the sender's wall-clock stamp. Every batch encodes to a
//! self-contained JSON document, so a receiver can parse any datagram without
//! having seen the ones before it.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One detected item in a frame.
///
/// Coordinates are normalized to the image: `[xmin, ymin, xmax, ymax]`, each in
/// `[0, 1]`. The channel does not range-check them; producers own that contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionObject {
    /// Class label (e.g. "duck").
    pub label: String,
    /// Confidence in `[0, 1]`.
    pub score: f64,
    /// Normalized bounding box `[xmin, ymin, xmax, ymax]`.
    pub bbox: [f64; 4],
}

impl DetectionObject {
    pub fn new(label: impl Into<String>, score: f64, bbox: [f64; 4]) -> Self {
        Self {
            label: label.into(),
            score,
            bbox,
        }
    }

    /// Build a box from its centre and size, clamped to the unit square.
    pub fn from_center(
        label: impl Into<String>,
        score: f64,
        center: (f64, f64),
        size: (f64, f64),
    ) -> Self {
        let (cx, cy) = center;
        let (w, h) = size;
        let bbox = [
            (cx - w / 2.0).max(0.0),
            (cy - h / 2.0).max(0.0),
            (cx + w / 2.0).min(1.0),
            (cy + h / 2.0).min(1.0),
        ];
        Self::new(label, score, bbox)
    }

    /// JSON has no representation for NaN or infinity.
    fn check_encodable(&self, index: usize) -> Result<()> {
        if !self.score.is_finite() {
            return Err(anyhow!(
                "object {} ({}): score {} is not a finite number",
                index,
                self.label,
                self.score
            ));
        }
        if let Some(value) = self.bbox.iter().find(|v| !v.is_finite()) {
            return Err(anyhow!(
                "object {} ({}): bbox component {} is not a finite number",
                index,
                self.label,
                value
            ));
        }
        Ok(())
    }
}

/// Wire message for a single frame.
///
/// Borrows the caller's detections when encoding and owns them after decoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch<'a> {
    /// Sender wall clock, seconds since the Unix epoch.
    pub timestamp: f64,
    /// Caller-supplied frame identifier.
    pub frame_id: u64,
    pub objects: Cow<'a, [DetectionObject]>,
}

impl<'a> DetectionBatch<'a> {
    /// Stamp a batch with the current wall-clock time.
    pub fn now(frame_id: u64, objects: &'a [DetectionObject]) -> Self {
        Self::at(unix_timestamp(), frame_id, objects)
    }

    pub fn at(timestamp: f64, frame_id: u64, objects: &'a [DetectionObject]) -> Self {
        Self {
            timestamp,
            frame_id,
            objects: Cow::Borrowed(objects),
        }
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        for (index, object) in self.objects.iter().enumerate() {
            object.check_encodable(index)?;
        }
        serde_json::to_vec(self)
            .map_err(|e| anyhow!("failed to encode frame {}: {}", self.frame_id, e))
    }

}

impl DetectionBatch<'static> {
    /// Parse one datagram payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| anyhow!("invalid detection datagram: {}", e))
    }
}

/// Seconds since the Unix epoch. A clock set before 1970 reads as zero.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}
