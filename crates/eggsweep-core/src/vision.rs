//! Detection events consumed from the vision producer
//!
//! The vision subsystem (capture + inference) lives outside this crate; it
//! pushes [`DetectionEvent`]s and obstacle distances onto the event bus at
//! the camera frame rate. This module defines those types and the
//! center-band predicate the state machine keys off.

use serde::{Deserialize, Serialize};

/// A pixel coordinate on the camera frame, as sent to the arm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: u16,
    pub y: u16,
}

impl Coordinate {
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }

    /// Round a float detection center into wire coordinates, clamped to u16
    pub fn from_center(x: f32, y: f32) -> Self {
        Self {
            x: x.round().clamp(0.0, u16::MAX as f32) as u16,
            y: y.round().clamp(0.0, u16::MAX as f32) as u16,
        }
    }
}

/// A single detected egg
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Bounding-box center in pixels
    pub center: Coordinate,
    /// Detector confidence in [0, 1]
    pub confidence: f32,
    /// Detector class index
    pub class_id: u16,
}

impl Detection {
    pub fn new(center: Coordinate, confidence: f32) -> Self {
        Self {
            center,
            confidence,
            class_id: 0,
        }
    }
}

/// One frame's worth of detections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    /// Scheduler-clock timestamp of the frame (ms)
    pub timestamp_ms: u64,
    pub detections: Vec<Detection>,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl DetectionEvent {
    /// True iff any detection sits inside the vertical center band
    ///
    /// The band is inclusive on both edges: a center at exactly
    /// `lower * height` counts.
    pub fn has_center_egg(&self, band: CenterBand) -> bool {
        self.detections
            .iter()
            .any(|d| band.contains(d.center.y, self.frame_height))
    }
}

/// Vertical band of the image where an egg is considered pickable
///
/// Expressed as fractions of the frame height, default `[0.25, 0.75]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CenterBand {
    pub lower: f32,
    pub upper: f32,
}

impl Default for CenterBand {
    fn default() -> Self {
        Self {
            lower: 0.25,
            upper: 0.75,
        }
    }
}

impl CenterBand {
    pub fn new(lower: f32, upper: f32) -> Self {
        Self { lower, upper }
    }

    /// Whether a pixel row falls inside the band for the given frame height
    pub fn contains(&self, y: u16, frame_height: u32) -> bool {
        let h = frame_height as f32;
        let y = y as f32;
        y >= self.lower * h && y <= self.upper * h
    }
}

/// Distance to the nearest obstacle ahead of the drive base
///
/// Delivered either as its own event or piggy-backed on an actor status
/// reply; the controller treats both identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObstacleDistance {
    pub cm: u32,
    pub timestamp_ms: u64,
}
