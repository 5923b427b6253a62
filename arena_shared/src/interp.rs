//! Client-side smoothing of remote entity poses.
//!
//! Each authoritative update retargets the interpolator from whatever pose
//! is currently displayed to the new one over one tick duration: position
//! is lerped and orientation nlerped. Teleports snap.

use crate::math::{Quat, Vec3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn lerp(&self, to: &Pose, t: f32) -> Pose {
        Pose {
            position: self.position.lerp(to.position, t),
            orientation: self.orientation.nlerp(to.orientation, t),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoseInterpolator {
    from: Pose,
    to: Pose,
    elapsed: f32,
    duration: f32,
}

impl PoseInterpolator {
    pub fn new(pose: Pose, duration: f32) -> Self {
        Self {
            from: pose,
            to: pose,
            elapsed: duration,
            duration: duration.max(f32::EPSILON),
        }
    }

    /// Starts blending from the currently displayed pose towards `target`.
    pub fn retarget(&mut self, target: Pose) {
        self.from = self.current();
        self.to = target;
        self.elapsed = 0.0;
    }

    pub fn snap(&mut self, pose: Pose) {
        self.from = pose;
        self.to = pose;
        self.elapsed = self.duration;
    }

    /// Advances by `dt` seconds and returns the pose to display.
    pub fn advance(&mut self, dt: f32) -> Pose {
        self.elapsed = (self.elapsed + dt.max(0.0)).min(self.duration);
        self.current()
    }

    pub fn current(&self) -> Pose {
        self.from.lerp(&self.to, self.elapsed / self.duration)
    }

    pub fn target(&self) -> Pose {
        self.to
    }

    pub fn is_settled(&self) -> bool {
        self.elapsed >= self.duration
    }
}
