//! Spatial state shared by every world-placed entity.

use crate::{
    codec::{BufferReader, BufferWriter, CodecError, Value},
    math::{Quat, Vec3},
};

use super::PropertySet;

/// Pose and extent. Rotation is Euler angles in degrees (Y-up).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldState {
    pub position: Vec3,
    pub rotation: Vec3,
    pub size: Vec3,
    pub velocity: Vec3,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            size: Vec3::ONE,
            velocity: Vec3::ZERO,
        }
    }
}

impl WorldState {
    pub fn orientation(&self) -> Quat {
        Quat::from_euler_degrees(self.rotation)
    }

    pub fn set_orientation(&mut self, q: Quat) {
        self.rotation = q.to_euler_degrees();
    }

    /// Moves by `velocity * dt`.
    pub fn integrate(&mut self, dt: f32) {
        self.position += self.velocity * dt;
    }

    pub(crate) fn collect_fields(&self, out: &mut PropertySet) {
        out.push(("position".into(), Value::Vec3(self.position)));
        out.push(("rotation".into(), Value::Vec3(self.rotation)));
        out.push(("size".into(), Value::Vec3(self.size)));
        out.push(("velocity".into(), Value::Vec3(self.velocity)));
    }

    pub(crate) fn apply_field(&mut self, name: &str, value: &Value) -> bool {
        let slot = match name {
            "position" => &mut self.position,
            "rotation" => &mut self.rotation,
            "size" => &mut self.size,
            "velocity" => &mut self.velocity,
            _ => return false,
        };
        match value.as_vec3() {
            Some(v) => {
                *slot = v;
                true
            }
            None => false,
        }
    }

    pub(crate) fn write(&self, w: &mut BufferWriter) {
        w.write_vec3(self.position)
            .write_vec3(self.rotation)
            .write_vec3(self.size)
            .write_vec3(self.velocity);
    }

    pub(crate) fn read(&mut self, r: &mut BufferReader) -> Result<(), CodecError> {
        self.position = r.read_vec3()?;
        self.rotation = r.read_vec3()?;
        self.size = r.read_vec3()?;
        self.velocity = r.read_vec3()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrate_moves_along_velocity() {
        let mut w = WorldState {
            velocity: Vec3::new(2.0, 0.0, -4.0),
            ..Default::default()
        };
        w.integrate(0.5);
        assert_eq!(w.position, Vec3::new(1.0, 0.0, -2.0));
    }

    #[test]
    fn apply_field_checks_type() {
        let mut w = WorldState::default();
        assert!(w.apply_field("size", &Value::Vec3(Vec3::new(2.0, 2.0, 2.0))));
        assert!(!w.apply_field("size", &Value::F32(2.0)));
        assert!(!w.apply_field("health", &Value::Vec3(Vec3::ZERO)));
        assert_eq!(w.size, Vec3::new(2.0, 2.0, 2.0));
    }
}
