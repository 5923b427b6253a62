//! Input handling.
//!
//! In a real engine this would integrate with windowing, raw mouse/keyboard
//! and action bindings. Here it turns a sampled [`InputState`] into motion of
//! the locally controlled player. The client moves its own player and the
//! server accepts or refuses the result.

use arena_shared::{entity::WorldState, math::Vec3};

/// Movement speed of a player, units per second.
pub const PLAYER_SPEED: f32 = 10.0;

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    /// -1..=1, positive forward.
    pub forward: f32,
    /// -1..=1, positive right.
    pub right: f32,
    /// Facing around the vertical axis, degrees.
    pub yaw: f32,
}

impl InputState {
    /// Desired velocity in world space. Diagonal input is not faster.
    pub fn wish_velocity(self, speed: f32) -> Vec3 {
        let (sin, cos) = self.yaw.to_radians().sin_cos();
        let forward = Vec3::new(-sin, 0.0, -cos);
        let right = Vec3::new(cos, 0.0, -sin);
        let wish = forward * self.forward.clamp(-1.0, 1.0) + right * self.right.clamp(-1.0, 1.0);
        let len = wish.len();
        if len > 1.0 {
            wish * (speed / len)
        } else {
            wish * speed
        }
    }
}

/// Applies input to the local player's pose and moves it by `dt`.
pub fn apply_input(world: &mut WorldState, input: InputState, dt: f32) {
    world.rotation.y = input.yaw;
    world.velocity = input.wish_velocity(PLAYER_SPEED);
    world.integrate(dt);
}
