//! Two-dimensional synthetic network coordinates.
//!
//! Distances between coordinates estimate round-trip time in milliseconds.

use serde::{Deserialize, Serialize};

/// A point in the 2-D coordinate space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

/// A displacement between two coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector {
    pub x: f64,
    pub y: f64,
}

impl Coordinate {
    pub const ORIGIN: Coordinate = Coordinate { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Coordinate) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Vector pointing from `other` towards `self`.
    pub fn difference_vector(&self, other: &Coordinate) -> Vector {
        Vector::new(self.x - other.x, self.y - other.y)
    }

    /// Move by `force` scaled with the correction factor and uncertainty balance.
    pub fn apply_force_vector(&mut self, force: &Vector, correction_factor: f64, balance: f64) {
        self.x += force.x * correction_factor * balance;
        self.y += force.y * correction_factor * balance;
    }
}

impl Vector {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Scale to unit length.
    ///
    /// Every node starts at the origin, so two fresh nodes produce a zero
    /// vector. In that case a random direction is chosen instead.
    pub fn normalize(&mut self) {
        let mut length = self.length();
        while length == 0.0 {
            self.x = rand::random::<f64>();
            self.y = rand::random::<f64>();
            length = self.length();
        }
        self.x /= length;
        self.y /= length;
    }

    pub fn apply_error(&mut self, error: f64) {
        self.x *= error;
        self.y *= error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(3.0, 4.0);
        assert_eq!(a.distance(&b), 5.0);
        assert_eq!(b.distance(&a), 5.0);
    }

    #[test]
    fn difference_points_away_from_other() {
        let a = Coordinate::new(1.0, 1.0);
        let b = Coordinate::new(4.0, 5.0);
        let v = a.difference_vector(&b);
        assert_eq!(v, Vector::new(-3.0, -4.0));
    }

    #[test]
    fn normalize_zero_vector_yields_unit_length() {
        let mut v = Vector::default();
        v.normalize();
        assert!((v.length() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn force_is_scaled_by_factor_and_balance() {
        let mut c = Coordinate::ORIGIN;
        let mut force = Vector::new(3.0, 4.0);
        force.normalize();
        force.apply_error(10.0);
        c.apply_force_vector(&force, 0.5, 0.5);
        assert!((c.x - 1.5).abs() < 1e-9);
        assert!((c.y - 2.0).abs() < 1e-9);
    }
}
