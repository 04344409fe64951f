use crate::math::vector::Vec3;

use num_traits::Float;

// This creates a coordinate system given only a single vector.
pub fn coord_system<T: Float>(v1: Vec3<T>) -> (Vec3<T>, Vec3<T>) {
    let v2 = if v1.x.abs() > v1.y.abs() {
        Vec3 {
            x: -v1.z,
            y: T::zero(),
            z: v1.x,
        }
    } else {
        Vec3 {
            x: T::zero(),
            y: v1.z,
            z: -v1.y,
        }
    }
    .normalize();

    let v3 = v1.cross(v2);

    (v2, v3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coord_system_orthogonal() {
        let v = Vec3 {
            x: 0.3,
            y: -0.5,
            z: 0.81,
        }
        .normalize();
        let (a, b) = coord_system(v);
        assert!(v.dot(a).abs() < 1e-12);
        assert!(v.dot(b).abs() < 1e-12);
        assert!(a.dot(b).abs() < 1e-12);
    }
}
