//! Reflection and refraction at index-mismatch interfaces.

use crate::math::vector::Vec3;

use num_traits::clamp;

// Calculates the Fresnel reflectance of a dielectric interface.
//
// As the photon packets are unpolarized, we take the average of the
// reflectance of the s-polarized and p-polarized components.
//
// cos_theta_i: the cosine of the incident angle (against the face normal)
// n_i: index of refraction of the incident medium
// n_t: index of refraction of the transmitted medium
pub fn fresnel_reflectance(cos_theta_i: f64, n_i: f64, n_t: f64) -> f64 {
    let cos_theta_i = clamp(cos_theta_i.abs(), 0.0, 1.0);

    // This is just the identity: cos^2 + sin^2 = 1
    let sin_theta_i = (1.0 - cos_theta_i * cos_theta_i).max(0.0).sqrt();
    // Using Snell's law to find the sin of the transmitted angle
    let sin_theta_t = n_i / n_t * sin_theta_i;
    // Check for total internal reflection:
    if sin_theta_t >= 1.0 {
        return 1.0;
    }
    // Once again, apply the identity:
    let cos_theta_t = (1.0 - sin_theta_t * sin_theta_t).max(0.0).sqrt();

    // Apply Fresnel's equations for reflectance:
    let refl_parl = ((n_t * cos_theta_i) - (n_i * cos_theta_t))
        / ((n_t * cos_theta_i) + (n_i * cos_theta_t));
    let refl_perp = ((n_i * cos_theta_i) - (n_t * cos_theta_t))
        / ((n_i * cos_theta_i) + (n_t * cos_theta_t));

    // Average the result as we are dealing with unpolarized light
    (refl_parl * refl_parl + refl_perp * refl_perp) / 2.0
}

/// Mirrors `v` about the face normal `n`.
pub fn reflect(v: Vec3<f64>, n: Vec3<f64>) -> Vec3<f64> {
    (v - n.scale(2.0 * v.dot(n))).normalize()
}

/// Bends `v` across the interface with normal `n` (pointing against `v`,
/// i.e. `v . n < 0`) and relative index `eta = n_i / n_t`. Returns `None`
/// on total internal reflection.
pub fn refract(v: Vec3<f64>, n: Vec3<f64>, eta: f64) -> Option<Vec3<f64>> {
    let cos_i = -v.dot(n);
    let k = eta * eta * (1.0 - cos_i * cos_i);
    if k >= 1.0 {
        return None;
    }
    let vt = v.scale(eta) + n.scale(eta * cos_i - (1.0 - k).sqrt());
    Some(vt.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_incidence() {
        // R = ((n1 - n2) / (n1 + n2))^2 at normal incidence:
        let r = fresnel_reflectance(1.0, 1.0, 1.37);
        let expected = ((1.0f64 - 1.37) / (1.0 + 1.37)).powi(2);
        assert!((r - expected).abs() < 1e-12);
    }

    #[test]
    fn test_total_internal_reflection() {
        // From glass towards air past the critical angle:
        let cos_i = (5.0f64).to_radians().cos();
        assert_eq!(fresnel_reflectance(cos_i, 1.5, 1.0), 1.0);
    }

    #[test]
    fn test_grazing_incidence_reflects() {
        let r = fresnel_reflectance(1e-9, 1.0, 1.37);
        assert!(r > 0.99);
    }

    #[test]
    fn test_reflect_preserves_tangential() {
        let n = Vec3 {
            x: 0.0,
            y: 0.0,
            z: 1.0,
        };
        let v = Vec3 {
            x: 0.6,
            y: 0.0,
            z: -0.8,
        };
        let r = reflect(v, n);
        assert!((r.x - 0.6).abs() < 1e-12);
        assert!((r.z - 0.8).abs() < 1e-12);
        assert!((r.length() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_refract_snell() {
        let n = Vec3 {
            x: 0.0,
            y: 0.0,
            z: 1.0,
        };
        let theta_i = 30.0f64.to_radians();
        let v = Vec3 {
            x: theta_i.sin(),
            y: 0.0,
            z: -theta_i.cos(),
        };
        let eta = 1.0 / 1.37;
        let t = refract(v, n, eta).unwrap();
        let sin_t = (t.x * t.x + t.y * t.y).sqrt();
        assert!((sin_t - eta * theta_i.sin()).abs() < 1e-12);
    }

    #[test]
    fn test_refract_tir_is_none() {
        let n = Vec3 {
            x: 0.0,
            y: 0.0,
            z: 1.0,
        };
        let theta_i = 80.0f64.to_radians();
        let v = Vec3 {
            x: theta_i.sin(),
            y: 0.0,
            z: -theta_i.cos(),
        };
        assert!(refract(v, n, 1.5).is_none());
    }
}
