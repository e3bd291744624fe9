use std::error::Error;

pub type DynError = Box<dyn Error + Send + Sync>;

/// Dot product of two 3-vectors.
pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Cross product a x b.
pub fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

/// Scale a vector to unit length. Returns an error for the null vector,
/// which here means a telescope sitting exactly on the shower axis.
pub fn normalize(a: [f64; 3]) -> Result<[f64; 3], DynError> {
    let n = norm(a);
    if n == 0.0 {
        return Err("Cannot normalize a null vector".into());
    }
    Ok([a[0] / n, a[1] / n, a[2] / n])
}

#[cfg(test)]
mod tests {
    use super::{cross, dot, normalize};

    #[test]
    fn cross_of_unit_axes_follows_right_hand_rule() {
        let x = [1.0, 0.0, 0.0];
        let y = [0.0, 1.0, 0.0];
        assert_eq!(cross(x, y), [0.0, 0.0, 1.0]);
        assert_eq!(cross(y, x), [0.0, 0.0, -1.0]);
    }

    #[test]
    fn cross_is_orthogonal_to_both_inputs() {
        let a = [1.0, 2.0, 3.0];
        let b = [-0.5, 4.0, 1.5];
        let c = cross(a, b);
        assert!(dot(a, c).abs() < 1e-12);
        assert!(dot(b, c).abs() < 1e-12);
    }

    #[test]
    fn normalize_rejects_null_vector() {
        assert!(normalize([0.0, 0.0, 0.0]).is_err());
        let u = normalize([3.0, 0.0, 4.0]).unwrap();
        assert!((dot(u, u) - 1.0).abs() < 1e-12);
    }
}
