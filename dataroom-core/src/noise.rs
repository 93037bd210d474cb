use rand::Rng;

/// Smallest argument handed to `ln` so a draw at the edge of the unit
/// interval cannot produce an infinite sample.
const LN_FLOOR: f64 = 1e-12;

/// Draws from Laplace(0, `scale`) by inverse-CDF sampling.
///
/// `u` is uniform in `[-0.5, 0.5)` and the sample is
/// `-scale * sign(u) * ln(1 - 2|u|)`. A zero scale yields zero noise.
pub fn sample_laplace<R: Rng + ?Sized>(rng: &mut R, scale: f64) -> f64 {
    if scale <= 0.0 {
        return 0.0;
    }
    let u: f64 = rng.gen::<f64>() - 0.5;
    let sign = if u >= 0.0 { 1.0 } else { -1.0 };
    let magnitude = (1.0 - 2.0 * u.abs()).max(LN_FLOOR);
    -scale * sign * magnitude.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn samples_are_finite_and_centered() {
        let mut rng = StdRng::seed_from_u64(7);
        let draws: Vec<f64> = (0..20_000).map(|_| sample_laplace(&mut rng, 2.0)).collect();
        assert!(draws.iter().all(|d| d.is_finite()));
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        assert!(mean.abs() < 0.1, "mean drifted to {mean}");
        // E|X| = scale for a Laplace distribution.
        let mad = draws.iter().map(|d| d.abs()).sum::<f64>() / draws.len() as f64;
        assert!((mad - 2.0).abs() < 0.1, "mean absolute deviation {mad}");
    }

    #[test]
    fn zero_scale_adds_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample_laplace(&mut rng, 0.0), 0.0);
    }
}
