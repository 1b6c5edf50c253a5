use crate::error::OutOfRangeError;

/// Linear interpolation of the samples `(t, y)` at `t_query`.
///
/// `t` must be increasing. Queries outside `[t[0], t[last]]` are rejected,
/// never extrapolated.
pub fn interp_linear(t: &[f64], y: &[f64], t_query: &[f64]) -> Result<Vec<f64>, OutOfRangeError> {
    let (Some(&t_min), Some(&t_max)) = (t.first(), t.last()) else {
        return match t_query.first() {
            Some(&tq) => Err(OutOfRangeError {
                t: tq,
                min: f64::NAN,
                max: f64::NAN,
            }),
            None => Ok(Vec::new()),
        };
    };

    if let Some(&bad) = t_query.iter().find(|&&tq| tq < t_min || tq > t_max) {
        return Err(OutOfRangeError {
            t: bad,
            min: t_min,
            max: t_max,
        });
    }

    Ok(t_query
        .iter()
        .map(|&tq| {
            let i = t.partition_point(|&ti| ti <= tq);
            if i == 0 {
                return y[0];
            }
            if i >= t.len() {
                return y[t.len() - 1];
            }
            let (t0, t1) = (t[i - 1], t[i]);
            let w = if t1 > t0 { (tq - t0) / (t1 - t0) } else { 0.0 };
            y[i - 1] + w * (y[i] - y[i - 1])
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn interpolates_between_samples() {
        let t = [0.0, 1.0, 3.0];
        let y = [0.0, 2.0, 6.0];
        let v = interp_linear(&t, &y, &[0.5, 2.0, 3.0]).unwrap();
        assert_relative_eq!(v[0], 1.0);
        assert_relative_eq!(v[1], 4.0);
        assert_relative_eq!(v[2], 6.0);
    }

    #[test]
    fn rejects_extrapolation() {
        let err = interp_linear(&[0.0, 1.0], &[0.0, 1.0], &[0.5, 1.5]).unwrap_err();
        assert_eq!(err.t, 1.5);
    }
}
