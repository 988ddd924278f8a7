use statrs::distribution::{ContinuousCDF, Normal};

/// Wald test of a single fixed-effect coefficient against zero.
#[derive(Debug, Clone)]
pub struct WaldTest {
    /// Column of the design matrix being tested.
    pub index: usize,
    pub estimate: f64,
    pub se: f64,
    /// z = estimate / se.
    pub z: f64,
    /// Two-sided p-value from the standard normal distribution.
    pub p_value: f64,
}

/// Compute the Wald z test for one coefficient from its estimate and
/// sampling variance.
///
/// A non-positive or non-finite variance yields `z = NaN` and `p = NaN`
/// rather than an infinite statistic.
pub fn wald_test(index: usize, estimate: f64, variance: f64) -> WaldTest {
    if !(variance > 0.0) || !variance.is_finite() || !estimate.is_finite() {
        return WaldTest {
            index,
            estimate,
            se: variance.max(0.0).sqrt(),
            z: f64::NAN,
            p_value: f64::NAN,
        };
    }
    let se = variance.sqrt();
    let z = estimate / se;
    WaldTest {
        index,
        estimate,
        se,
        z,
        p_value: two_sided_normal_p(z),
    }
}

/// `2 * P(Z > |z|)` for a standard normal Z.
pub fn two_sided_normal_p(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    // Normal::new(0, 1) cannot fail.
    match Normal::new(0.0, 1.0) {
        Ok(normal) => (2.0 * normal.sf(z.abs())).min(1.0),
        Err(_) => f64::NAN,
    }
}

/// Wald tests for every coefficient of a fit.
pub fn wald_tests(fit: &crate::lmm::MixedModelFit) -> Vec<WaldTest> {
    (0..fit.n_fixed())
        .map(|j| wald_test(j, fit.beta[j], fit.varbeta[(j, j)]))
        .collect()
}

/// Format Wald tests as a table, with optional coefficient labels.
pub fn format_wald_tests(tests: &[WaldTest], labels: Option<&[String]>) -> String {
    let mut s = String::new();
    s.push_str("--- Wald Tests for Fixed Effects ---\n");
    s.push_str(&format!(
        "{:<20} {:>12} {:>12} {:>10} {:>12}\n",
        "Term", "Estimate", "SE", "z", "Pr(>|z|)"
    ));
    s.push_str(&format!("{}\n", "-".repeat(70)));

    for test in tests {
        let significance = if test.p_value < 0.001 {
            "***"
        } else if test.p_value < 0.01 {
            "**"
        } else if test.p_value < 0.05 {
            "*"
        } else if test.p_value < 0.1 {
            "."
        } else {
            ""
        };
        let label = labels
            .and_then(|l| l.get(test.index).cloned())
            .unwrap_or_else(|| format!("beta[{}]", test.index));

        s.push_str(&format!(
            "{:<20} {:>12.6} {:>12.6} {:>10.4} {:>12.4e} {}\n",
            label, test.estimate, test.se, test.z, test.p_value, significance
        ));
    }

    s.push_str("---\nSignif. codes:  0 '***' 0.001 '**' 0.01 '*' 0.05 '.' 0.1 ' ' 1\n");
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_known_p_values() {
        assert_relative_eq!(two_sided_normal_p(0.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(two_sided_normal_p(1.959963984540054), 0.05, epsilon = 1e-9);
        assert_relative_eq!(two_sided_normal_p(-2.5758293035489), 0.01, epsilon = 1e-9);
    }

    #[test]
    fn test_wald_test_values() {
        let t = wald_test(1, 0.5, 0.0625);
        assert_eq!(t.index, 1);
        assert_relative_eq!(t.se, 0.25, epsilon = 1e-12);
        assert_relative_eq!(t.z, 2.0, epsilon = 1e-12);
        assert_relative_eq!(t.p_value, 0.04550026389635842, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_variance_gives_nan() {
        let t = wald_test(0, 1.0, 0.0);
        assert!(t.z.is_nan());
        assert!(t.p_value.is_nan());
    }

    #[test]
    fn test_format_wald_tests() {
        let tests = vec![wald_test(0, 5.0, 0.25), wald_test(1, 0.1, 1.0)];
        let labels = vec!["intercept".to_string(), "marker_17".to_string()];
        let output = format_wald_tests(&tests, Some(labels.as_slice()));
        assert!(output.contains("Wald Tests"));
        assert!(output.contains("intercept"));
        assert!(output.contains("marker_17"));
        assert!(output.contains("***"));

        let unlabeled = format_wald_tests(&tests, None);
        assert!(unlabeled.contains("beta[1]"));
    }
}
