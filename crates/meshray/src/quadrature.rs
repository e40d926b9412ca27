//! 1D Gauss quadrature along ray segments.
//!
//! The study builds one rule at setup; the tracer maps it onto each
//! segment during reinit so segment hooks can integrate fields.

use crate::geom::Point;

/// Gauss–Legendre rule on [-1, 1].
#[derive(Clone, Debug)]
pub struct GaussRule {
    pub points: Vec<f64>,
    pub weights: Vec<f64>,
}

impl GaussRule {
    /// Rule exact for polynomials of the given order (up to 9).
    pub fn for_order(order: usize) -> Self {
        let n = order / 2 + 1;
        let (points, weights): (Vec<f64>, Vec<f64>) = match n {
            1 => (vec![0.0], vec![2.0]),
            2 => {
                let x = 1.0 / 3.0_f64.sqrt();
                (vec![-x, x], vec![1.0, 1.0])
            }
            3 => {
                let x = (3.0_f64 / 5.0).sqrt();
                (vec![-x, 0.0, x], vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0])
            }
            4 => (
                vec![
                    -0.8611363115940526,
                    -0.3399810435848563,
                    0.3399810435848563,
                    0.8611363115940526,
                ],
                vec![
                    0.34785484513745385,
                    0.6521451548625461,
                    0.6521451548625461,
                    0.34785484513745385,
                ],
            ),
            _ => (
                vec![
                    -0.9061798459386640,
                    -0.5384693101056831,
                    0.0,
                    0.5384693101056831,
                    0.9061798459386640,
                ],
                vec![
                    0.23692688505618908,
                    0.47862867049936647,
                    0.5688888888888889,
                    0.47862867049936647,
                    0.23692688505618908,
                ],
            ),
        };
        Self { points, weights }
    }
}

/// The rule mapped onto a concrete segment: physical quadrature points
/// with their Jacobian-weighted contributions.
#[derive(Clone, Debug, Default)]
pub struct SegmentQuadrature {
    pub points: Vec<Point>,
    /// `JxW`: quadrature weight times the segment half-length.
    pub weights: Vec<f64>,
}

impl SegmentQuadrature {
    /// Re-maps the rule onto `start -> end`, reusing storage.
    pub fn reinit(&mut self, rule: &GaussRule, start: &Point, end: &Point, length: f64) {
        self.points.clear();
        self.weights.clear();
        let mid = (start + end) / 2.0;
        let half = (end - start) / 2.0;
        for (x, w) in rule.points.iter().zip(&rule.weights) {
            self.points.push(mid + half * *x);
            self.weights.push(w * length / 2.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_interval_length() {
        for order in [0, 1, 2, 3, 5, 7, 9] {
            let rule = GaussRule::for_order(order);
            let sum: f64 = rule.weights.iter().sum();
            assert!((sum - 2.0).abs() < 1e-12, "order {order}");
        }
    }

    #[test]
    fn segment_integrates_linear_exactly() {
        let rule = GaussRule::for_order(1);
        let mut quad = SegmentQuadrature::default();
        let start = Point::new(1.0, 0.0, 0.0);
        let end = Point::new(3.0, 0.0, 0.0);
        quad.reinit(&rule, &start, &end, 2.0);

        // ∫ x dx over [1, 3] = 4
        let integral: f64 = quad
            .points
            .iter()
            .zip(&quad.weights)
            .map(|(p, w)| p.x * w)
            .sum();
        assert!((integral - 4.0).abs() < 1e-12);
    }
}
