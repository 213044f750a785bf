use nalgebra::{Matrix2, Vector2};
use num_traits::{One, Zero};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Second-order forward-mode jet in the two domain parameters.
///
/// Carries a value together with its exact gradient and Hessian with
/// respect to `(u, v)`. Arithmetic propagates all three by the chain rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jet {
    pub val: f64,
    pub du: f64,
    pub dv: f64,
    pub duu: f64,
    pub duv: f64,
    pub dvv: f64,
}

impl Jet {
    pub fn constant(val: f64) -> Self {
        Self {
            val,
            du: 0.0,
            dv: 0.0,
            duu: 0.0,
            duv: 0.0,
            dvv: 0.0,
        }
    }

    /// The independent variable `u` seeded at `val`.
    pub fn var_u(val: f64) -> Self {
        Self {
            du: 1.0,
            ..Self::constant(val)
        }
    }

    /// The independent variable `v` seeded at `val`.
    pub fn var_v(val: f64) -> Self {
        Self {
            dv: 1.0,
            ..Self::constant(val)
        }
    }

    pub fn gradient(&self) -> Vector2<f64> {
        Vector2::new(self.du, self.dv)
    }

    pub fn hessian(&self) -> Matrix2<f64> {
        Matrix2::new(self.duu, self.duv, self.duv, self.dvv)
    }

    pub fn is_finite(&self) -> bool {
        [self.val, self.du, self.dv, self.duu, self.duv, self.dvv]
            .iter()
            .all(|x| x.is_finite())
    }

    /// Applies a scalar function `g` given `g(x)`, `g'(x)` and `g''(x)`.
    fn chain(self, g0: f64, g1: f64, g2: f64) -> Self {
        Self {
            val: g0,
            du: g1 * self.du,
            dv: g1 * self.dv,
            duu: g2 * self.du * self.du + g1 * self.duu,
            duv: g2 * self.du * self.dv + g1 * self.duv,
            dvv: g2 * self.dv * self.dv + g1 * self.dvv,
        }
    }

    pub fn sin(self) -> Self {
        let (s, c) = self.val.sin_cos();
        self.chain(s, c, -s)
    }

    pub fn cos(self) -> Self {
        let (s, c) = self.val.sin_cos();
        self.chain(c, -s, -c)
    }

    pub fn tan(self) -> Self {
        let t = self.val.tan();
        let sec2 = 1.0 + t * t;
        self.chain(t, sec2, 2.0 * t * sec2)
    }

    pub fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e, e)
    }

    pub fn ln(self) -> Self {
        let x = self.val;
        self.chain(x.ln(), 1.0 / x, -1.0 / (x * x))
    }

    pub fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s, -0.25 / (s * self.val))
    }

    pub fn abs(self) -> Self {
        let sign = if self.val >= 0.0 { 1.0 } else { -1.0 };
        self.chain(self.val.abs(), sign, 0.0)
    }

    pub fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::one();
        }
        let x = self.val;
        let nf = n as f64;
        let g1 = nf * x.powi(n - 1);
        let g2 = if n == 1 {
            0.0
        } else {
            nf * (nf - 1.0) * x.powi(n - 2)
        };
        self.chain(x.powi(n), g1, g2)
    }

    /// `self ^ exponent`. Integer constant exponents stay exact for negative bases.
    pub fn powf(self, exponent: Self) -> Self {
        let is_constant = (exponent - Self::constant(exponent.val)).is_zero();
        if is_constant && exponent.val.fract() == 0.0 && exponent.val.abs() < i32::MAX as f64 {
            return self.powi(exponent.val as i32);
        }
        if is_constant {
            let p = exponent.val;
            let x = self.val;
            return self.chain(x.powf(p), p * x.powf(p - 1.0), p * (p - 1.0) * x.powf(p - 2.0));
        }
        // x^y = exp(y * ln(x))
        (exponent * self.ln()).exp()
    }
}

impl Zero for Jet {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

impl One for Jet {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Add for Jet {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            val: self.val + rhs.val,
            du: self.du + rhs.du,
            dv: self.dv + rhs.dv,
            duu: self.duu + rhs.duu,
            duv: self.duv + rhs.duv,
            dvv: self.dvv + rhs.dvv,
        }
    }
}

impl Sub for Jet {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

impl Mul for Jet {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self {
            val: self.val * rhs.val,
            du: self.du * rhs.val + self.val * rhs.du,
            dv: self.dv * rhs.val + self.val * rhs.dv,
            duu: self.duu * rhs.val + 2.0 * self.du * rhs.du + self.val * rhs.duu,
            duv: self.duv * rhs.val
                + self.du * rhs.dv
                + self.dv * rhs.du
                + self.val * rhs.duv,
            dvv: self.dvv * rhs.val + 2.0 * self.dv * rhs.dv + self.val * rhs.dvv,
        }
    }
}

impl Div for Jet {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let x = rhs.val;
        let recip = rhs.chain(1.0 / x, -1.0 / (x * x), 2.0 / (x * x * x));
        self * recip
    }
}

impl Neg for Jet {
    type Output = Self;
    fn neg(self) -> Self {
        Self {
            val: -self.val,
            du: -self.du,
            dv: -self.dv,
            duu: -self.duu,
            duv: -self.duv,
            dvv: -self.dvv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn product_rule_matches_closed_form() {
        // f = u^2 * v at (2, 3): fu = 2uv, fv = u^2, fuu = 2v, fuv = 2u, fvv = 0
        let u = Jet::var_u(2.0);
        let v = Jet::var_v(3.0);
        let f = u * u * v;
        assert_abs_diff_eq!(f.val, 12.0);
        assert_abs_diff_eq!(f.du, 12.0);
        assert_abs_diff_eq!(f.dv, 4.0);
        assert_abs_diff_eq!(f.duu, 6.0);
        assert_abs_diff_eq!(f.duv, 4.0);
        assert_abs_diff_eq!(f.dvv, 0.0);
    }

    #[test]
    fn quotient_and_sin_chain() {
        // f = sin(u) / v at (0.3, 2)
        let u = Jet::var_u(0.3);
        let v = Jet::var_v(2.0);
        let f = u.sin() / v;
        assert_abs_diff_eq!(f.val, 0.3f64.sin() / 2.0, epsilon = 1e-14);
        assert_abs_diff_eq!(f.du, 0.3f64.cos() / 2.0, epsilon = 1e-14);
        assert_abs_diff_eq!(f.dv, -0.3f64.sin() / 4.0, epsilon = 1e-14);
        assert_abs_diff_eq!(f.duu, -0.3f64.sin() / 2.0, epsilon = 1e-14);
        assert_abs_diff_eq!(f.duv, -0.3f64.cos() / 4.0, epsilon = 1e-14);
        assert_abs_diff_eq!(f.dvv, 2.0 * 0.3f64.sin() / 8.0, epsilon = 1e-14);
    }

    #[test]
    fn integer_power_of_negative_base_is_exact() {
        let u = Jet::var_u(-1.5);
        let f = u.powf(Jet::constant(3.0));
        assert_abs_diff_eq!(f.val, -3.375, epsilon = 1e-14);
        assert_abs_diff_eq!(f.du, 3.0 * 2.25, epsilon = 1e-14);
        assert_abs_diff_eq!(f.duu, 6.0 * -1.5, epsilon = 1e-14);
    }

    #[test]
    fn zero_power_is_the_constant_one() {
        let u = Jet::var_u(0.0);
        let f = u.powf(Jet::zero());
        assert!(f.is_one());
        assert!((f - Jet::one()).is_zero());
        assert_eq!(Jet::var_v(2.0) * Jet::one(), Jet::var_v(2.0));
        // non-constant exponent: u^v at (2, 1)
        let g = Jet::var_u(2.0).powf(Jet::var_v(1.0));
        assert_abs_diff_eq!(g.val, 2.0, epsilon = 1e-14);
        assert_abs_diff_eq!(g.du, 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(g.dv, 2.0 * 2f64.ln(), epsilon = 1e-14);
    }

    #[test]
    fn sqrt_second_derivative() {
        let u = Jet::var_u(4.0);
        let f = u.sqrt();
        assert_abs_diff_eq!(f.du, 0.25, epsilon = 1e-14);
        assert_abs_diff_eq!(f.duu, -1.0 / 32.0, epsilon = 1e-14);
    }
}
