//! The complex number type.

use crate::types::str::format_float;

/// Pair of 64-bit floats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complex {
    pub real: f64,
    pub imag: f64,
}

impl Complex {
    #[must_use]
    pub fn new(real: f64, imag: f64) -> Self {
        Self { real, imag }
    }

    #[must_use]
    pub fn add(self, other: Self) -> Self {
        Self::new(self.real + other.real, self.imag + other.imag)
    }

    #[must_use]
    pub fn sub(self, other: Self) -> Self {
        Self::new(self.real - other.real, self.imag - other.imag)
    }

    #[must_use]
    pub fn mul(self, other: Self) -> Self {
        Self::new(
            self.real * other.real - self.imag * other.imag,
            self.real * other.imag + self.imag * other.real,
        )
    }

    #[must_use]
    pub fn div(self, other: Self) -> Self {
        let denom = other.real * other.real + other.imag * other.imag;
        Self::new(
            (self.real * other.real + self.imag * other.imag) / denom,
            (self.imag * other.real - self.real * other.imag) / denom,
        )
    }

    #[must_use]
    pub fn neg(self) -> Self {
        Self::new(-self.real, -self.imag)
    }

    #[must_use]
    pub fn is_zero_denominator(&self) -> bool {
        self.real == 0.0 && self.imag == 0.0
    }

    /// The `(a+bj)` repr; a pure-imaginary value renders without parens.
    #[must_use]
    pub fn repr(&self) -> String {
        if self.real == 0.0 && self.real.is_sign_positive() {
            return format!("{}j", format_num(self.imag));
        }
        let sign = if self.imag >= 0.0 || self.imag.is_nan() { "+" } else { "-" };
        format!("({}{sign}{}j)", format_num(self.real), format_num(self.imag.abs()))
    }
}

/// Complex components drop the trailing `.0` of integral floats.
fn format_num(value: f64) -> String {
    if value == value.trunc() && value.is_finite() && value.abs() < 1e16 {
        format!("{}", value as i64)
    } else {
        format_float(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_forms() {
        assert_eq!(Complex::new(0.0, 1.0).repr(), "1j");
        assert_eq!(Complex::new(1.0, 2.0).repr(), "(1+2j)");
        assert_eq!(Complex::new(1.5, -2.0).repr(), "(1.5-2j)");
    }

    #[test]
    fn arithmetic() {
        let a = Complex::new(1.0, 2.0);
        let b = Complex::new(3.0, -1.0);
        assert_eq!(a.mul(b), Complex::new(5.0, 5.0));
        assert_eq!(a.add(b), Complex::new(4.0, 1.0));
    }
}
