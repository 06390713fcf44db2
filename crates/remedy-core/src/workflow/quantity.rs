//! Kubernetes-style resource quantities for numeric parameter transforms.
//!
//! Only the subset the transforms need: a decimal magnitude followed by an
//! optional unit suffix (`500m`, `512Mi`, `2Gi`, `1.5`). Arithmetic happens in
//! the quantity's own unit, and the suffix is carried through unchanged.

use remedy_types::config::RoundingPolicy;
use serde_json::{json, Value};

const SUFFIXES: [&str; 13] = [
    "", "m", "k", "M", "G", "T", "P", "Ki", "Mi", "Gi", "Ti", "Pi", "%",
];

/// A magnitude with its unit suffix.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub suffix: String,
    /// Whether the quantity came from a JSON number rather than a string.
    pub numeric: bool,
}

impl Quantity {
    /// Parse a JSON number or quantity string.
    pub fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self {
                value: n.as_f64()?,
                suffix: String::new(),
                numeric: true,
            }),
            Value::String(s) => {
                let s = s.trim();
                let split = s
                    .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
                    .unwrap_or(s.len());
                let (magnitude, suffix) = s.split_at(split);
                if !SUFFIXES.contains(&suffix) {
                    return None;
                }
                Some(Self {
                    value: magnitude.parse().ok()?,
                    suffix: suffix.to_string(),
                    numeric: false,
                })
            }
            _ => None,
        }
    }

    /// Same unit, new magnitude.
    pub fn with_value(&self, value: f64) -> Self {
        Self {
            value,
            suffix: self.suffix.clone(),
            numeric: self.numeric,
        }
    }

    /// Render back into the JSON shape it was parsed from.
    pub fn to_value(&self) -> Value {
        if self.numeric && self.suffix.is_empty() {
            number_value(self.value)
        } else {
            Value::String(format!("{}{}", format_magnitude(self.value), self.suffix))
        }
    }
}

/// Round `value` to a multiple of `granularity` under `policy`.
///
/// The quotient is first snapped to 9 decimal places so binary float noise
/// (`100 * 1.1 = 110.00000000000001`) never rounds up a whole unit. The result
/// is snapped to the granularity's own decimal places (`17 * 0.1` is `1.7`).
pub fn round_to(value: f64, granularity: f64, policy: RoundingPolicy) -> f64 {
    let granularity = if granularity > 0.0 { granularity } else { 1.0 };
    let quotient = ((value / granularity) * 1e9).round() / 1e9;
    let rounded = match policy {
        RoundingPolicy::Ceil => quotient.ceil(),
        RoundingPolicy::Floor => quotient.floor(),
        RoundingPolicy::Nearest => quotient.round(),
    };
    let scale = 10f64.powi(decimal_places(granularity));
    (rounded * granularity * scale).round() / scale
}

/// Decimal places needed to write `granularity` exactly, capped at 9.
fn decimal_places(granularity: f64) -> i32 {
    (0..9)
        .find(|&d| {
            let scaled = granularity * 10f64.powi(d);
            (scaled - scaled.round()).abs() < 1e-9 * scaled.max(1.0)
        })
        .unwrap_or(9)
}

/// Render an f64 as an integer JSON number when it is whole.
pub fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn format_magnitude(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
