//! Converts model-reported quads into clamped pixel rectangles.
//!
//! The model family reports boxes as unit-normalized values, values
//! normalized to 0..1000, or raw pixels, and does not say which. The unit is
//! inferred from all four values together. A small box on a large image
//! whose pixel values all fall under 1000 is read as 0..1000 normalized;
//! that ambiguity comes from the upstream convention and is kept.

use gemlens_contracts::detection::{AxisOrder, PixelRect};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("expected 4 coordinates, got {0}")]
    Arity(usize),
    #[error("coordinate {0} is not a finite number")]
    NonFinite(usize),
    #[error("coordinate {0} is not numeric")]
    NotNumeric(usize),
    #[error("box is not a JSON array")]
    NotAnArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateUnit {
    Unit,
    Millis,
    Pixel,
}

pub fn classify(values: &[f64]) -> CoordinateUnit {
    if values.iter().all(|value| (0.0..=1.0).contains(value)) {
        return CoordinateUnit::Unit;
    }
    if values.iter().all(|value| (0.0..=1000.0).contains(value)) {
        return CoordinateUnit::Millis;
    }
    CoordinateUnit::Pixel
}

pub fn normalize(
    quad: &[f64],
    width: u32,
    height: u32,
    axis: AxisOrder,
) -> Result<PixelRect, GeometryError> {
    if quad.len() != 4 {
        return Err(GeometryError::Arity(quad.len()));
    }
    if let Some(idx) = quad.iter().position(|value| !value.is_finite()) {
        return Err(GeometryError::NonFinite(idx));
    }

    let (x0, y0, x1, y1) = match axis {
        AxisOrder::YxYx => (quad[1], quad[0], quad[3], quad[2]),
        AxisOrder::XyXy => (quad[0], quad[1], quad[2], quad[3]),
    };
    let unit = classify(quad);
    let scale = |value: f64, dim: u32| -> i64 {
        match unit {
            CoordinateUnit::Unit => (value * dim as f64).round() as i64,
            CoordinateUnit::Millis => (value / 1000.0 * dim as f64).round() as i64,
            CoordinateUnit::Pixel => value.trunc() as i64,
        }
    };

    let clamp_x = |value: i64| value.clamp(0, width as i64) as u32;
    let clamp_y = |value: i64| value.clamp(0, height as i64) as u32;
    let (ax, bx) = (clamp_x(scale(x0, width)), clamp_x(scale(x1, width)));
    let (ay, by) = (clamp_y(scale(y0, height)), clamp_y(scale(y1, height)));

    Ok(PixelRect {
        x_min: ax.min(bx),
        y_min: ay.min(by),
        x_max: ax.max(bx),
        y_max: ay.max(by),
    })
}

/// Reads a JSON box as a list of numbers. Numeric strings are accepted;
/// the arity is checked later by [`normalize`].
pub fn quad_from_value(value: &Value) -> Result<Vec<f64>, GeometryError> {
    let rows = value.as_array().ok_or(GeometryError::NotAnArray)?;
    rows.iter()
        .enumerate()
        .map(|(idx, row)| parse_value_to_f64(row).ok_or(GeometryError::NotNumeric(idx)))
        .collect()
}

fn parse_value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use gemlens_contracts::detection::{AxisOrder, PixelRect};
    use serde_json::json;

    use super::{classify, normalize, quad_from_value, CoordinateUnit, GeometryError};

    fn rect(x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> PixelRect {
        PixelRect {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    #[test]
    fn unit_quad_scales_by_dimensions() {
        let out = normalize(&[0.1, 0.2, 0.6, 0.8], 1000, 500, AxisOrder::YxYx);
        assert_eq!(out, Ok(rect(200, 50, 800, 300)));
    }

    #[test]
    fn millis_quad_divides_by_thousand() {
        let out = normalize(&[100.0, 200.0, 400.0, 500.0], 1000, 1000, AxisOrder::YxYx);
        assert_eq!(out, Ok(rect(200, 100, 500, 400)));

        let out = normalize(&[500.0, 0.0, 1000.0, 250.0], 640, 480, AxisOrder::XyXy);
        assert_eq!(out, Ok(rect(320, 0, 640, 120)));
    }

    #[test]
    fn pixel_quad_is_truncated() {
        let out = normalize(&[10.9, 20.2, 1500.7, 900.1], 2000, 1000, AxisOrder::XyXy);
        assert_eq!(out, Ok(rect(10, 20, 1500, 900)));
    }

    #[test]
    fn unit_values_round_to_nearest_pixel() {
        // 0.29 * 100 is 28.999999999999996 in f64.
        let out = normalize(&[0.29, 0.0, 1.0, 1.0], 100, 100, AxisOrder::XyXy);
        assert_eq!(out, Ok(rect(29, 0, 100, 100)));
    }

    #[test]
    fn out_of_order_and_out_of_range_values_are_repaired() {
        let out = normalize(&[-50.0, 1800.0, 1200.0, 300.0], 1024, 768, AxisOrder::XyXy);
        assert_eq!(out, Ok(rect(0, 300, 1024, 768)));

        let out = normalize(&[0.9, 0.8, 0.1, 0.2], 10, 10, AxisOrder::YxYx);
        assert_eq!(out, Ok(rect(2, 1, 8, 9)));
    }

    #[test]
    fn rect_invariant_holds_for_hostile_quads() {
        let samples: [[f64; 4]; 6] = [
            [1e9, -1e9, 3.0, 4.0],
            [999.0, 1.0, 0.0, 1000.0],
            [0.5, 0.5, 0.5, 0.5],
            [-0.0, 2.0, -3.0, 7.5],
            [1001.0, 1001.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 0.0],
        ];
        for (width, height) in [(1, 1), (37, 911), (4000, 3000)] {
            for quad in samples {
                for axis in [AxisOrder::YxYx, AxisOrder::XyXy] {
                    let out = normalize(&quad, width, height, axis)
                        .unwrap_or_else(|err| panic!("{quad:?}: {err}"));
                    assert!(out.fits_within(width, height), "{quad:?} -> {out:?}");
                }
            }
        }
    }

    #[test]
    fn wrong_arity_is_a_format_error() {
        assert_eq!(
            normalize(&[1.0, 2.0, 3.0], 10, 10, AxisOrder::XyXy),
            Err(GeometryError::Arity(3))
        );
        assert_eq!(
            normalize(&[1.0, 2.0, 3.0, 4.0, 5.0], 10, 10, AxisOrder::XyXy),
            Err(GeometryError::Arity(5))
        );
        assert_eq!(
            normalize(&[1.0, f64::NAN, 3.0, 4.0], 10, 10, AxisOrder::XyXy),
            Err(GeometryError::NonFinite(1))
        );
    }

    #[test]
    fn classification_tiers() {
        assert_eq!(classify(&[0.0, 1.0, 0.5, 0.25]), CoordinateUnit::Unit);
        assert_eq!(classify(&[0.0, 1.5, 0.5, 0.25]), CoordinateUnit::Millis);
        assert_eq!(classify(&[0.0, 1000.5, 0.5, 0.25]), CoordinateUnit::Pixel);
        assert_eq!(classify(&[-1.0, 10.0, 20.0, 30.0]), CoordinateUnit::Pixel);
    }

    #[test]
    fn json_quads_accept_numeric_strings() {
        assert_eq!(
            quad_from_value(&json!([1, "2.5", 3.0, " 4 "])),
            Ok(vec![1.0, 2.5, 3.0, 4.0])
        );
        assert_eq!(
            quad_from_value(&json!([1, null, 3, 4])),
            Err(GeometryError::NotNumeric(1))
        );
        assert_eq!(
            quad_from_value(&json!({"x": 1})),
            Err(GeometryError::NotAnArray)
        );
    }
}
