use serde::{Deserialize, Serialize};

/// Order of the four values in a raw quad as requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisOrder {
    /// `[y_min, x_min, y_max, x_max]`
    YxYx,
    /// `[x_min, y_min, x_max, y_max]`
    XyXy,
}

impl AxisOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            AxisOrder::YxYx => "yx",
            AxisOrder::XyXy => "xy",
        }
    }
}

/// Pixel rectangle with `min <= max` on both axes, clamped to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> u32 {
        self.y_max - self.y_min
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x_min <= self.x_max
            && self.y_min <= self.y_max
            && self.x_max <= width
            && self.y_max <= height
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    #[serde(rename = "box")]
    pub bbox: PixelRect,
}

/// One entry of a segmentation answer. `mask` is the base64 PNG exactly as
/// the model returned it, possibly with a `data:image/png;base64,` prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationEntry {
    pub label: String,
    pub mask: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AxisOrder, DetectedObject, PixelRect};

    #[test]
    fn detected_object_serializes_box_key() -> anyhow::Result<()> {
        let object = DetectedObject {
            label: "cat".to_string(),
            bbox: PixelRect {
                x_min: 1,
                y_min: 2,
                x_max: 3,
                y_max: 4,
            },
        };
        let value = serde_json::to_value(&object)?;
        assert_eq!(
            value,
            json!({"label": "cat", "box": {"x_min": 1, "y_min": 2, "x_max": 3, "y_max": 4}})
        );
        Ok(())
    }

    #[test]
    fn rect_bounds_checks() {
        let rect = PixelRect {
            x_min: 10,
            y_min: 0,
            x_max: 10,
            y_max: 40,
        };
        assert!(rect.is_empty());
        assert!(rect.fits_within(10, 40));
        assert!(!rect.fits_within(9, 40));
        assert_eq!(AxisOrder::YxYx.as_str(), "yx");
    }
}
