//! Draws detections and segmentation masks onto copies of the source image.

use gemlens_contracts::detection::{DetectedObject, PixelRect, SegmentationEntry};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::{debug, warn};

use crate::extract::decode_base64;
use crate::fonts::FontBook;

pub const PALETTE: [[u8; 3]; 6] = [
    [255, 0, 0],
    [0, 200, 0],
    [0, 0, 255],
    [255, 215, 0],
    [255, 0, 255],
    [0, 255, 255],
];

pub const STROKE_WIDTH: u32 = 3;
pub const CHIP_PADDING: u32 = 4;
pub const LABEL_SCALE: f32 = 18.0;
pub const MASK_ALPHA: u32 = 128;

const LABEL_TEXT: Rgba<u8> = Rgba([255, 255, 255, 255]);

pub fn palette_color(index: usize) -> Rgba<u8> {
    let [r, g, b] = PALETTE[index % PALETTE.len()];
    Rgba([r, g, b, 255])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// One box worth of drawing instructions, fully resolved before any pixel
/// is touched.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxDrawOp {
    pub index: usize,
    pub color: Rgba<u8>,
    pub rect: PixelRect,
    pub chip: Option<ChipRect>,
    pub text_origin: (i32, i32),
    pub label: String,
}

pub fn plan_boxes(
    objects: &[DetectedObject],
    width: u32,
    height: u32,
    fonts: &FontBook,
) -> Vec<BoxDrawOp> {
    objects
        .iter()
        .enumerate()
        .map(|(index, object)| {
            let rect = clamp_rect(object.bbox, width, height);
            let (text_w, text_h) = fonts.measure(LABEL_SCALE, &object.label);
            let chip = (text_w > 0).then(|| {
                let chip_height = text_h + 2 * CHIP_PADDING;
                ChipRect {
                    x: rect.x_min as i32,
                    // Above the box; pinned to the top row when there is no room.
                    y: (rect.y_min as i32 - chip_height as i32).max(0),
                    width: text_w + 2 * CHIP_PADDING,
                    height: chip_height,
                }
            });
            let text_origin = chip
                .map(|chip| (chip.x + CHIP_PADDING as i32, chip.y + CHIP_PADDING as i32))
                .unwrap_or((rect.x_min as i32, rect.y_min as i32));
            BoxDrawOp {
                index,
                color: palette_color(index),
                rect,
                chip,
                text_origin,
                label: object.label.clone(),
            }
        })
        .collect()
}

fn clamp_rect(rect: PixelRect, width: u32, height: u32) -> PixelRect {
    let x_max = rect.x_max.min(width);
    let y_max = rect.y_max.min(height);
    PixelRect {
        x_min: rect.x_min.min(x_max),
        y_min: rect.y_min.min(y_max),
        x_max,
        y_max,
    }
}

pub fn render_plan(canvas: &mut RgbaImage, plan: &[BoxDrawOp], fonts: &FontBook) {
    for op in plan {
        let outer_w = op.rect.width().max(1);
        let outer_h = op.rect.height().max(1);
        for inset in 0..STROKE_WIDTH {
            let (Some(w), Some(h)) = (
                outer_w.checked_sub(2 * inset).filter(|w| *w > 0),
                outer_h.checked_sub(2 * inset).filter(|h| *h > 0),
            ) else {
                break;
            };
            let outline = Rect::at((op.rect.x_min + inset) as i32, (op.rect.y_min + inset) as i32)
                .of_size(w, h);
            draw_hollow_rect_mut(canvas, outline, op.color);
        }

        let Some(chip) = op.chip else {
            continue;
        };
        draw_filled_rect_mut(
            canvas,
            Rect::at(chip.x, chip.y).of_size(chip.width, chip.height),
            op.color,
        );
        draw_text_mut(
            canvas,
            LABEL_TEXT,
            op.text_origin.0,
            op.text_origin.1,
            LABEL_SCALE,
            fonts.font(),
            &op.label,
        );
    }
}

pub fn draw_boxes(image: &DynamicImage, objects: &[DetectedObject], fonts: &FontBook) -> RgbaImage {
    let mut canvas = image.to_rgba8();
    let plan = plan_boxes(objects, canvas.width(), canvas.height(), fonts);
    render_plan(&mut canvas, &plan, fonts);
    debug!(boxes = plan.len(), "rendered detection boxes");
    canvas
}

#[derive(Debug, Clone)]
pub struct MaskArtifact {
    pub index: usize,
    pub label: String,
    pub image: RgbaImage,
}

#[derive(Debug, Clone, Default)]
pub struct MaskBatch {
    pub artifacts: Vec<MaskArtifact>,
    pub attempted: usize,
    pub failures: Vec<String>,
}

/// Produces one overlay per segment. A segment whose mask cannot be decoded
/// is recorded in `failures` and the rest continue.
pub fn composite_masks(image: &DynamicImage, segments: &[SegmentationEntry]) -> MaskBatch {
    let base = image.to_rgba8();
    let mut batch = MaskBatch {
        attempted: segments.len(),
        ..MaskBatch::default()
    };
    for (index, segment) in segments.iter().enumerate() {
        match overlay_mask(&base, &segment.mask, palette_color(index)) {
            Ok(image) => batch.artifacts.push(MaskArtifact {
                index,
                label: segment.label.clone(),
                image,
            }),
            Err(reason) => {
                warn!(index, label = %segment.label, %reason, "skipping segmentation mask");
                batch
                    .failures
                    .push(format!("segment {index} ({}): {reason}", segment.label));
            }
        }
    }
    batch
}

fn overlay_mask(base: &RgbaImage, encoded: &str, color: Rgba<u8>) -> Result<RgbaImage, String> {
    let bytes = decode_base64(encoded)?;
    let mask = image::load_from_memory(&bytes)
        .map_err(|err| format!("mask decode failed: {err}"))?
        .to_luma8();
    let (width, height) = base.dimensions();
    let mask: GrayImage = if mask.dimensions() == (width, height) {
        mask
    } else {
        imageops::resize(&mask, width, height, FilterType::Triangle)
    };

    let [r, g, b, _] = color.0;
    let layer = RgbaImage::from_fn(width, height, |x, y| {
        let level = mask.get_pixel(x, y).0[0] as u32;
        Rgba([r, g, b, (level * MASK_ALPHA / 255) as u8])
    });
    let mut out = base.clone();
    imageops::overlay(&mut out, &layer, 0, 0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use gemlens_contracts::detection::{DetectedObject, PixelRect, SegmentationEntry};
    use image::{DynamicImage, ImageFormat, Luma, Rgba, RgbaImage};

    use super::{composite_masks, draw_boxes, palette_color, plan_boxes, PALETTE};
    use crate::fonts::FontBook;

    fn object(label: &str, x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> DetectedObject {
        DetectedObject {
            label: label.to_string(),
            bbox: PixelRect {
                x_min,
                y_min,
                x_max,
                y_max,
            },
        }
    }

    fn white(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255])))
    }

    fn mask_png(width: u32, height: u32, level: u8) -> anyhow::Result<String> {
        let mask = image::GrayImage::from_pixel(width, height, Luma([level]));
        let mut bytes = Vec::new();
        mask.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(format!("data:image/png;base64,{}", BASE64.encode(bytes)))
    }

    #[test]
    fn plans_are_deterministic_and_wrap_the_palette() {
        let fonts = FontBook::embedded();
        let objects: Vec<_> = (0..8)
            .map(|idx| object(&format!("item {idx}"), idx * 10, 40, idx * 10 + 8, 60))
            .collect();
        let first = plan_boxes(&objects, 200, 100, &fonts);
        let second = plan_boxes(&objects, 200, 100, &fonts);
        assert_eq!(first, second);
        assert_eq!(first[6].color, first[0].color);
        assert_eq!(first[7].color, first[1].color);
        assert_ne!(first[0].color, first[1].color);
        assert_eq!(palette_color(PALETTE.len() * 3 + 2), palette_color(2));
    }

    #[test]
    fn chip_sits_above_box_and_clamps_at_top() {
        let fonts = FontBook::embedded();
        let plan = plan_boxes(
            &[object("dog", 20, 100, 80, 150), object("kite", 5, 2, 50, 30)],
            200,
            200,
            &fonts,
        );
        let low = plan[0].chip.unwrap_or_else(|| panic!("missing chip"));
        assert_eq!(low.y + low.height as i32, 100);
        assert_eq!(low.x, 20);
        let high = plan[1].chip.unwrap_or_else(|| panic!("missing chip"));
        assert_eq!(high.y, 0);
        assert_eq!(plan[1].text_origin, (high.x + 4, high.y + 4));
    }

    #[test]
    fn empty_label_gets_no_chip() {
        let fonts = FontBook::embedded();
        let plan = plan_boxes(&[object("", 1, 1, 5, 5)], 10, 10, &fonts);
        assert!(plan[0].chip.is_none());
    }

    #[test]
    fn outline_uses_palette_color() {
        let fonts = FontBook::embedded();
        let out = draw_boxes(
            &white(200, 200),
            &[object("cat", 10, 60, 90, 160), object("mug", 120, 60, 180, 160)],
            &fonts,
        );
        assert_eq!(out.dimensions(), (200, 200));
        assert_eq!(*out.get_pixel(10, 110), palette_color(0));
        assert_eq!(*out.get_pixel(12, 110), palette_color(0));
        assert_eq!(*out.get_pixel(120, 110), palette_color(1));
        assert_eq!(*out.get_pixel(50, 110), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn degenerate_and_edge_boxes_do_not_panic() {
        let fonts = FontBook::embedded();
        let out = draw_boxes(
            &white(20, 20),
            &[object("dot", 5, 5, 5, 5), object("edge", 0, 0, 20, 20)],
            &fonts,
        );
        assert_eq!(out.dimensions(), (20, 20));
    }

    #[test]
    fn small_mask_is_resized_to_base_dimensions() -> anyhow::Result<()> {
        let segments = vec![SegmentationEntry {
            label: "blob".to_string(),
            mask: mask_png(50, 50, 255)?,
        }];
        let batch = composite_masks(&white(200, 200), &segments);
        assert_eq!(batch.attempted, 1);
        assert!(batch.failures.is_empty());
        let artifact = &batch.artifacts[0];
        assert_eq!(artifact.image.dimensions(), (200, 200));
        let pixel = artifact.image.get_pixel(100, 100);
        assert!(pixel.0[1] < 200, "expected red tint, got {pixel:?}");
        Ok(())
    }

    #[test]
    fn undecodable_masks_are_skipped() -> anyhow::Result<()> {
        let segments = vec![
            SegmentationEntry {
                label: "bad".to_string(),
                mask: "not-a-mask".to_string(),
            },
            SegmentationEntry {
                label: "good".to_string(),
                mask: mask_png(10, 10, 0)?,
            },
        ];
        let batch = composite_masks(&white(10, 10), &segments);
        assert_eq!(batch.attempted, 2);
        assert_eq!(batch.artifacts.len(), 1);
        assert_eq!(batch.artifacts[0].label, "good");
        assert_eq!(batch.artifacts[0].index, 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(
            *batch.artifacts[0].image.get_pixel(3, 3),
            Rgba([255, 255, 255, 255])
        );
        Ok(())
    }
}
