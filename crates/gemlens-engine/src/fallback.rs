use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::draw_text_mut;

use crate::fonts::FontBook;

pub const CANVAS_WIDTH: u32 = 800;
pub const CANVAS_HEIGHT: u32 = 600;
pub const DEFAULT_ERROR_NOTE: &str = "Image generation failed. Please try a different prompt.";

const BACKGROUND: Rgba<u8> = Rgba([240, 240, 240, 255]);
const PROMPT_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);
const NOTE_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const OUTLINE_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);
const FILL_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);

const PROMPT_SCALE: f32 = 24.0;
const NOTE_SCALE: f32 = 16.0;
const NOTE_OFFSET: i32 = 30;
const EDIT_SCALE: f32 = 20.0;
const EDIT_ORIGIN: (i32, i32) = (10, 10);

/// Builds a stand-in image when no model produced one.
///
/// Without a base image this is an 800x600 card with the prompt centered
/// and a red note below it. With a base image the instruction is written in
/// the top-left corner with a dark outline. Never fails.
pub fn synthesize_placeholder(
    text: &str,
    base: Option<&DynamicImage>,
    error_note: Option<&str>,
    fonts: &FontBook,
) -> RgbaImage {
    match base {
        Some(base) => edit_overlay(text, base, fonts),
        None => generation_card(text, error_note.unwrap_or(DEFAULT_ERROR_NOTE), fonts),
    }
}

fn generation_card(prompt: &str, note: &str, fonts: &FontBook) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(CANVAS_WIDTH, CANVAS_HEIGHT, BACKGROUND);
    let line = format!("Generated image for: {prompt}");
    let center_x = CANVAS_WIDTH as i32 / 2;
    let center_y = CANVAS_HEIGHT as i32 / 2;

    let (line_w, line_h) = fonts.measure(PROMPT_SCALE, &line);
    draw_text_mut(
        &mut canvas,
        PROMPT_COLOR,
        center_x - line_w as i32 / 2,
        center_y - line_h as i32 / 2,
        PROMPT_SCALE,
        fonts.font(),
        &line,
    );

    if !note.is_empty() {
        let (note_w, note_h) = fonts.measure(NOTE_SCALE, note);
        draw_text_mut(
            &mut canvas,
            NOTE_COLOR,
            center_x - note_w as i32 / 2,
            center_y + NOTE_OFFSET - note_h as i32 / 2,
            NOTE_SCALE,
            fonts.font(),
            note,
        );
    }
    canvas
}

fn edit_overlay(instruction: &str, base: &DynamicImage, fonts: &FontBook) -> RgbaImage {
    let mut canvas = base.to_rgba8();
    if instruction.is_empty() {
        return canvas;
    }
    let (x, y) = EDIT_ORIGIN;
    for (dx, dy) in [(-1, -1), (-1, 1), (1, -1), (1, 1)] {
        draw_text_mut(
            &mut canvas,
            OUTLINE_COLOR,
            x + dx,
            y + dy,
            EDIT_SCALE,
            fonts.font(),
            instruction,
        );
    }
    draw_text_mut(
        &mut canvas,
        FILL_COLOR,
        x,
        y,
        EDIT_SCALE,
        fonts.font(),
        instruction,
    );
    canvas
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgba, RgbaImage};

    use super::{synthesize_placeholder, BACKGROUND, CANVAS_HEIGHT, CANVAS_WIDTH};
    use crate::fonts::FontBook;

    #[test]
    fn empty_prompt_still_yields_a_card() {
        let fonts = FontBook::embedded();
        let out = synthesize_placeholder("", None, None, &fonts);
        assert_eq!(out.dimensions(), (CANVAS_WIDTH, CANVAS_HEIGHT));
        assert_eq!(*out.get_pixel(0, 0), BACKGROUND);
    }

    #[test]
    fn generation_card_draws_prompt_and_red_note() {
        let fonts = FontBook::embedded();
        let out = synthesize_placeholder("a red fox", None, Some("quota exceeded"), &fonts);
        let center_band = (280..320).flat_map(|y| (0..CANVAS_WIDTH).map(move |x| (x, y)));
        let dark = center_band
            .filter(|(x, y)| {
                let Rgba([r, g, b, _]) = *out.get_pixel(*x, *y);
                r < 100 && g < 100 && b < 100
            })
            .count();
        assert!(dark > 0, "prompt text not drawn near center");

        let note_band = (315..345).flat_map(|y| (0..CANVAS_WIDTH).map(move |x| (x, y)));
        let reddish = note_band
            .filter(|(x, y)| {
                let Rgba([r, g, b, _]) = *out.get_pixel(*x, *y);
                r > 200 && g < 150 && b < 150
            })
            .count();
        assert!(reddish > 0, "error note not drawn below center");
    }

    #[test]
    fn edit_mode_keeps_base_dimensions_and_outlines_text() {
        let fonts = FontBook::embedded();
        let base = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            320,
            240,
            Rgba([255, 255, 255, 255]),
        ));
        let out = synthesize_placeholder("make it snowy", Some(&base), None, &fonts);
        assert_eq!(out.dimensions(), (320, 240));
        let outlined = (8..34)
            .flat_map(|y| (8..200).map(move |x| (x, y)))
            .any(|(x, y)| out.get_pixel(x, y).0[0] < 80);
        assert!(outlined);
        assert_eq!(*out.get_pixel(300, 200), Rgba([255, 255, 255, 255]));
    }
}
