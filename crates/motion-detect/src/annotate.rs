//! Draw detections onto an image.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use motion_models::Detection;

use crate::engine::decode_image;
use crate::error::{DetectError, DetectResult};

/// JPEG quality used for annotated uploads.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Outline thickness in pixels.
const STROKE: u32 = 2;

/// Label glyphs are 3x5 cells drawn at this scale.
const GLYPH_SCALE: u32 = 2;
const GLYPH_ADVANCE: u32 = 4 * GLYPH_SCALE;
const LABEL_PADDING: u32 = 2;
const LABEL_HEIGHT: u32 = 5 * GLYPH_SCALE + 2 * LABEL_PADDING;

const PALETTE: [[u8; 3]; 8] = [
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
];

fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// Render `detections` as labelled box outlines and return the result as JPEG bytes.
pub fn annotate(image_bytes: &[u8], detections: &[Detection], quality: u8) -> DetectResult<Vec<u8>> {
    let mut canvas = decode_image(image_bytes)?.to_rgb8();

    for detection in detections {
        let color = class_color(detection.class_id);
        draw_box(&mut canvas, detection, color);
        draw_label(&mut canvas, detection, color);
    }

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(&canvas)
        .map_err(|e| DetectError::Encode(e.to_string()))?;

    Ok(out.into_inner())
}

fn draw_box(canvas: &mut RgbImage, detection: &Detection, color: Rgb<u8>) {
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    let bbox = detection.bbox.clamp_to(width, height);
    let x1 = (bbox.x as u32).min(width - 1);
    let y1 = (bbox.y as u32).min(height - 1);
    let x2 = ((bbox.x + bbox.width) as u32).min(width - 1);
    let y2 = ((bbox.y + bbox.height) as u32).min(height - 1);
    if x2 < x1 || y2 < y1 {
        return;
    }

    for t in 0..STROKE {
        let top = (y1 + t).min(y2);
        let bottom = y2.saturating_sub(t).max(y1);
        for x in x1..=x2 {
            canvas.put_pixel(x, top, color);
            canvas.put_pixel(x, bottom, color);
        }

        let left = (x1 + t).min(x2);
        let right = x2.saturating_sub(t).max(x1);
        for y in y1..=y2 {
            canvas.put_pixel(left, y, color);
            canvas.put_pixel(right, y, color);
        }
    }
}

/// Filled strip with `label confidence` above the box, or inside it when the
/// box touches the top edge.
fn draw_label(canvas: &mut RgbImage, detection: &Detection, color: Rgb<u8>) {
    let (width, height) = canvas.dimensions();
    if width == 0 || height < LABEL_HEIGHT {
        return;
    }

    let text = format!("{} {:.2}", detection.label.to_lowercase(), detection.confidence);
    let bbox = detection.bbox.clamp_to(width, height);
    let x1 = (bbox.x as u32).min(width - 1);
    let y1 = (bbox.y as u32).min(height - 1);

    let top = if y1 >= LABEL_HEIGHT {
        y1 - LABEL_HEIGHT
    } else {
        y1.min(height - LABEL_HEIGHT)
    };
    let strip_width = text.chars().count() as u32 * GLYPH_ADVANCE + 2 * LABEL_PADDING;
    let right = (x1 + strip_width).min(width);

    for y in top..top + LABEL_HEIGHT {
        for x in x1..right {
            canvas.put_pixel(x, y, color);
        }
    }

    let ink = text_color(color);
    let mut pen_x = x1 + LABEL_PADDING;
    let pen_y = top + LABEL_PADDING;
    for c in text.chars() {
        if pen_x >= right {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..3u32 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                for dy in 0..GLYPH_SCALE {
                    for dx in 0..GLYPH_SCALE {
                        let x = pen_x + col * GLYPH_SCALE + dx;
                        let y = pen_y + row as u32 * GLYPH_SCALE + dy;
                        if x < right && y < height {
                            canvas.put_pixel(x, y, ink);
                        }
                    }
                }
            }
        }
        pen_x += GLYPH_ADVANCE;
    }
}

/// Black on light backgrounds, white on dark ones.
fn text_color(background: Rgb<u8>) -> Rgb<u8> {
    let [r, g, b] = background.0;
    let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    if luma > 140.0 {
        Rgb([0, 0, 0])
    } else {
        Rgb([255, 255, 255])
    }
}

/// 3x5 bitmap rows, most significant of the low three bits on the left.
fn glyph(c: char) -> [u8; 5] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        'a' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'b' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'c' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'd' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'e' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'f' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'g' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'h' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'i' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'j' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'k' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'l' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'm' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'n' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'o' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'p' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'q' => [0b010, 0b101, 0b101, 0b110, 0b011],
        'r' => [0b110, 0b101, 0b110, 0b101, 0b101],
        's' => [0b011, 0b100, 0b010, 0b001, 0b110],
        't' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'u' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'v' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'w' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'x' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        _ => [0; 5],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat};
    use motion_models::BoundingBox;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([0, 0, 0])));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_annotate_outputs_jpeg_with_same_dimensions() {
        let detections = vec![Detection::new(
            0,
            "person",
            0.9,
            BoundingBox::new(10.0, 10.0, 30.0, 20.0),
        )];

        let jpeg = annotate(&png(64, 48), &detections, DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_box_outline_is_drawn() {
        let mut canvas = RgbImage::from_pixel(50, 50, Rgb([0, 0, 0]));
        let detection = Detection::new(1, "bicycle", 0.5, BoundingBox::new(5.0, 5.0, 20.0, 20.0));
        draw_box(&mut canvas, &detection, class_color(1));

        assert_eq!(*canvas.get_pixel(5, 5), class_color(1));
        assert_eq!(*canvas.get_pixel(15, 5), class_color(1));
        // interior untouched
        assert_eq!(*canvas.get_pixel(15, 15), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_label_strip_is_drawn_above_box() {
        let mut canvas = RgbImage::from_pixel(120, 80, Rgb([0, 0, 0]));
        let detection = Detection::new(0, "person", 0.88, BoundingBox::new(10.0, 30.0, 40.0, 40.0));
        draw_label(&mut canvas, &detection, class_color(0));

        let top = 30 - LABEL_HEIGHT;
        // strip background
        assert_eq!(*canvas.get_pixel(10, top), class_color(0));
        // first stroke of 'p'
        assert_eq!(
            *canvas.get_pixel(10 + LABEL_PADDING, top + LABEL_PADDING),
            Rgb([255, 255, 255])
        );
        // nothing below the strip
        assert_eq!(*canvas.get_pixel(10, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_label_moves_inside_box_at_top_edge() {
        let mut canvas = RgbImage::from_pixel(120, 80, Rgb([0, 0, 0]));
        let detection = Detection::new(2, "car", 0.5, BoundingBox::new(0.0, 0.0, 60.0, 60.0));
        draw_label(&mut canvas, &detection, class_color(2));

        // yellow background takes dark text
        assert_eq!(text_color(class_color(2)), Rgb([0, 0, 0]));
        assert_eq!(*canvas.get_pixel(0, 0), class_color(2));
        assert_eq!(*canvas.get_pixel(0, LABEL_HEIGHT), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_label_is_clipped_to_frame() {
        let mut canvas = RgbImage::from_pixel(30, 20, Rgb([0, 0, 0]));
        let detection = Detection::new(
            9,
            "traffic light",
            0.75,
            BoundingBox::new(20.0, 16.0, 8.0, 4.0),
        );
        draw_label(&mut canvas, &detection, class_color(9));
        assert_eq!(*canvas.get_pixel(29, 2), class_color(9));
    }

    #[test]
    fn test_boxes_outside_frame_are_clipped() {
        let mut canvas = RgbImage::from_pixel(20, 20, Rgb([0, 0, 0]));
        let detection = Detection::new(0, "person", 0.5, BoundingBox::new(-10.0, -10.0, 100.0, 100.0));
        draw_box(&mut canvas, &detection, class_color(0));
        assert_eq!(*canvas.get_pixel(19, 19), class_color(0));
    }

    #[test]
    fn test_annotate_rejects_garbage() {
        let err = annotate(b"not an image", &[], DEFAULT_JPEG_QUALITY).unwrap_err();
        assert!(err.is_invalid_image());
    }
}
