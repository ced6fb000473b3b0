use image::{Rgb, RgbImage};

const DOT_RADIUS: i64 = 20;
const DOT_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const GLYPH_SCALE: u32 = 4;

// 3x5 glyphs, one row per entry, high bit on the left.
const DIGITS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b010, 0b010, 0b010],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
];
const COLON: [u8; 5] = [0b000, 0b010, 0b000, 0b010, 0b000];

/// Position of the animated dot at `t` seconds.
pub fn dot_center(width: u32, height: u32, t: f64) -> (f64, f64) {
    (
        (0.5 + 0.4 * t.sin()) * f64::from(width),
        (0.5 + 0.4 * t.cos()) * f64::from(height),
    )
}

/// Deterministic test pattern: a dot circling the frame plus a clock stamp.
pub fn render_mock_frame(width: u32, height: u32, t: f64, clock: &str) -> RgbImage {
    let mut image = RgbImage::new(width, height);
    let (cx, cy) = dot_center(width, height, t);
    let (cx, cy) = (cx as i64, cy as i64);
    for y in (cy - DOT_RADIUS).max(0)..(cy + DOT_RADIUS + 1).min(i64::from(height)) {
        for x in (cx - DOT_RADIUS).max(0)..(cx + DOT_RADIUS + 1).min(i64::from(width)) {
            if (x - cx).pow(2) + (y - cy).pow(2) <= DOT_RADIUS.pow(2) {
                image.put_pixel(x as u32, y as u32, DOT_COLOR);
            }
        }
    }
    draw_text(&mut image, 20, 20, clock);
    image
}

fn draw_text(image: &mut RgbImage, x: u32, y: u32, text: &str) {
    let mut cursor = x;
    for ch in text.chars() {
        let glyph = match ch {
            '0'..='9' => DIGITS[(ch as u8 - b'0') as usize],
            ':' => COLON,
            _ => {
                cursor += 4 * GLYPH_SCALE;
                continue;
            }
        };
        draw_glyph(image, cursor, y, &glyph);
        cursor += 4 * GLYPH_SCALE;
    }
}

fn draw_glyph(image: &mut RgbImage, x: u32, y: u32, glyph: &[u8; 5]) {
    for (row, bits) in glyph.iter().enumerate() {
        for col in 0..3u32 {
            if bits & (0b100 >> col) == 0 {
                continue;
            }
            for dy in 0..GLYPH_SCALE {
                for dx in 0..GLYPH_SCALE {
                    let px = x + col * GLYPH_SCALE + dx;
                    let py = y + row as u32 * GLYPH_SCALE + dy;
                    if px < image.width() && py < image.height() {
                        image.put_pixel(px, py, TEXT_COLOR);
                    }
                }
            }
        }
    }
}
