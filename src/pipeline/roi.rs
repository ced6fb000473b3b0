use crate::common::PixelRect;
use crate::pipeline::landmarks::{LandmarkSet, NormalizedBox};
use image::{RgbImage, imageops};

const ROI_PADDING: f64 = 0.2;

/// Pad a box by 20% of its size on every side, clamped to the frame.
pub fn expand(bbox: PixelRect, frame_width: u32, frame_height: u32) -> PixelRect {
    let pad_w = (f64::from(bbox.w) * ROI_PADDING) as u32;
    let pad_h = (f64::from(bbox.h) * ROI_PADDING) as u32;
    let x1 = bbox.x.saturating_sub(pad_w).min(frame_width);
    let y1 = bbox.y.saturating_sub(pad_h).min(frame_height);
    let x2 = bbox.x.saturating_add(bbox.w).saturating_add(pad_w).min(frame_width);
    let y2 = bbox.y.saturating_add(bbox.h).saturating_add(pad_h).min(frame_height);
    PixelRect::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
}

/// Processing window for this cycle: the padded last face box, or the full
/// frame when there is none.
pub fn select_window(last_face: Option<PixelRect>, frame_width: u32, frame_height: u32) -> PixelRect {
    let full = PixelRect::full(frame_width, frame_height);
    match last_face {
        Some(bbox) => {
            let window = expand(bbox, frame_width, frame_height);
            if window.is_empty() { full } else { window }
        }
        None => full,
    }
}

pub fn crop(image: &RgbImage, window: PixelRect) -> RgbImage {
    if window == PixelRect::full(image.width(), image.height()) {
        return image.clone();
    }
    imageops::crop_imm(image, window.x, window.y, window.w, window.h).to_image()
}

/// Shrink an image so its width does not exceed `target_width`.
pub fn downscale(image: RgbImage, target_width: u32) -> RgbImage {
    if target_width == 0 || image.width() <= target_width {
        return image;
    }
    let scale = f64::from(target_width) / f64::from(image.width());
    let height = ((f64::from(image.height()) * scale).round() as u32).max(1);
    imageops::resize(&image, target_width, height, imageops::FilterType::Triangle)
}

/// Landmarks normalized to the window, remapped to full-frame normalized coordinates.
pub fn remap_landmarks(
    landmarks: LandmarkSet,
    window: PixelRect,
    frame_width: u32,
    frame_height: u32,
) -> LandmarkSet {
    landmarks
        .into_iter()
        .map(|(name, point)| (name, window.to_frame(point, frame_width, frame_height)))
        .collect()
}

/// A box normalized to the window, as full-frame pixels.
pub fn remap_box(bbox: NormalizedBox, window: PixelRect, frame_width: u32, frame_height: u32) -> PixelRect {
    let fx = f64::from(window.x) / f64::from(frame_width.max(1));
    let fy = f64::from(window.y) / f64::from(frame_height.max(1));
    let sx = f64::from(window.w) / f64::from(frame_width.max(1));
    let sy = f64::from(window.h) / f64::from(frame_height.max(1));
    PixelRect::from_normalized(
        fx + bbox.x * sx,
        fy + bbox.y * sy,
        bbox.w * sx,
        bbox.h * sy,
        frame_width,
        frame_height,
    )
}
