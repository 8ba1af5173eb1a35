use super::label::LabelFont;
use crate::media::{VideoFrame, VideoSource};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use std::sync::Arc;

const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);
const LABEL_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const LABEL_MARGIN: u32 = 20;
/// Label height as a fraction of the frame height.
const LABEL_HEIGHT_RATIO: f32 = 1.0 / 30.0;

/// Side-by-side layout: left source fills the left half, right source the right half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub width: u32,
    pub height: u32,
    pub left_label: String,
    pub right_label: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            left_label: "You".to_string(),
            right_label: "Partner (Avatar)".to_string(),
        }
    }
}

impl Layout {
    pub fn half_width(&self) -> u32 {
        self.width / 2
    }
}

/// Paints both sources onto one frame. Labels need a font; without one the
/// panels go unlabeled.
pub struct Compositor {
    layout: Layout,
    font: Option<Arc<LabelFont>>,
}

impl Compositor {
    pub fn new(layout: Layout, font: Option<Arc<LabelFont>>) -> Self {
        Self { layout, font }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn paint(&self, left: &dyn VideoSource, right: &dyn VideoSource) -> RgbaImage {
        let Layout { width, height, .. } = self.layout;
        let half = self.layout.half_width();
        let mut canvas = RgbaImage::from_pixel(width, height, BACKGROUND);

        // A source without a decodable frame leaves its half black.
        if let Some(frame) = left.current_frame() {
            self.blit(&mut canvas, &frame, 0);
        }
        if let Some(frame) = right.current_frame() {
            self.blit(&mut canvas, &frame, half);
        }

        if let Some(font) = &self.font {
            let size = (height as f32 * LABEL_HEIGHT_RATIO).max(12.0);
            for (x, label) in [
                (LABEL_MARGIN, &self.layout.left_label),
                (half + LABEL_MARGIN, &self.layout.right_label),
            ] {
                font.draw(&mut canvas, x, LABEL_MARGIN, size, label, LABEL_COLOR);
            }
        }
        canvas
    }

    fn blit(&self, canvas: &mut RgbaImage, frame: &VideoFrame, x: u32) {
        let (w, h) = (self.layout.half_width(), self.layout.height);
        if frame.width() == 0 || frame.height() == 0 || w == 0 || h == 0 {
            return;
        }
        if frame.dimensions() == (w, h) {
            imageops::replace(canvas, &**frame, x as i64, 0);
        } else {
            let scaled = imageops::resize(&**frame, w, h, FilterType::Nearest);
            imageops::replace(canvas, &scaled, x as i64, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FrameSlot;

    fn layout() -> Layout {
        Layout {
            width: 200,
            height: 100,
            left_label: String::new(),
            right_label: String::new(),
        }
    }

    #[test]
    fn paints_each_source_into_its_half() {
        let left = FrameSlot::new();
        let right = FrameSlot::new();
        left.publish(Arc::new(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255]))));
        right.publish(Arc::new(RgbaImage::from_pixel(100, 100, Rgba([0, 0, 255, 255]))));

        let frame = Compositor::new(layout(), None).paint(left.as_ref(), right.as_ref());
        assert_eq!(frame.dimensions(), (200, 100));
        assert_eq!(frame.get_pixel(50, 50), &Rgba([255, 0, 0, 255]));
        assert_eq!(frame.get_pixel(150, 50), &Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn missing_frame_leaves_half_black() {
        let left = FrameSlot::new();
        let right = FrameSlot::new();
        right.publish(Arc::new(RgbaImage::from_pixel(4, 4, Rgba([0, 255, 0, 255]))));

        let frame = Compositor::new(layout(), None).paint(left.as_ref(), right.as_ref());
        assert_eq!(frame.get_pixel(10, 90), &BACKGROUND);
        assert_eq!(frame.get_pixel(190, 90), &Rgba([0, 255, 0, 255]));
    }

    fn labeled() -> Layout {
        Layout {
            width: 400,
            height: 200,
            left_label: "You".into(),
            right_label: "Partner".into(),
        }
    }

    fn lit_pixels(frame: &RgbaImage, xs: std::ops::Range<u32>) -> usize {
        frame
            .enumerate_pixels()
            .filter(|(x, _, p)| xs.contains(x) && p.0[0] > 200)
            .count()
    }

    #[test]
    fn each_half_gets_its_label() {
        let Some(font) = LabelFont::discover(None) else {
            return;
        };
        let empty = FrameSlot::new();
        let frame = Compositor::new(labeled(), Some(Arc::new(font)))
            .paint(empty.as_ref(), empty.as_ref());
        assert!(lit_pixels(&frame, 0..200) > 0);
        assert!(lit_pixels(&frame, 200..400) > 0);
    }

    #[test]
    fn no_font_means_no_labels() {
        let empty = FrameSlot::new();
        let frame = Compositor::new(labeled(), None).paint(empty.as_ref(), empty.as_ref());
        assert_eq!(lit_pixels(&frame, 0..400), 0);
    }
}
