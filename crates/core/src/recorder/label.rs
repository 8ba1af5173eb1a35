//! Panel labels, rendered with a TrueType font found on the host.

use crate::error::RecordingError;
use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_text_mut;
use std::path::{Path, PathBuf};

/// Checked in order when no font is configured.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

pub struct LabelFont {
    font: FontVec,
    path: PathBuf,
}

impl std::fmt::Debug for LabelFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelFont").field("path", &self.path).finish()
    }
}

impl LabelFont {
    pub fn load(path: &Path) -> Result<Self, RecordingError> {
        let bytes = std::fs::read(path)
            .map_err(|e| RecordingError::Font(format!("{}: {e}", path.display())))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|e| RecordingError::Font(format!("{}: {e}", path.display())))?;
        Ok(Self {
            font,
            path: path.to_path_buf(),
        })
    }

    /// Loads `preferred` if given, otherwise the first system font that loads.
    pub fn discover(preferred: Option<&Path>) -> Option<Self> {
        if let Some(path) = preferred {
            match Self::load(path) {
                Ok(font) => return Some(font),
                Err(e) => tracing::warn!("{}, trying system fonts", e),
            }
        }
        let font = SYSTEM_FONTS
            .iter()
            .map(Path::new)
            .filter(|path| path.is_file())
            .find_map(|path| Self::load(path).ok());
        match &font {
            Some(font) => tracing::debug!("recording labels use {}", font.path.display()),
            None => tracing::warn!("no usable font found, recordings will be unlabeled"),
        }
        font
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Draws `text` with its top-left corner at (`x`, `y`).
    pub fn draw(
        &self,
        canvas: &mut RgbaImage,
        x: u32,
        y: u32,
        height: f32,
        text: &str,
        color: Rgba<u8>,
    ) {
        draw_text_mut(
            canvas,
            color,
            x as i32,
            y as i32,
            PxScale::from(height),
            &self.font,
            text,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn garbage_is_not_a_font() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not truetype").unwrap();
        assert!(matches!(
            LabelFont::load(file.path()),
            Err(RecordingError::Font(_))
        ));
        assert!(matches!(
            LabelFont::load(Path::new("/nonexistent/font.ttf")),
            Err(RecordingError::Font(_))
        ));
    }

    #[test]
    fn a_bad_preferred_font_falls_back_to_the_system() {
        let fallback = LabelFont::discover(Some(Path::new("/nonexistent/font.ttf")));
        let system = LabelFont::discover(None);
        assert_eq!(
            fallback.as_ref().map(LabelFont::path),
            system.as_ref().map(LabelFont::path)
        );
    }

    #[test]
    fn text_lands_right_of_and_below_the_anchor() {
        // Hosts without any of the system fonts have nothing to draw with.
        let Some(font) = LabelFont::discover(None) else {
            return;
        };
        let mut canvas = RgbaImage::from_pixel(120, 60, Rgba([0, 0, 0, 255]));
        font.draw(&mut canvas, 20, 10, 30.0, "You", Rgba([255, 255, 255, 255]));

        let lit: Vec<(u32, u32)> = canvas
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] > 200)
            .map(|(x, y, _)| (x, y))
            .collect();
        assert!(!lit.is_empty());
        // Side bearings may reach a pixel or two past the anchor.
        assert!(lit.iter().all(|&(x, y)| x >= 17 && y >= 7));
        assert!(lit.iter().all(|&(_, y)| y < 10 + 30));
    }
}
