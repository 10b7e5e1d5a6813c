use std::fs;
use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use imageproc::drawing::text_size;
use tracing::{debug, warn};

const EMBEDDED_FONT: &[u8] = include_bytes!("../../../assets/DejaVuSans.ttf");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FontSource {
    Preferred(PathBuf),
    Embedded,
}

/// Label font resolved once at startup.
///
/// A missing or unreadable preferred font is not an error: the embedded
/// DejaVu Sans is used instead and `preferred_available()` reports false.
#[derive(Clone)]
pub struct FontBook {
    font: FontArc,
    source: FontSource,
    preferred_available: bool,
}

impl FontBook {
    pub fn load(preferred: Option<&Path>) -> Self {
        let Some(path) = preferred else {
            return Self::embedded();
        };
        let loaded = fs::read(path)
            .map_err(|err| err.to_string())
            .and_then(|bytes| FontArc::try_from_vec(bytes).map_err(|err| err.to_string()));
        match loaded {
            Ok(font) => {
                debug!(path = %path.display(), "loaded preferred font");
                Self {
                    font,
                    source: FontSource::Preferred(path.to_path_buf()),
                    preferred_available: true,
                }
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "preferred font unavailable; using embedded font");
                Self::embedded()
            }
        }
    }

    pub fn embedded() -> Self {
        Self {
            font: FontArc::try_from_slice(EMBEDDED_FONT)
                .expect("embedded DejaVu Sans must parse"),
            source: FontSource::Embedded,
            preferred_available: false,
        }
    }

    pub fn font(&self) -> &FontArc {
        &self.font
    }

    pub fn source(&self) -> &FontSource {
        &self.source
    }

    pub fn preferred_available(&self) -> bool {
        self.preferred_available
    }

    pub fn measure(&self, scale: f32, text: &str) -> (u32, u32) {
        if text.is_empty() {
            return (0, 0);
        }
        text_size(PxScale::from(scale), &self.font, text)
    }
}

impl std::fmt::Debug for FontBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontBook")
            .field("source", &self.source)
            .field("preferred_available", &self.preferred_available)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{FontBook, FontSource};

    #[test]
    fn missing_preferred_font_falls_back_to_embedded() {
        let fonts = FontBook::load(Some(Path::new("/definitely/not/here/arial.ttf")));
        assert_eq!(fonts.source(), &FontSource::Embedded);
        assert!(!fonts.preferred_available());
    }

    #[test]
    fn garbage_font_file_falls_back_to_embedded() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("broken.ttf");
        std::fs::write(&path, b"not a font")?;
        let fonts = FontBook::load(Some(&path));
        assert_eq!(fonts.source(), &FontSource::Embedded);
        Ok(())
    }

    #[test]
    fn measuring_grows_with_text() {
        let fonts = FontBook::embedded();
        let (short, height) = fonts.measure(20.0, "cat");
        let (long, _) = fonts.measure(20.0, "cat on a mat");
        assert!(height > 0);
        assert!(long > short);
        assert_eq!(fonts.measure(20.0, ""), (0, 0));
    }
}
