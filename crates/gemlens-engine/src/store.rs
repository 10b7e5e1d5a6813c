use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{ImageFormat, RgbaImage};
use tracing::debug;
use uuid::Uuid;

/// URL prefix under which the static root is served.
pub const PUBLIC_PREFIX: &str = "static";

const UPLOADS: &str = "uploads";
const RESULTS: &str = "results";

#[derive(Debug, Clone)]
pub struct Upload {
    pub path: PathBuf,
    pub public_path: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Append-only file areas for uploads and rendered results. Every file gets
/// a fresh random name and is opened with `create_new`.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(static_root: impl Into<PathBuf>) -> Self {
        Self {
            root: static_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.uploads_dir(), self.results_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Persists an uploaded file. The client filename only contributes its
    /// extension.
    pub fn save_upload(
        &self,
        bytes: Vec<u8>,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Upload> {
        if bytes.is_empty() {
            bail!("uploaded file is empty");
        }
        let ext = filename
            .and_then(|name| Path::new(name).extension())
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase())
            .filter(|value| mime_for_extension(value).is_some())
            .or_else(|| content_type.and_then(extension_for_mime).map(str::to_string))
            .unwrap_or_else(|| "png".to_string());
        let mime_type = mime_for_extension(&ext).unwrap_or("image/png").to_string();

        let name = format!("upload_{}.{ext}", Uuid::new_v4().simple());
        let path = self.uploads_dir().join(&name);
        let mut file = create_new(&path)?;
        file.write_all(&bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), size = bytes.len(), "stored upload");
        Ok(Upload {
            path,
            public_path: public_path(UPLOADS, &name),
            bytes,
            mime_type,
        })
    }

    /// Writes a PNG into the results area and returns its public path.
    pub fn save_image(&self, prefix: &str, image: &RgbaImage) -> Result<String> {
        let name = format!("{prefix}_{}.png", Uuid::new_v4().simple());
        let path = self.results_dir().join(&name);
        let file = create_new(&path)?;
        let mut writer = BufWriter::new(file);
        image
            .write_to(&mut writer, ImageFormat::Png)
            .with_context(|| format!("failed to encode {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        debug!(path = %path.display(), "stored result image");
        Ok(public_path(RESULTS, &name))
    }

    pub fn copy_into_results(&self, prefix: &str, source: &Path) -> Result<String> {
        let ext = source
            .extension()
            .and_then(|value| value.to_str())
            .unwrap_or("png");
        let name = format!("{prefix}_{}.{ext}", Uuid::new_v4().simple());
        let bytes =
            fs::read(source).with_context(|| format!("failed reading {}", source.display()))?;
        let path = self.results_dir().join(&name);
        let mut file = create_new(&path)?;
        file.write_all(&bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(public_path(RESULTS, &name))
    }

    /// Maps a public path such as `static/results/x.png` back to a file,
    /// refusing anything outside the uploads and results areas.
    pub fn resolve_download(&self, public: &str) -> Option<PathBuf> {
        let relative = Path::new(public.trim_start_matches('/'));
        let relative = relative.strip_prefix(PUBLIC_PREFIX).unwrap_or(relative);
        let mut components = relative.components();
        let area = match components.next()? {
            Component::Normal(value) if value == UPLOADS || value == RESULTS => value,
            _ => return None,
        };
        let name = match components.next()? {
            Component::Normal(value) => value,
            _ => return None,
        };
        if components.next().is_some() {
            return None;
        }
        let path = self.root.join(area).join(name);
        path.is_file().then_some(path)
    }
}

fn create_new(path: &Path) -> Result<fs::File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))
}

fn public_path(area: &str, name: &str) -> String {
    format!("{PUBLIC_PREFIX}/{area}/{name}")
}

pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};

    use super::ResultStore;

    fn store() -> anyhow::Result<(tempfile::TempDir, ResultStore)> {
        let temp = tempfile::tempdir()?;
        let store = ResultStore::new(temp.path().join("static"));
        store.ensure_dirs()?;
        Ok((temp, store))
    }

    #[test]
    fn uploads_get_random_names_and_keep_the_extension() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        let first = store.save_upload(vec![1, 2, 3], Some("../../etc/passwd.JPG"), None)?;
        let second = store.save_upload(vec![4], Some("photo.png"), None)?;
        assert_ne!(first.path, second.path);
        assert!(first.path.starts_with(store.uploads_dir()));
        assert_eq!(first.mime_type, "image/jpeg");
        assert!(first.public_path.starts_with("static/uploads/upload_"));
        assert!(first.public_path.ends_with(".jpg"));
        assert_eq!(std::fs::read(&first.path)?, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn upload_extension_falls_back_to_content_type() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        let upload = store.save_upload(vec![1], Some("blob"), Some("image/webp"))?;
        assert_eq!(upload.mime_type, "image/webp");
        let upload = store.save_upload(vec![1], None, None)?;
        assert_eq!(upload.mime_type, "image/png");
        assert!(store.save_upload(Vec::new(), None, None).is_err());
        Ok(())
    }

    #[test]
    fn saved_images_resolve_for_download() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        let image = RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 255]));
        let public = store.save_image("bbox", &image)?;
        assert!(public.starts_with("static/results/bbox_"));
        let path = store
            .resolve_download(&public)
            .unwrap_or_else(|| panic!("missing {public}"));
        assert_eq!(image::open(&path)?.width(), 3);
        Ok(())
    }

    #[test]
    fn downloads_outside_the_areas_are_refused() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        std::fs::write(store.root().join("secret.txt"), b"x")?;
        assert!(store.resolve_download("static/secret.txt").is_none());
        assert!(store.resolve_download("static/results/../secret.txt").is_none());
        assert!(store.resolve_download("static/results/missing.png").is_none());
        assert!(store.resolve_download("/etc/passwd").is_none());
        Ok(())
    }

    #[test]
    fn copies_land_in_results() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        let upload = store.save_upload(vec![9, 9], Some("a.png"), None)?;
        let public = store.copy_into_results("edited", &upload.path)?;
        let path = store
            .resolve_download(&public)
            .unwrap_or_else(|| panic!("missing {public}"));
        assert_eq!(std::fs::read(path)?, vec![9, 9]);
        Ok(())
    }
}
