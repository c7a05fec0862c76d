//! Saving generated images

use chrono::{DateTime, TimeZone};
use image::RgbImage;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FILE_PREFIX: &str = "Z-Image";
pub const FILE_EXTENSION: &str = "png";

#[derive(Debug, Error)]
pub enum OutputError {
    /// Same second and same seed already written. Callers never expect this.
    #[error("output file already exists: {}", .0.display())]
    Collision(PathBuf),

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// `Z-Image_<YYYYmmdd-HHMMSS>_seed<seed>.png`
pub fn output_file_name<Tz>(timestamp: &DateTime<Tz>, seed: u32) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}_{}_seed{}.{}",
        FILE_PREFIX,
        timestamp.format("%Y%m%d-%H%M%S"),
        seed,
        FILE_EXTENSION
    )
}

#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
}

impl OutputWriter {
    /// The directory is made absolute up front so returned paths are too
    pub fn new(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            dir: std::path::absolute(dir.as_ref())?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `image` as PNG and return the absolute path.
    ///
    /// Never overwrites: an existing file with the same name is reported as
    /// [`OutputError::Collision`].
    pub fn save<Tz>(
        &self,
        image: &RgbImage,
        seed: u32,
        timestamp: &DateTime<Tz>,
    ) -> Result<PathBuf, OutputError>
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let path = self.dir.join(output_file_name(timestamp, seed));

        fs::create_dir_all(&self.dir).map_err(|source| OutputError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::error!("Refusing to overwrite {}", path.display());
                return Err(OutputError::Collision(path));
            }
            Err(source) => return Err(OutputError::Io { path, source }),
        };

        let mut writer = BufWriter::new(file);
        if let Err(source) = image.write_to(&mut writer, image::ImageFormat::Png) {
            drop(writer);
            let _ = fs::remove_file(&path);
            return Err(OutputError::Encode { path, source });
        }

        tracing::info!("Saved {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, Utc};

    fn sample_image() -> RgbImage {
        RgbImage::from_fn(8, 4, |x, y| image::Rgb([x as u8 * 30, y as u8 * 60, 128]))
    }

    #[test]
    fn test_file_name_format() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            output_file_name(&ts, 42),
            "Z-Image_20250309-070501_seed42.png"
        );
    }

    #[test]
    fn test_save_writes_png_with_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(dir.path().join("outputs")).unwrap();
        let ts = Local::now();

        let path = writer.save(&sample_image(), 7, &ts).unwrap();
        assert!(path.is_absolute());
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("_seed7.png"));

        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded, sample_image());
    }

    #[test]
    fn test_same_second_different_seed_both_saved() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(dir.path()).unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let a = writer.save(&sample_image(), 1, &ts).unwrap();
        let b = writer.save(&sample_image(), 2, &ts).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_collision_is_reported_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(dir.path()).unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let first = writer.save(&sample_image(), 5, &ts).unwrap();
        let before = fs::read(&first).unwrap();

        let other = RgbImage::new(2, 2);
        match writer.save(&other, 5, &ts) {
            Err(OutputError::Collision(path)) => assert_eq!(path, first),
            other => panic!("expected collision, got {:?}", other),
        }
        assert_eq!(fs::read(&first).unwrap(), before);
    }
}
