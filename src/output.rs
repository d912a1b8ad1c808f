//! Output directory and PNG file naming.
//!
//! Files are named `<stem>-<iteration>-<index>.png` where the stem is the
//! prompt, single-lined and cut to [`STEM_MAX_CHARS`] characters.

use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::Result;

/// Maximum prompt characters kept in a file name.
pub const STEM_MAX_CHARS: usize = 100;

/// File-name stem derived from a prompt.
///
/// Path separators are replaced so the file always lands in the output
/// directory itself.
pub fn prompt_stem(prompt: &str) -> String {
    prompt
        .trim()
        .replace('\n', " ")
        .chars()
        .take(STEM_MAX_CHARS)
        .map(|c| match c {
            '/' | '\\' => '_',
            c => c,
        })
        .collect()
}

/// `<stem>-<iteration>-<index>.png`
pub fn image_file_name(stem: &str, iteration: usize, index: usize) -> String {
    format!("{stem}-{iteration}-{index}.png")
}

/// Create `dir` and its parents if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Save one pipeline call's images; returns the written paths.
pub fn save_images(
    dir: &Path,
    stem: &str,
    iteration: usize,
    images: &[RgbImage],
) -> Result<Vec<PathBuf>> {
    images
        .iter()
        .enumerate()
        .map(|(index, image)| {
            let path = dir.join(image_file_name(stem, iteration, index));
            image.save_with_format(&path, image::ImageFormat::Png)?;
            Ok(path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_stem_truncates_by_chars() {
        let prompt = "é".repeat(150);
        let stem = prompt_stem(&prompt);
        assert_eq!(stem.chars().count(), STEM_MAX_CHARS);
    }

    #[test]
    fn test_prompt_stem_single_line() {
        assert_eq!(prompt_stem("  a dog\nin a hat \n"), "a dog in a hat");
        assert_eq!(prompt_stem("cats/dogs"), "cats_dogs");
    }

    #[test]
    fn test_image_file_name() {
        assert_eq!(image_file_name("a dog", 3, 1), "a dog-3-1.png");
    }

    #[test]
    fn test_save_images_creates_pngs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("out");
        ensure_dir(&out).unwrap();
        ensure_dir(&out).unwrap(); // idempotent

        let images = vec![RgbImage::new(8, 8), RgbImage::new(8, 8)];
        let paths = save_images(&out, "stem", 0, &images).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("stem-0-0.png"));
        assert!(paths[1].ends_with("stem-0-1.png"));

        let loaded = image::open(&paths[1]).unwrap();
        assert_eq!(loaded.width(), 8);
    }
}
