use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;
use vibepaper_contracts::WallpaperVariation;

/// Writes the decoded image into `dir` as `vibepaper-<id>.<ext>` and returns
/// the written path. An existing file with that name is replaced.
pub fn export_variation(variation: &WallpaperVariation, dir: &Path) -> anyhow::Result<PathBuf> {
    let bytes = variation
        .decode_image()
        .with_context(|| format!("wallpaper {} holds undecodable image data", variation.id))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(variation.download_file_name());
    std::fs::write(&path, &bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(id = %variation.id, path = %path.display(), bytes = bytes.len(), "wallpaper exported");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use vibepaper_contracts::{GenerationRequest, OutputSettings, WallpaperVariation};

    use super::export_variation;
    use crate::capability::{Capability, DryrunCapability};

    #[test]
    fn export_writes_decoded_png() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let request = GenerationRequest::new("teal gradient", OutputSettings::default());
        let variation = DryrunCapability::new().generate_one(&request)?;

        let path = export_variation(&variation, &temp.path().join("out"))?;
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some(format!("vibepaper-{}.png", variation.id).as_str())
        );
        let written = std::fs::read(&path)?;
        assert_eq!(written, variation.decode_image()?);
        assert_eq!(image::guess_format(&written)?, image::ImageFormat::Png);
        Ok(())
    }

    #[test]
    fn export_rejects_corrupt_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let request = GenerationRequest::new("broken", OutputSettings::default());
        let variation = WallpaperVariation::new(&request, "%%not-base64%%", Some("image/jpeg".to_string()));
        assert!(export_variation(&variation, temp.path()).is_err());
        assert_eq!(std::fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }
}
