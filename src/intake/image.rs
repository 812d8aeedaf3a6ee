use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// RAW formats handed to the external decoder.
pub const RAW_EXTENSIONS: &[&str] = &[
    "nef", "cr2", "crw", "arw", "dng", "orf", "rw2", "pef", "srw", "raf",
];

/// Chunk size for streaming base64 encoding. A multiple of 3 so per-chunk
/// encodings concatenate without padding, just under 1 MiB.
const BASE64_CHUNK_BYTES: usize = 1_048_575;

/// A PNG produced by the decode pipeline, deleted on drop when temporary.
#[derive(Debug)]
pub struct DecodedPng {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    temporary: bool,
}

impl Drop for DecodedPng {
    fn drop(&mut self) {
        if self.temporary {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Removes the wrapped path on drop. Used for intermediate TIFFs so they
/// are released on every exit path.
struct TempPath(PathBuf);

impl Drop for TempPath {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn temp_png_path() -> PathBuf {
    std::env::temp_dir().join(format!("mmdex-{}.png", uuid::Uuid::new_v4()))
}

/// Validate and decode an image file with the in-process decoder.
fn open_validated(path: &Path) -> Result<DynamicImage> {
    let image = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| Error::InvalidImage {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::InvalidImage {
            path: path.to_path_buf(),
            reason: "zero dimensions".to_string(),
        });
    }
    Ok(image)
}

fn save_png(image: &DynamicImage, path: &Path) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| Error::Serialization(format!("png encode: {e}")))
}

/// Decode any supported image into a PNG on disk.
///
/// Pipeline order: PNG passthrough → in-process TGA decode → external RAW
/// decoder (TIFF, camera white balance) with generic-decoder fallback →
/// generic decode. Intermediate TIFFs are removed on every path.
pub async fn decode_to_png(config: &Config, path: &Path, extension: &str) -> Result<DecodedPng> {
    let ext = extension.to_lowercase();

    if ext == "png" {
        let (width, height) = image::image_dimensions(path).map_err(|e| Error::InvalidImage {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if width == 0 || height == 0 {
            return Err(Error::InvalidImage {
                path: path.to_path_buf(),
                reason: "zero dimensions".to_string(),
            });
        }
        return Ok(DecodedPng {
            path: path.to_path_buf(),
            width,
            height,
            temporary: false,
        });
    }

    if ext == "tga" {
        let image = open_validated(path)?;
        let out = temp_png_path();
        save_png(&image, &out)?;
        let (width, height) = (image.width(), image.height());
        drop(image);
        debug!(path = %path.display(), "TGA decoded in-process");
        return Ok(DecodedPng {
            path: out,
            width,
            height,
            temporary: true,
        });
    }

    if RAW_EXTENSIONS.contains(&ext.as_str()) {
        match decode_raw(config, path).await {
            Ok(decoded) => return Ok(decoded),
            Err(e) => {
                // The generic decoder may only recover the embedded
                // thumbnail here; surface that in the log.
                warn!(path = %path.display(), error = %e,
                    "RAW decoder failed, falling back to generic decode (may be thumbnail only)");
            }
        }
    }

    let image = open_validated(path)?;
    let out = temp_png_path();
    save_png(&image, &out)?;
    let (width, height) = (image.width(), image.height());
    drop(image);
    Ok(DecodedPng {
        path: out,
        width,
        height,
        temporary: true,
    })
}

/// Run the external RAW decoder: TIFF output, camera white balance, high
/// quality interpolation. The TIFF is transcoded to PNG and deleted.
async fn decode_raw(config: &Config, path: &Path) -> Result<DecodedPng> {
    let output = Command::new(&config.raw_decoder)
        .arg("-T")
        .arg("-w")
        .arg("-q")
        .arg("3")
        .arg(path)
        .output()
        .await
        .map_err(|e| Error::DecoderFailure {
            path: path.to_path_buf(),
            message: format!("{}: {e}", config.raw_decoder),
        })?;

    if !output.status.success() {
        return Err(Error::DecoderFailure {
            path: path.to_path_buf(),
            message: format!(
                "{} exited with {}: {}",
                config.raw_decoder,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    // The decoder writes `<input>.tiff` next to the input.
    let mut tiff_os = path.as_os_str().to_owned();
    tiff_os.push(".tiff");
    let tiff = TempPath(PathBuf::from(tiff_os));
    if !tiff.0.is_file() {
        return Err(Error::DecoderFailure {
            path: path.to_path_buf(),
            message: "decoder reported success but produced no TIFF".to_string(),
        });
    }

    let image = open_validated(&tiff.0)?;
    let out = temp_png_path();
    save_png(&image, &out)?;
    let (width, height) = (image.width(), image.height());
    drop(image);
    info!(path = %path.display(), width, height, "RAW decoded via external decoder");
    Ok(DecodedPng {
        path: out,
        width,
        height,
        temporary: true,
    })
}

/// Stream-read a file into base64, in ~1 MiB chunks so large images never
/// get slurped whole.
pub fn base64_file_chunked(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let size = file.metadata()?.len() as usize;
    let mut reader = std::io::BufReader::new(file);
    let mut encoded = String::with_capacity(size.div_ceil(3) * 4 + 4);
    let mut buf = vec![0u8; BASE64_CHUNK_BYTES];
    loop {
        let mut filled = 0;
        // Fill the chunk fully so every encoded piece except the last is
        // padding-free.
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        encoded.push_str(&BASE64.encode(&buf[..filled]));
        if filled < buf.len() {
            break;
        }
    }
    Ok(encoded)
}

/// Downscale a base64 PNG so its longest edge fits `max_edge`, preserving
/// aspect ratio. Never upscales. Returns base64 PNG.
pub fn resize_base64_png(base64_png: &str, max_edge: u32) -> Result<String> {
    let bytes = BASE64
        .decode(base64_png.trim())
        .map_err(|e| Error::Serialization(format!("base64 decode: {e}")))?;
    let image = image::load_from_memory(&bytes).map_err(|e| Error::InvalidImage {
        path: PathBuf::from("<base64>"),
        reason: e.to_string(),
    })?;
    drop(bytes);

    let longest = image.width().max(image.height());
    let resized = if longest > max_edge {
        image.resize(max_edge, max_edge, FilterType::Triangle)
    } else {
        image
    };

    let mut out = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| Error::Serialization(format!("png encode: {e}")))?;
    Ok(BASE64.encode(&out))
}

/// Compute a BlurHash placeholder: input downscaled to ≤32×32, 4×3
/// components. Returns `None` on any failure; the placeholder is cosmetic.
pub fn compute_blurhash(image: &DynamicImage) -> Option<String> {
    let thumb = image.resize(32, 32, FilterType::Triangle);
    let rgba = thumb.to_rgba8();
    let (width, height) = (rgba.width(), rgba.height());
    blurhash::encode(4, 3, width, height, rgba.as_raw()).ok()
}

/// Move a rejected or converted-away original into the trash directory.
pub fn move_to_trash(config: &Config, path: &Path) -> Result<PathBuf> {
    let trash_dir = config.trash_dir();
    std::fs::create_dir_all(&trash_dir)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;
    let target = trash_dir.join(format!("{}-{file_name}", uuid::Uuid::new_v4()));
    match std::fs::rename(path, &target) {
        Ok(()) => Ok(target),
        // Cross-device rename: fall back to copy + remove.
        Err(_) => {
            std::fs::copy(path, &target)?;
            std::fs::remove_file(path)?;
            Ok(target)
        }
    }
}
