use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use exif::{In, Tag, Value};
use tracing::debug;

/// EXIF fields surfaced on image documents.
#[derive(Debug, Clone, Default)]
pub struct ExifSummary {
    pub camera: Option<String>,
    pub lens: Option<String>,
    pub taken_at: Option<String>,
    pub location: Option<String>,
    pub camera_settings: Option<String>,
}

/// Extract the EXIF fields we care about. Absence of EXIF data (or any
/// parse problem) yields an empty summary; it never fails the pipeline.
pub fn read_exif(path: &Path) -> ExifSummary {
    let Ok(file) = File::open(path) else {
        return ExifSummary::default();
    };
    let mut reader = BufReader::new(file);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut reader) else {
        debug!(path = %path.display(), "no EXIF container");
        return ExifSummary::default();
    };

    let field_str = |tag: Tag| -> Option<String> {
        exif.get_field(tag, In::PRIMARY).map(|f| {
            f.display_value()
                .to_string()
                .trim_matches('"')
                .trim()
                .to_string()
        })
    };

    let camera = match (field_str(Tag::Make), field_str(Tag::Model)) {
        (Some(make), Some(model)) if model.starts_with(&make) => Some(model),
        (Some(make), Some(model)) => Some(format!("{make} {model}")),
        (None, Some(model)) => Some(model),
        (Some(make), None) => Some(make),
        (None, None) => None,
    };

    let lens = field_str(Tag::LensModel);
    let taken_at = field_str(Tag::DateTimeOriginal);
    let location = gps_coordinates(&exif);

    let mut settings = Vec::new();
    if let Some(iso) = field_str(Tag::PhotographicSensitivity) {
        settings.push(format!("ISO {iso}"));
    }
    if let Some(f) = field_str(Tag::FNumber) {
        settings.push(f);
    }
    if let Some(exposure) = field_str(Tag::ExposureTime) {
        settings.push(format!("{exposure}s"));
    }
    if let Some(focal) = field_str(Tag::FocalLength) {
        settings.push(focal);
    }
    let camera_settings = if settings.is_empty() {
        None
    } else {
        Some(settings.join(", "))
    };

    ExifSummary {
        camera,
        lens,
        taken_at,
        location,
        camera_settings,
    }
}

/// Format GPS latitude/longitude as signed decimal degrees.
fn gps_coordinates(exif: &exif::Exif) -> Option<String> {
    let lat = dms_to_decimal(exif, Tag::GPSLatitude)?;
    let lon = dms_to_decimal(exif, Tag::GPSLongitude)?;

    let lat_sign = match exif
        .get_field(Tag::GPSLatitudeRef, In::PRIMARY)
        .map(|f| f.display_value().to_string())
    {
        Some(r) if r.contains('S') => -1.0,
        _ => 1.0,
    };
    let lon_sign = match exif
        .get_field(Tag::GPSLongitudeRef, In::PRIMARY)
        .map(|f| f.display_value().to_string())
    {
        Some(r) if r.contains('W') => -1.0,
        _ => 1.0,
    };

    Some(format!("{:.6}, {:.6}", lat * lat_sign, lon * lon_sign))
}

fn dms_to_decimal(exif: &exif::Exif, tag: Tag) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    if let Value::Rational(parts) = &field.value {
        if parts.len() == 3 {
            let degrees = parts[0].to_f64();
            let minutes = parts[1].to_f64();
            let seconds = parts[2].to_f64();
            return Some(degrees + minutes / 60.0 + seconds / 3600.0);
        }
    }
    None
}

/// Deterministic human-readable description assembled from the filename and
/// whatever EXIF data is present. Used as the embedding text scaffold for
/// images when no AI caption is available.
pub fn build_description(file_name: &str, exif: &ExifSummary) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);

    let mut description = format!("Photograph \"{stem}\"");
    if let Some(camera) = &exif.camera {
        description.push_str(&format!(", taken with {camera}"));
        if let Some(lens) = &exif.lens {
            description.push_str(&format!(" ({lens})"));
        }
    }
    if let Some(taken_at) = &exif.taken_at {
        description.push_str(&format!(" on {taken_at}"));
    }
    if let Some(location) = &exif.location {
        description.push_str(&format!(" at {location}"));
    }
    if let Some(settings) = &exif.camera_settings {
        description.push_str(&format!(". Settings: {settings}"));
    }
    description.push('.');
    description
}
