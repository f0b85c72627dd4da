use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime};
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message body")]
    Empty,
    #[error("bytes are not a decodable image ({0} bytes)")]
    Malformed(usize),
    #[error("legacy message payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
}

/// Upstream metadata carried alongside the frame bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    pub filename: Option<String>,
    pub timestamp: Option<String>,
}

/// One unit handed out by a [`super::FrameSource`]. `tag` is what gets
/// acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub metadata: FrameMetadata,
}

pub struct DecodedFrame {
    pub image: Mat,
    /// Filename embedded in a legacy JSON payload, if any.
    pub embedded_filename: Option<String>,
}

#[derive(Deserialize)]
struct LegacyMessage {
    image: String,
    #[serde(default)]
    filename: Option<String>,
}

/// Decodes a message body into a BGR frame. Bodies that look like the old
/// `{"image": <base64>, "filename": ...}` envelope are unwrapped first.
pub fn decode_body(body: &[u8]) -> Result<DecodedFrame, DecodeError> {
    if body.is_empty() {
        return Err(DecodeError::Empty);
    }

    if body.first() == Some(&b'{') {
        if let Ok(legacy) = serde_json::from_slice::<LegacyMessage>(body) {
            let bytes = STANDARD.decode(legacy.image.trim())?;
            return Ok(DecodedFrame {
                image: decode_image(&bytes)?,
                embedded_filename: legacy.filename,
            });
        }
    }

    Ok(DecodedFrame {
        image: decode_image(body)?,
        embedded_filename: None,
    })
}

fn decode_image(bytes: &[u8]) -> Result<Mat, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let buf = Vector::<u8>::from_slice(bytes);
    let image = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)?;
    if image.empty() {
        return Err(DecodeError::Malformed(bytes.len()));
    }
    Ok(image)
}

/// Replaces anything outside `[A-Za-z0-9_.-]` with `_` and makes sure the
/// name carries an image extension.
pub fn sanitize_filename(name: &str) -> String {
    let mut safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let lower = safe.to_ascii_lowercase();
    if !(lower.ends_with(".jpg") || lower.ends_with(".jpeg") || lower.ends_with(".png")) {
        safe.push_str(".jpg");
    }
    safe
}

pub fn synthesize_filename(counter: u64, timestamp: &NaiveDateTime) -> String {
    let stamp = timestamp.format("%Y-%m-%dT%H:%M:%S").to_string().replace(':', "_");
    format!("image_{counter:06}_{stamp}.jpg")
}

/// Accepts RFC 3339 or a naive ISO-8601 date-time. Offsets are dropped and
/// the wall-clock time is kept.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};
    use opencv::core::{Scalar, CV_8UC3};

    fn png_bytes() -> Vec<u8> {
        let image = Mat::new_rows_cols_with_default(6, 9, CV_8UC3, Scalar::all(128.0)).unwrap();
        let mut buf = Vector::<u8>::new();
        imgcodecs::imencode(".png", &image, &mut buf, &Vector::new()).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_decodes_raw_image_bytes() {
        let decoded = decode_body(&png_bytes()).unwrap();
        assert_eq!(decoded.image.rows(), 6);
        assert_eq!(decoded.image.cols(), 9);
        assert_eq!(decoded.image.channels(), 3);
        assert!(decoded.embedded_filename.is_none());
    }

    #[test]
    fn test_decodes_legacy_json_envelope() {
        let body = serde_json::json!({
            "image": STANDARD.encode(png_bytes()),
            "filename": "7_entrance.png",
        })
        .to_string();

        let decoded = decode_body(body.as_bytes()).unwrap();
        assert_eq!(decoded.image.cols(), 9);
        assert_eq!(decoded.embedded_filename.as_deref(), Some("7_entrance.png"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(decode_body(b""), Err(DecodeError::Empty)));
        assert!(matches!(
            decode_body(b"definitely not an image"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_body(br#"{"image": "@@@not base64@@@"}"#),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("hive 1/cam:2.png"), "hive_1_cam_2.png");
        assert_eq!(sanitize_filename("frame.JPEG"), "frame.JPEG");
        assert_eq!(sanitize_filename("frame.bmp"), "frame.bmp.jpg");
        assert_eq!(sanitize_filename("raw"), "raw.jpg");
    }

    #[test]
    fn test_synthesize_filename() {
        let ts = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(14, 5, 9)
            .unwrap();
        assert_eq!(
            synthesize_filename(42, &ts),
            "image_000042_2024-06-01T14_05_09.jpg"
        );
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp("2024-06-01T14:05:09.123456+02:00").unwrap();
        assert_eq!(rfc.hour(), 14);
        assert_eq!(rfc.nanosecond(), 123_456_000);

        let naive = parse_timestamp("2024-06-01T14:05:09").unwrap();
        assert_eq!(naive.second(), 9);

        assert!(parse_timestamp("2024-06-01 14:05:09.5").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
