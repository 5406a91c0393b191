use serde::{Deserialize, Serialize};

use crate::config::Orient;
use crate::messages::Message;

/// Upper bound on `width * height` when deriving a size from an input image.
const MAX_OUTPUT_AREA: u64 = 1_048_576;
/// Hard limit on a single side, applied even when `maxResolution` is 0.
pub const MAX_DIMENSION: u32 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
    /// Set when the user typed an explicit `WxH` instead of an orientation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub custom: bool,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            custom: false,
        }
    }
}

/// Rounds to the nearest multiple of `mult`, never returning zero.
pub fn closest_multiple(num: u32, mult: u32) -> u32 {
    let floor = (num / mult) * mult;
    let ceil = if num % mult == 0 {
        floor
    } else {
        floor.checked_add(mult).unwrap_or(floor)
    };
    let closest = if ceil == floor || num - floor < ceil - num {
        floor
    } else {
        ceil
    };
    if closest == 0 {
        mult
    } else {
        closest
    }
}

/// Parses `portrait` / `landscape` / `square` or `WxH` (also `W×H`).
pub fn parse_resolution(source: &str, max_resolution: u32) -> Result<Size, Message> {
    let source = source.trim();
    if let Some(orient) = Orient::parse(source) {
        return Ok(orient.size());
    }
    let (raw_width, raw_height) = source
        .split_once('x')
        .or_else(|| source.split_once('×'))
        .ok_or(Message::InvalidResolution)?;
    let parse_dim = |raw: &str| -> Result<u32, Message> {
        if raw.is_empty() || !raw.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(Message::InvalidResolution);
        }
        match raw.parse::<u32>() {
            Ok(value) if value <= MAX_DIMENSION => Ok(value),
            _ => Err(Message::InvalidResolution),
        }
    };
    let width = closest_multiple(parse_dim(raw_width)?, 64);
    let height = closest_multiple(parse_dim(raw_height)?, 64);
    if max_resolution > 0 && width.max(height) > max_resolution {
        return Err(Message::InvalidResolution);
    }
    Ok(Size {
        width,
        height,
        custom: true,
    })
}

/// Picks a generation size for an img2img source image: keep it when it is
/// already valid, otherwise pin the short side to 512 (or the long side to
/// 1024) and follow the aspect ratio.
pub fn resize_input(size: Size) -> Size {
    let Size { width, height, .. } = size;
    let area = |w: u32, h: u32| w as u64 * h as u64;
    if width % 64 == 0 && height % 64 == 0 && area(width, height) <= MAX_OUTPUT_AREA {
        return Size::new(width, height);
    }
    let aspect_ratio = width as f64 / height.max(1) as f64;
    let scaled = |value: f64| {
        let value = value.round().clamp(0.0, f64::from(MAX_DIMENSION));
        closest_multiple(value as u32, 64)
    };
    if aspect_ratio > 1.0 {
        let height = 512;
        let width = scaled(height as f64 * aspect_ratio);
        if area(width, height) <= MAX_OUTPUT_AREA {
            return Size::new(width, height);
        }
        let width = 1024;
        return Size::new(width, scaled(width as f64 / aspect_ratio));
    }
    let width = 512;
    let height = scaled(width as f64 / aspect_ratio);
    if area(width, height) <= MAX_OUTPUT_AREA {
        return Size::new(width, height);
    }
    let height = 1024;
    Size::new(scaled(height as f64 * aspect_ratio), height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_multiple_rounds_and_never_returns_zero() {
        assert_eq!(closest_multiple(500, 64), 512);
        assert_eq!(closest_multiple(540, 64), 512);
        assert_eq!(closest_multiple(545, 64), 576);
        assert_eq!(closest_multiple(640, 64), 640);
        assert_eq!(closest_multiple(10, 64), 64);
        assert_eq!(closest_multiple(0, 64), 64);
    }

    #[test]
    fn parses_orients_and_custom_sizes() {
        assert_eq!(parse_resolution("landscape", 1024), Ok(Size::new(768, 512)));
        let custom = parse_resolution("500x700", 1024).unwrap_or(Size::new(0, 0));
        assert_eq!((custom.width, custom.height), (512, 704));
        assert!(custom.custom);
        let unicode = parse_resolution("640×640", 1024).unwrap_or(Size::new(0, 0));
        assert_eq!((unicode.width, unicode.height), (640, 640));
    }

    #[test]
    fn rejects_bad_or_oversized_resolutions() {
        assert_eq!(parse_resolution("huge", 1024), Err(Message::InvalidResolution));
        assert_eq!(parse_resolution("12x", 1024), Err(Message::InvalidResolution));
        assert_eq!(parse_resolution("2048x512", 1024), Err(Message::InvalidResolution));
        assert!(parse_resolution("2048x512", 0).is_ok());
    }

    #[test]
    fn huge_dimensions_are_rejected_without_overflow() {
        assert_eq!(closest_multiple(u32::MAX, 64), u32::MAX - 63);
        assert_eq!(parse_resolution("4294967295x512", 0), Err(Message::InvalidResolution));
        assert_eq!(parse_resolution("512x70000", 0), Err(Message::InvalidResolution));
        assert_eq!(parse_resolution("99999999999x512", 0), Err(Message::InvalidResolution));
    }

    #[test]
    fn resize_input_survives_extreme_aspect_ratios() {
        assert_eq!(resize_input(Size::new(1 << 31, 1)), Size::new(1024, 64));
        assert_eq!(resize_input(Size::new(1, u32::MAX)), Size::new(64, 1024));
    }

    #[test]
    fn resize_input_keeps_valid_sizes_and_fixes_odd_ones() {
        assert_eq!(resize_input(Size::new(512, 768)), Size::new(512, 768));
        assert_eq!(resize_input(Size::new(1000, 500)), Size::new(1024, 512));
        assert_eq!(resize_input(Size::new(300, 450)), Size::new(512, 768));
        assert_eq!(resize_input(Size::new(3000, 500)), Size::new(1024, 192));
    }
}
