//! Source images for img2img and enhance.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use image::ImageReader;
use log::warn;
use novelai_contracts::media::{sniff_mime, ImageData};
use novelai_contracts::messages::Message;
use novelai_contracts::resolution::Size;

use crate::transport::{read_bytes, HttpTransport};

pub const MAX_CONTENT_SIZE: u64 = 10 * 1024 * 1024;
const ALLOWED_MIME_TYPES: [&str; 2] = ["image/png", "image/jpeg"];

/// Loads an image from a data URL or an HTTP(S) URL. Local paths are only
/// read when the host opted in with `allow_local`.
pub fn download(
    transport: &HttpTransport,
    src: &str,
    allow_local: bool,
) -> Result<ImageData, Message> {
    let src = src.trim();
    let image = if src.starts_with("data:") {
        ImageData::from_data_url(src).map_err(|err| {
            warn!("invalid data URL: {err:#}");
            Message::DownloadError
        })?
    } else if src.starts_with("http://") || src.starts_with("https://") {
        fetch_remote(transport, src)?
    } else if allow_local {
        read_local(Path::new(src.strip_prefix("file://").unwrap_or(src)))?
    } else {
        warn!("refusing non-URL image source {src}");
        return Err(Message::DownloadError);
    };
    check_mime(&image.mime)?;
    Ok(image)
}

fn fetch_remote(transport: &HttpTransport, url: &str) -> Result<ImageData, Message> {
    let response = transport.get_external(url).map_err(|err| {
        warn!("failed to download {url}: {err}");
        Message::DownloadError
    })?;
    if response.content_length().is_some_and(|len| len > MAX_CONTENT_SIZE) {
        return Err(Message::FileTooLarge);
    }
    let (bytes, mime) = read_bytes(response).map_err(|err| {
        warn!("failed to read {url}: {err}");
        Message::DownloadError
    })?;
    if bytes.len() as u64 > MAX_CONTENT_SIZE {
        return Err(Message::FileTooLarge);
    }
    let mime = mime
        .map(|value| normalize_mime(&value))
        .filter(|value| value.starts_with("image/"))
        .or_else(|| sniff_mime(&bytes).map(str::to_string))
        .unwrap_or_default();
    Ok(ImageData::new(bytes, mime))
}

fn read_local(path: &Path) -> Result<ImageData, Message> {
    let metadata = fs::metadata(path).map_err(|err| {
        warn!("cannot read {}: {err}", path.display());
        Message::DownloadError
    })?;
    if metadata.len() > MAX_CONTENT_SIZE {
        return Err(Message::FileTooLarge);
    }
    let bytes = fs::read(path).map_err(|err| {
        warn!("cannot read {}: {err}", path.display());
        Message::DownloadError
    })?;
    let mime = sniff_mime(&bytes).unwrap_or_default();
    Ok(ImageData::new(bytes, mime))
}

fn normalize_mime(raw: &str) -> String {
    let mime = raw.split(';').next().unwrap_or(raw).trim().to_ascii_lowercase();
    if mime == "image/jpg" {
        "image/jpeg".to_string()
    } else {
        mime
    }
}

fn check_mime(mime: &str) -> Result<(), Message> {
    if ALLOWED_MIME_TYPES.contains(&normalize_mime(mime).as_str()) {
        Ok(())
    } else {
        Err(Message::UnsupportedFileType)
    }
}

pub fn image_size(image: &ImageData) -> anyhow::Result<Size> {
    let (width, height) = ImageReader::new(Cursor::new(&image.bytes))
        .with_guessed_format()
        .context("failed to detect image format")?
        .into_dimensions()
        .context("failed to read image dimensions")?;
    Ok(Size::new(width, height))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use image::{ImageFormat, RgbImage};

    use super::*;
    use crate::test_server::{FakeServer, Reply};

    fn png(width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
        let mut bytes = Cursor::new(Vec::new());
        RgbImage::new(width, height).write_to(&mut bytes, ImageFormat::Png)?;
        Ok(bytes.into_inner())
    }

    fn transport() -> anyhow::Result<HttpTransport> {
        HttpTransport::new("http://127.0.0.1:9", &BTreeMap::new(), Duration::from_secs(5))
    }

    #[test]
    fn reads_data_urls_and_measures_them() -> anyhow::Result<()> {
        let image = ImageData::new(png(512, 768)?, "image/png");
        let loaded = download(&transport()?, &image.data_url(), false)?;
        assert_eq!(loaded, image);
        assert_eq!(image_size(&loaded)?, Size::new(512, 768));
        Ok(())
    }

    #[test]
    fn local_paths_are_refused_unless_allowed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let png_path = dir.path().join("private.png");
        fs::write(&png_path, png(8, 8)?)?;
        let raw = png_path.to_string_lossy().to_string();
        assert_eq!(download(&transport()?, &raw, false), Err(Message::DownloadError));
        assert_eq!(
            download(&transport()?, &format!("file://{raw}"), false),
            Err(Message::DownloadError)
        );

        let loaded = download(&transport()?, &raw, true)?;
        assert_eq!(loaded.mime, "image/png");
        Ok(())
    }

    #[test]
    fn allowed_local_files_are_sniffed_and_filtered() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gif_path = dir.path().join("in.gif");
        fs::write(&gif_path, b"GIF89a....")?;
        assert_eq!(
            download(&transport()?, gif_path.to_string_lossy().as_ref(), true),
            Err(Message::UnsupportedFileType)
        );
        assert_eq!(
            download(&transport()?, dir.path().join("missing.png").to_string_lossy().as_ref(), true),
            Err(Message::DownloadError)
        );
        Ok(())
    }

    #[test]
    fn remote_downloads_check_type_and_size() -> anyhow::Result<()> {
        let server = FakeServer::start(vec![
            Reply::bytes(200, "image/jpeg", vec![0xff, 0xd8, 0xff, 0xe0]),
            Reply::bytes(200, "image/webp", b"RIFF0000WEBP".to_vec()),
            Reply::bytes(200, "image/png", vec![0; (MAX_CONTENT_SIZE + 1) as usize]),
            Reply::text(404, "gone"),
        ])?;
        let transport = transport()?;
        let jpeg = download(&transport, &format!("{}/a.jpg", server.url()), false)?;
        assert_eq!(jpeg.mime, "image/jpeg");
        assert_eq!(
            download(&transport, &format!("{}/b.webp", server.url()), false),
            Err(Message::UnsupportedFileType)
        );
        assert_eq!(
            download(&transport, &format!("{}/c.png", server.url()), false),
            Err(Message::FileTooLarge)
        );
        assert_eq!(
            download(&transport, &format!("{}/d.png", server.url()), false),
            Err(Message::DownloadError)
        );
        Ok(())
    }
}
