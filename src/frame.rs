use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{codecs::jpeg::JpegEncoder, ImageFormat};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;

const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

// Browsers encode canvas snapshots at 0.92 by default.
const JPEG_QUALITY: u8 = 92;

/// Returns JPEG bytes for any image format the `image` crate can decode.
/// JPEG input is passed through untouched.
pub fn encode_jpeg(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let format = image::guess_format(data).context("unrecognised image format")?;
    if format == ImageFormat::Jpeg {
        return Ok(data.to_vec());
    }
    let img = image::load_from_memory_with_format(data, format)?;
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
    encoder.encode_image(&img.to_rgb8())?;
    Ok(buffer)
}

pub fn to_data_url(jpeg: &[u8]) -> String {
    let mut url = String::with_capacity(DATA_URL_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
    url.push_str(DATA_URL_PREFIX);
    STANDARD.encode_string(jpeg, &mut url);
    url
}

/// Decodes either a bare base64 payload or a `data:` URL.
pub fn decode_image_data(encoded: &str) -> anyhow::Result<Vec<u8>> {
    let payload = match encoded.strip_prefix("data:") {
        Some(rest) => match rest.split_once(";base64,") {
            Some((_, payload)) => payload,
            None => bail!("data URL is not base64 encoded"),
        },
        None => encoded,
    };
    Ok(STANDARD.decode(payload.trim())?)
}

pub async fn read_image_file(file_path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
    let mut file = File::open(file_path).await?;
    let mut contents = vec![];
    file.read_to_end(&mut contents).await?;
    Ok(contents)
}

pub async fn save_frame(jpeg: &[u8], image_path: PathBuf) -> anyhow::Result<()> {
    let mut file = File::create(&image_path).await?;
    file.write_all(jpeg).await?;
    debug!("Saved frame: {:?}", image_path);
    Ok(())
}

pub async fn ensure_directory_exists(path: Option<&Path>) -> anyhow::Result<()> {
    if let Some(path) = path {
        if !path.exists() {
            fs::create_dir_all(path).await?;
        }
    }
    Ok(())
}
