use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OciCompression {
    Gzip,
    Zstd,
}

impl OciCompression {
    pub fn as_str(&self) -> &'static str {
        match self {
            OciCompression::Gzip => "gzip",
            OciCompression::Zstd => "zstd",
        }
    }

    pub fn media_type_suffix(&self) -> &'static str {
        match self {
            OciCompression::Gzip => "+gzip",
            OciCompression::Zstd => "+zstd",
        }
    }

    pub fn file_extension(compression: Option<Self>) -> &'static str {
        match compression {
            None => "tar",
            Some(OciCompression::Gzip) => "tar.gz",
            Some(OciCompression::Zstd) => "tar.zst",
        }
    }

    pub fn detect(header: &[u8]) -> Option<Self> {
        if header.starts_with(GZIP_MAGIC) {
            Some(OciCompression::Gzip)
        } else if header.starts_with(ZSTD_MAGIC) {
            Some(OciCompression::Zstd)
        } else {
            None
        }
    }

    pub fn detect_file(path: &Path) -> Result<Option<Self>> {
        let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = file.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(Self::detect(&header[..filled]))
    }
}

impl FromStr for OciCompression {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(OciCompression::Gzip),
            "zstd" | "zst" => Ok(OciCompression::Zstd),
            other => anyhow::bail!("Unknown compression '{other}' (expected gzip or zstd)"),
        }
    }
}

/// Write side of an optional compressor. `finish` must be called to flush
/// trailing frames.
pub enum Compressor<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Compressor<W> {
    pub fn new(inner: W, compression: Option<OciCompression>) -> io::Result<Self> {
        Ok(match compression {
            None => Compressor::Plain(inner),
            Some(OciCompression::Gzip) => {
                Compressor::Gzip(GzEncoder::new(inner, flate2::Compression::default()))
            }
            Some(OciCompression::Zstd) => {
                Compressor::Zstd(zstd::stream::write::Encoder::new(inner, ZSTD_LEVEL)?)
            }
        })
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Compressor::Gzip(encoder) => encoder.finish(),
            Compressor::Zstd(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Plain(inner) => inner.write(buf),
            Compressor::Gzip(encoder) => encoder.write(buf),
            Compressor::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Plain(inner) => inner.flush(),
            Compressor::Gzip(encoder) => encoder.flush(),
            Compressor::Zstd(encoder) => encoder.flush(),
        }
    }
}

pub fn decompressing_reader<'a, R: Read + 'a>(
    reader: R,
    compression: Option<OciCompression>,
) -> Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        None => Box::new(reader),
        Some(OciCompression::Gzip) => Box::new(GzDecoder::new(reader)),
        Some(OciCompression::Zstd) => Box::new(zstd::stream::read::Decoder::new(reader)?),
    })
}

/// Writes the decompressed form of `source` to `target`, detecting the
/// compression from the stream header when `compression` is not given.
pub fn decompress_file(source: &Path, target: &Path, compression: Option<OciCompression>) -> Result<u64> {
    let compression = match compression {
        Some(compression) => Some(compression),
        None => OciCompression::detect_file(source)?,
    };

    let input = File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
    let mut reader = decompressing_reader(BufReader::new(input), compression)?;
    let output =
        File::create(target).with_context(|| format!("Failed to create {}", target.display()))?;
    let mut writer = BufWriter::new(output);
    let copied = io::copy(&mut reader, &mut writer)
        .with_context(|| format!("Failed to decompress {}", source.display()))?;
    writer.flush()?;
    Ok(copied)
}
