use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gzip" | "gz" => Ok(Compression::Gzip),
            _ => Err(format!("unsupported compression: {}", s)),
        }
    }
}

pub fn open_file_for_write<P: AsRef<Path>>(
    filename: P,
    compression: Option<Compression>,
    compression_level: Option<u32>,
) -> Result<Box<dyn Write + Send>> {
    let buffer = BufWriter::new(
        File::create(&filename).with_context(|| format!("cannot create file: {}", filename.as_ref().display()))?
    );
    let writer: Box<dyn Write + Send> = match compression {
        None => Box::new(buffer),
        Some(Compression::Gzip) => Box::new(flate2::write::GzEncoder::new(
            buffer, flate2::Compression::new(compression_level.unwrap_or(6))
        )),
    };
    Ok(writer)
}

/// Open a file, possibly gzip-compressed.
pub fn open_file_for_read<P: AsRef<Path>>(file: P) -> Result<Box<dyn BufRead>> {
    let path = file.as_ref();
    let open = || File::open(path).with_context(|| format!("cannot open file: {}", path.display()));
    let reader: Box<dyn Read> = match detect_compression(path)? {
        Some(Compression::Gzip) => Box::new(flate2::read::MultiGzDecoder::new(open()?)),
        None => Box::new(open()?),
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Determine the file compression type from the gzip header.
fn detect_compression<P: AsRef<Path>>(file: P) -> Result<Option<Compression>> {
    let f = File::open(file.as_ref())
        .with_context(|| format!("cannot open file: {}", file.as_ref().display()))?;
    if flate2::read::MultiGzDecoder::new(f).header().is_some() {
        Ok(Some(Compression::Gzip))
    } else {
        Ok(None)
    }
}

/// Gene and transcript IDs lose their version suffix: `ENSG0001.5` becomes `ENSG0001`.
pub fn strip_version(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}
