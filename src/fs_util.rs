use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};

use camino::Utf8Path;
use flate2::read::MultiGzDecoder;

use crate::error::RefineryError;

/// Opens a text file for line reading, decompressing `.gz` files transparently.
pub fn open_lines(path: &Utf8Path) -> Result<Box<dyn BufRead>, RefineryError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| RefineryError::Filesystem(format!("open {path}: {err}")))?;
    let reader: Box<dyn Read> = if path.extension() == Some("gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

pub fn read_lines(path: &Utf8Path) -> Result<Vec<String>, RefineryError> {
    open_lines(path)?
        .lines()
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| RefineryError::Filesystem(format!("read {path}: {err}")))
}
