// ABOUTME: Opens changeset inputs from disk or memory as buffered readers
// ABOUTME: Picks gzip or bzip2 decompression from the file extension

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;

use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;

/// Boxed reader handed to the parser.
pub type ChangesetInput = Box<dyn BufRead + Send>;

const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Compression applied to an input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    /// Guess the compression from a file name.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("gz") => Compression::Gzip,
            Some(ext) if ext.eq_ignore_ascii_case("bz2") => Compression::Bzip2,
            _ => Compression::None,
        }
    }
}

/// Open a dump or diff file, decompressing it on the fly when needed.
pub fn open_file(path: &Path) -> Result<ChangesetInput> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open changeset file {:?}", path))?;
    let compression = Compression::from_path(path);
    tracing::debug!("Opening {:?} with compression {:?}", path, compression);
    Ok(wrap(BufReader::with_capacity(READ_BUFFER_BYTES, file), compression))
}

/// Wrap an in-memory gzip payload, as fetched from the replication server.
pub fn from_gzip_bytes(bytes: Vec<u8>) -> ChangesetInput {
    wrap(Cursor::new(bytes), Compression::Gzip)
}

fn wrap<R: BufRead + Send + 'static>(reader: R, compression: Compression) -> ChangesetInput {
    match compression {
        Compression::None => Box::new(reader),
        // Planet dumps are concatenated multi-member archives
        Compression::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(reader))),
        Compression::Bzip2 => Box::new(BufReader::new(MultiBzDecoder::new(reader))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::{Read, Write};

    #[test]
    fn test_compression_from_path() {
        assert_eq!(
            Compression::from_path(Path::new("changesets-latest.osm.bz2")),
            Compression::Bzip2
        );
        assert_eq!(
            Compression::from_path(Path::new("/tmp/123.osm.gz")),
            Compression::Gzip
        );
        assert_eq!(
            Compression::from_path(Path::new("discussions.osm")),
            Compression::None
        );
        assert_eq!(Compression::from_path(Path::new("README")), Compression::None);
    }

    #[test]
    fn test_from_gzip_bytes_round_trip() {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"<osm/>").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut out = String::new();
        from_gzip_bytes(compressed).read_to_string(&mut out).unwrap();
        assert_eq!(out, "<osm/>");
    }

    #[test]
    fn test_open_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.osm");
        std::fs::write(&path, "<osm></osm>").unwrap();

        let mut out = String::new();
        open_file(&path).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "<osm></osm>");
    }

    #[test]
    fn test_open_missing_file_has_context() {
        let err = match open_file(Path::new("/nonexistent/changesets.osm")) {
            Ok(_) => panic!("missing file must fail"),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("Failed to open changeset file"));
    }
}
