//! Unpacking verified archives

use flate2::read::GzDecoder;
use std::fs::File;
use std::io;
use std::path::Path;

use super::FetchError;

/// Gunzip `archive` into the already-open `dest` file
pub(crate) fn gunzip_into(archive: &Path, dest: &mut File) -> Result<u64, FetchError> {
    let mut decoder = GzDecoder::new(File::open(archive)?);
    let written = io::copy(&mut decoder, dest)
        .map_err(|e| FetchError::Archive(format!("{}: {}", archive.display(), e)))?;
    dest.sync_all()?;
    Ok(written)
}

/// Unpack a gzip-compressed tarball into `dest_dir`
///
/// Entries that would land outside `dest_dir` are skipped by `tar`.
pub(crate) fn untar_gz_into(archive: &Path, dest_dir: &Path) -> Result<(), FetchError> {
    let decoder = GzDecoder::new(File::open(archive)?);
    let mut tarball = tar::Archive::new(decoder);
    tarball
        .unpack(dest_dir)
        .map_err(|e| FetchError::Archive(format!("{}: {}", archive.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    #[test]
    fn test_gunzip_round_trip() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("data.gz");
        let mut encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
        encoder.write_all(b"line one\nline two\n").unwrap();
        encoder.finish().unwrap();

        let out_path = dir.path().join("data.txt");
        let mut out = File::create(&out_path).unwrap();
        assert_eq!(gunzip_into(&archive, &mut out).unwrap(), 18);

        let mut contents = String::new();
        File::open(&out_path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "line one\nline two\n");
    }

    #[test]
    fn test_not_gzip_is_archive_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("plain.gz");
        std::fs::write(&archive, b"definitely not gzip").unwrap();
        let mut out = File::create(dir.path().join("out")).unwrap();
        assert!(matches!(
            gunzip_into(&archive, &mut out),
            Err(FetchError::Archive(_))
        ));
    }
}
