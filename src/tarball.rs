//! Reading and writing the tar files that carry archives and bundles.
//!
//! Extraction accepts plain or gzip-compressed input (detected by magic bytes),
//! only materializes regular files and directories, and never lets an entry
//! escape the target directory. Writing produces deterministic headers
//! (zero mtime, uid/gid 0, fixed mode) so identical content packs to identical
//! bytes.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Normalizes a path from a tar archive to be safe for extraction
/// Removes any attempts to escape the root directory
pub fn normalize_tar_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }

    out
}

/// Extracts a tar file (plain or gzipped) into `extract_dir`.
pub fn extract_tar(tar_path: &Path, extract_dir: &Path) -> io::Result<()> {
    let mut magic_bytes = [0u8; 2];
    let gzipped = {
        let mut reader = BufReader::new(File::open(tar_path)?);
        match reader.read_exact(&mut magic_bytes) {
            Ok(()) => magic_bytes == GZIP_MAGIC,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
            Err(e) => return Err(e),
        }
    };

    // Reopen the file since we consumed some bytes
    let file = File::open(tar_path)?;
    if gzipped {
        unpack(GzDecoder::new(file), extract_dir)
    } else {
        unpack(file, extract_dir)
    }
}

/// Extracts an in-memory tar (plain or gzipped) into `extract_dir`.
pub fn extract_tar_bytes(data: &[u8], extract_dir: &Path) -> io::Result<()> {
    if data.starts_with(&GZIP_MAGIC) {
        unpack(GzDecoder::new(Cursor::new(data)), extract_dir)
    } else {
        unpack(Cursor::new(data), extract_dir)
    }
}

fn unpack<R: Read>(reader: R, extract_dir: &Path) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let entry_type = entry.header().entry_type();
        let rel_path = normalize_tar_path(&entry.path()?);
        if rel_path.as_os_str().is_empty() {
            continue;
        }
        let dest = extract_dir.join(&rel_path);

        match entry_type {
            tar::EntryType::Directory => {
                fs::create_dir_all(&dest)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out_file = File::create(&dest)?;
                io::copy(&mut entry, &mut out_file)?;
            }
            other => {
                log::debug!(
                    "Skipping unsupported entry type {:?}: {}",
                    other,
                    rel_path.display()
                );
            }
        }
    }

    Ok(())
}

/// Appends a regular file with a deterministic header.
pub fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, path, data)
}

/// Packs `(path, content)` pairs in the given order into a tar, optionally gzipped.
pub fn pack(files: &[(String, Vec<u8>)], gzip: bool) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        append_file(&mut builder, path, data)?;
    }
    let tar_bytes = builder.into_inner()?;

    if !gzip {
        return Ok(tar_bytes);
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_tar_path() {
        assert_eq!(normalize_tar_path(Path::new("./a/b")), PathBuf::from("a/b"));
        assert_eq!(normalize_tar_path(Path::new("/etc/passwd")), PathBuf::from("etc/passwd"));
        assert_eq!(normalize_tar_path(Path::new("../../x")), PathBuf::from("x"));
        assert_eq!(normalize_tar_path(Path::new("a/../../b")), PathBuf::from("b"));
    }

    #[test]
    fn test_pack_is_deterministic() {
        let files = vec![
            ("a.txt".to_string(), b"alpha".to_vec()),
            ("dir/b.txt".to_string(), b"beta".to_vec()),
        ];
        assert_eq!(pack(&files, false).unwrap(), pack(&files, false).unwrap());
        assert_eq!(pack(&files, true).unwrap(), pack(&files, true).unwrap());
    }

    #[test]
    fn test_pack_and_extract() {
        let files = vec![
            ("a.txt".to_string(), b"alpha".to_vec()),
            ("dir/b.txt".to_string(), b"beta".to_vec()),
        ];

        for gzip in [false, true] {
            let dir = tempdir().unwrap();
            let data = pack(&files, gzip).unwrap();
            extract_tar_bytes(&data, dir.path()).unwrap();
            assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"alpha");
            assert_eq!(fs::read(dir.path().join("dir/b.txt")).unwrap(), b"beta");

            let tar_path = dir.path().join("packed.tar");
            fs::write(&tar_path, &data).unwrap();
            let out = dir.path().join("out");
            extract_tar(&tar_path, &out).unwrap();
            assert_eq!(fs::read(out.join("dir/b.txt")).unwrap(), b"beta");
        }
    }
}
