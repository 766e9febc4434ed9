use std::{fs::File, io, path::Path};

use odo_core::trace_call_result;

use crate::FileIndex;

/// Location of the sidecar index, relative to the sync target
pub const SIDECAR_PATH: &str = ".odo/file-index.json";

const RECORD_SIZE: usize = 10240;

/// Builds an uncompressed tar stream of `paths` (relative to `root`), optionally carrying the sidecar index
pub fn build_archive<'a, I>(root: &Path, paths: I, sidecar: Option<&FileIndex>) -> io::Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(true);
    for relative in paths {
        let full_path = root.join(relative);
        let mut file = match File::open(&full_path) {
            Ok(file) => file,
            // Raced with a deletion; the next tick records it as deleted.
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        trace_call_result!(archive.append_file(relative, &mut file))?;
    }
    if let Some(index) = sidecar {
        let encoded = serde_json::to_vec(index)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_size(encoded.len() as u64);
        archive.append_data(&mut header, SIDECAR_PATH, io::Cursor::new(encoded))?;
    }
    let mut bytes = archive.into_inner()?;
    // Some extractors insist on whole records before they see the end-of-archive marker.
    let padded_len = (bytes.len() + RECORD_SIZE - 1) / RECORD_SIZE * RECORD_SIZE;
    bytes.resize(padded_len, 0);
    Ok(bytes)
}
