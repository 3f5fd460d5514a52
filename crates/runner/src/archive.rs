//! Packing source text into the tar stream copied into a sandbox.

use std::io;

/// Build an in-memory tar archive holding a single file.
pub fn pack_source(file_name: &str, source: &str) -> io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(source.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, file_name, source.as_bytes())?;
    builder.into_inner()
}
