use std::fs;
use std::io::{self, Write};
use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Atomically creates a file with the given contents, overwriting
/// it if one exists.
///
/// The buffer is first written to a temporary file in the same
/// directory as the destination, flushed and synced, and only then
/// renamed into place. If this function returns successfully, you can
/// be reasonably sure the write completed durably.
///
/// Read: [Ensuring data reaches to disk](https://lwn.net/Articles/457667/).
pub fn safe_write_all<P: AsRef<Path>, B: AsRef<[u8]>>(path: P, buf: B) -> io::Result<()> {
    // create temp file
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let tmp_path = path.as_ref().with_extension(format!("sync-{suffix}"));
    let mut tmp_file = fs::File::create(tmp_path.clone())?;

    // write given contents and sync to disk
    tmp_file.write_all(buf.as_ref())?;
    tmp_file.flush()?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    // rename tmp file to destination
    fs::rename(&tmp_path, path.as_ref())
}
