//! Framing for the durable store's incremental backup stream.
//!
//! A stream is a 5-byte header (magic + format version) followed by zero or
//! more frames, each a length-prefixed (key, record) pair. Records carry
//! the durable store's write-version prefix, which is what makes cumulative
//! incremental backups possible.

use std::io::{Read, Write};

use anyhow::{bail, Context};

const MAGIC: [u8; 4] = *b"HGRB";
const FORMAT_VERSION: u8 = 1;

/// Writes the stream header.
///
/// # Errors
///
/// Propagates sink I/O failures.
pub fn write_header(sink: &mut (dyn Write + Send)) -> anyhow::Result<()> {
    sink.write_all(&MAGIC).context("backup: write magic")?;
    sink.write_all(&[FORMAT_VERSION])
        .context("backup: write format version")?;
    Ok(())
}

/// Reads and validates the stream header.
///
/// # Errors
///
/// Fails on I/O errors, wrong magic, or an unknown format version.
pub fn read_header(source: &mut (dyn Read + Send)) -> anyhow::Result<()> {
    let mut magic = [0u8; 4];
    source
        .read_exact(&mut magic)
        .context("restore: read magic")?;
    if magic != MAGIC {
        bail!("restore: not a hangar backup stream");
    }

    let mut version = [0u8; 1];
    source
        .read_exact(&mut version)
        .context("restore: read format version")?;
    if version[0] != FORMAT_VERSION {
        bail!("restore: unknown backup format version {}", version[0]);
    }
    Ok(())
}

/// Writes one (key, record) frame.
///
/// # Errors
///
/// Propagates sink I/O failures; lengths beyond `u32` are rejected.
pub fn write_frame(
    sink: &mut (dyn Write + Send),
    key: &[u8],
    record: &[u8],
) -> anyhow::Result<()> {
    let key_len = u32::try_from(key.len()).context("backup: key too large for frame")?;
    let record_len = u32::try_from(record.len()).context("backup: record too large for frame")?;

    sink.write_all(&key_len.to_be_bytes())
        .context("backup: write key length")?;
    sink.write_all(key).context("backup: write key")?;
    sink.write_all(&record_len.to_be_bytes())
        .context("backup: write record length")?;
    sink.write_all(record).context("backup: write record")?;
    Ok(())
}

/// Reads the next (key, record) frame, or `None` at a clean end of stream.
///
/// # Errors
///
/// Fails on I/O errors or a stream cut off mid-frame.
pub fn read_frame(
    source: &mut (dyn Read + Send),
) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut len = [0u8; 4];
    match source.read_exact(&mut len) {
        Ok(()) => {}
        // EOF on a frame boundary is the normal end of the stream.
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("restore: read key length"),
    }

    let mut key = vec![0u8; u32::from_be_bytes(len) as usize];
    source.read_exact(&mut key).context("restore: read key")?;

    source
        .read_exact(&mut len)
        .context("restore: read record length")?;
    let mut record = vec![0u8; u32::from_be_bytes(len) as usize];
    source
        .read_exact(&mut record)
        .context("restore: read record")?;

    Ok(Some((key, record)))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn header_round_trip() {
        let mut sink = Vec::new();
        write_header(&mut sink).unwrap();

        let mut source = Cursor::new(sink);
        read_header(&mut source).unwrap();
    }

    #[test]
    fn read_header_rejects_foreign_streams() {
        let mut source = Cursor::new(b"NOPE\x01".to_vec());
        assert!(read_header(&mut source).is_err());
    }

    #[test]
    fn frames_round_trip_until_clean_eof() {
        let mut sink = Vec::new();
        write_frame(&mut sink, b"k1", b"r1").unwrap();
        write_frame(&mut sink, b"", b"record-2").unwrap();

        let mut source = Cursor::new(sink);
        assert_eq!(
            read_frame(&mut source).unwrap(),
            Some((b"k1".to_vec(), b"r1".to_vec()))
        );
        assert_eq!(
            read_frame(&mut source).unwrap(),
            Some((Vec::new(), b"record-2".to_vec()))
        );
        assert_eq!(read_frame(&mut source).unwrap(), None);
    }

    #[test]
    fn truncated_frame_is_an_error_not_eof() {
        let mut sink = Vec::new();
        write_frame(&mut sink, b"key", b"record").unwrap();
        sink.truncate(sink.len() - 2);

        let mut source = Cursor::new(sink);
        assert!(read_frame(&mut source).is_err());
    }
}
