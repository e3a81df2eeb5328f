//! Container-level tag handling at the head of compressed streams.

use std::io::{self, Read};

/// Decodes the syncsafe 28-bit size used by ID3v2 headers.
fn syncsafe(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .take(4)
        .fold(0usize, |acc, &b| (acc << 7) | (b & 0x7f) as usize)
}

/// Reader wrapper that drops a leading ID3v2 frame before handing the
/// stream to the MP3 decoder.
pub(crate) struct Id3Skip<R: Read> {
    inner: R,
    checked: bool,
    pending: Vec<u8>,
    offset: usize,
}

impl<R: Read> Id3Skip<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            checked: false,
            pending: Vec::new(),
            offset: 0,
        }
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn check_header(&mut self) -> io::Result<()> {
        self.checked = true;
        let mut header = [0u8; 10];
        let got = self.read_exact_or_eof(&mut header)?;
        if got == 10 && &header[..3] == b"ID3" {
            let mut skip = syncsafe(&header[6..10]);
            if header[5] & 0x10 != 0 {
                // ID3v2.4 footer
                skip += 10;
            }
            tracing::debug!("skipping ID3v2 frame of {} bytes", skip);
            let mut scratch = [0u8; 512];
            while skip > 0 {
                let step = skip.min(scratch.len());
                let n = self.inner.read(&mut scratch[..step])?;
                if n == 0 {
                    break;
                }
                skip -= n;
            }
        } else {
            self.pending.extend_from_slice(&header[..got]);
        }
        Ok(())
    }
}

impl<R: Read> Read for Id3Skip<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.checked {
            self.check_header()?;
        }
        if self.offset < self.pending.len() {
            let n = buf.len().min(self.pending.len() - self.offset);
            buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
            self.offset += n;
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_id3_frame_is_skipped() {
        // En-tête ID3v2 annonçant 4 octets de tags, puis le flux réel.
        let mut data = vec![b'I', b'D', b'3', 3, 0, 0, 0, 0, 0, 4];
        data.extend_from_slice(&[0xAA; 4]);
        data.extend_from_slice(&[1, 2, 3]);
        let mut reader = Id3Skip::new(Cursor::new(data));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_headerless_stream_passes_through() {
        let data = vec![9u8; 16];
        let mut reader = Id3Skip::new(Cursor::new(data.clone()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_short_stream_is_preserved() {
        let data = vec![1u8, 2, 3];
        let mut reader = Id3Skip::new(Cursor::new(data.clone()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_syncsafe_size() {
        assert_eq!(syncsafe(&[0, 0, 0x02, 0x01]), 0x101);
        assert_eq!(syncsafe(&[0, 0, 0x7f, 0x7f]), 0x3fff);
    }
}
