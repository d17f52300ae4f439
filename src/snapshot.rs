/*
    Lorraine
    https://github.com/lorraine-emu/lorraine

    Copyright 2022-2025 The Lorraine contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    snapshot.rs

    Snapshot container. A snapshot is a big-endian header followed by the
    persistent items of every component in a fixed leaf-first order. A
    version mismatch is a hard reject; the previous machine state is
    preserved on any load failure.

*/

use binrw::{BinRead, BinWrite};
use std::io::Cursor;

use crate::error::SnapshotError;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"LRSS";
pub const SNAPSHOT_MAJOR: u8 = 0;
pub const SNAPSHOT_MINOR: u8 = 3;
pub const SNAPSHOT_SUBMINOR: u8 = 0;

/// Thumbnail dimensions embedded in the header.
pub const THUMBNAIL_W: u32 = 128;
pub const THUMBNAIL_H: u32 = 78;

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big, magic = b"LRSS")]
pub struct SnapshotHeader {
    pub major: u8,
    pub minor: u8,
    pub subminor: u8,
    pub timestamp: u64,
    pub image_width: u32,
    pub image_height: u32,
    #[br(count = image_width * image_height)]
    pub image_rgba: Vec<u32>,
}

impl SnapshotHeader {
    pub fn new(timestamp: u64, thumbnail: Vec<u32>) -> Self {
        debug_assert_eq!(thumbnail.len(), (THUMBNAIL_W * THUMBNAIL_H) as usize);
        Self {
            major: SNAPSHOT_MAJOR,
            minor: SNAPSHOT_MINOR,
            subminor: SNAPSHOT_SUBMINOR,
            timestamp,
            image_width: THUMBNAIL_W,
            image_height: THUMBNAIL_H,
            image_rgba: thumbnail,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.major == SNAPSHOT_MAJOR && self.minor == SNAPSHOT_MINOR
    }
}

/// Big-endian item stream writer for component state.
#[derive(Default)]
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Big-endian item stream reader. Every take checks for truncation.
pub struct SnapshotReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + n > self.buf.len() {
            return Err(SnapshotError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u16(&mut self) -> Result<u16, SnapshotError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn take_u32(&mut self) -> Result<u32, SnapshotError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn take_u64(&mut self) -> Result<u64, SnapshotError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn take_i64(&mut self) -> Result<i64, SnapshotError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn take_into(&mut self, dest: &mut [u8]) -> Result<(), SnapshotError> {
        let src = self.take(dest.len())?;
        dest.copy_from_slice(src);
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Serialize a header and an item stream into one snapshot blob.
pub fn assemble(header: &SnapshotHeader, items: SnapshotWriter) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    header
        .write(&mut cursor)
        .expect("writing to a memory buffer cannot fail");
    let mut blob = cursor.into_inner();
    blob.extend_from_slice(&items.into_bytes());
    blob
}

/// Split a snapshot blob into its header and item stream, rejecting
/// incompatible versions.
pub fn disassemble(blob: &[u8]) -> Result<(SnapshotHeader, SnapshotReader), SnapshotError> {
    let mut cursor = Cursor::new(blob);
    let header = SnapshotHeader::read(&mut cursor).map_err(|e| match e {
        binrw::Error::BadMagic { .. } => SnapshotError::BadMagic,
        _ => SnapshotError::Truncated,
    })?;

    if !header.is_compatible() {
        return Err(SnapshotError::VersionMismatch {
            major: header.major,
            minor: header.minor,
        });
    }

    let offset = cursor.position() as usize;
    Ok((header, SnapshotReader::new(&blob[offset..])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thumbnail() -> Vec<u32> {
        vec![0xFF00FF00; (THUMBNAIL_W * THUMBNAIL_H) as usize]
    }

    #[test]
    fn header_round_trip() {
        let header = SnapshotHeader::new(1234, thumbnail());
        let mut items = SnapshotWriter::new();
        items.put_u16(0xBEEF);
        items.put_i64(-42);

        let blob = assemble(&header, items);
        let (parsed, mut reader) = disassemble(&blob).unwrap();

        assert_eq!(parsed.timestamp, 1234);
        assert_eq!(parsed.image_width, THUMBNAIL_W);
        assert_eq!(reader.take_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.take_i64().unwrap(), -42);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let blob = b"NOPE00000000".to_vec();
        assert!(matches!(disassemble(&blob), Err(SnapshotError::BadMagic)));
    }

    #[test]
    fn version_mismatch_is_a_hard_reject() {
        let mut header = SnapshotHeader::new(0, thumbnail());
        header.major = SNAPSHOT_MAJOR + 1;
        let blob = assemble(&header, SnapshotWriter::new());

        assert!(matches!(
            disassemble(&blob),
            Err(SnapshotError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn truncated_stream_is_detected() {
        let mut reader = SnapshotReader::new(&[0x12]);
        assert!(matches!(reader.take_u16(), Err(SnapshotError::Truncated)));
    }

    #[test]
    fn items_are_big_endian() {
        let mut w = SnapshotWriter::new();
        w.put_u16(0x1234);
        assert_eq!(w.into_bytes(), vec![0x12, 0x34]);
    }
}
