use bytes::Bytes;
use std::future::Future;
use tracing::debug;

use crate::backend::BackendError;
use crate::constants::{BOX_HEADER_SIZE, FRONT_LOADED_THRESHOLD, LARGE_BOX_HEADER_SIZE};

/// Where the `moov` box sits in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoovPosition {
    pub offset: u64,
    pub size: u64,
}

/// Walks top-level ISO-BMFF boxes to find the metadata box.
///
/// Advisory only: a player can start quickly when `moov` precedes `mdat`,
/// otherwise it will seek to the end first. Nothing is ever rejected on
/// the strength of this result.
pub struct MoovAtomHandler;

impl MoovAtomHandler {
    /// Big-endian 32-bit size followed by a four character type.
    /// Returns `None` when fewer than 8 bytes are given.
    pub fn parse_box_header(data: &[u8]) -> Option<(u32, [u8; 4])> {
        let header: &[u8; BOX_HEADER_SIZE] = data.get(..BOX_HEADER_SIZE)?.try_into().ok()?;
        let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let fourcc = [header[4], header[5], header[6], header[7]];
        Some((size, fourcc))
    }

    /// Scan the top-level boxes through `read(offset, len)`.
    ///
    /// The scan stops at `total_size`, at a box of size 0 (runs to end of
    /// file) and at any malformed size.
    pub async fn find_moov_position<F, Fut>(
        mut read: F,
        total_size: u64,
    ) -> Result<Option<MoovPosition>, BackendError>
    where
        F: FnMut(u64, usize) -> Fut,
        Fut: Future<Output = Result<Bytes, BackendError>>,
    {
        let mut offset = 0u64;

        while total_size.saturating_sub(offset) >= BOX_HEADER_SIZE as u64 {
            let want = (total_size - offset).min(LARGE_BOX_HEADER_SIZE as u64) as usize;
            let data = read(offset, want).await?;

            let Some((raw_size, fourcc)) = Self::parse_box_header(&data) else {
                return Ok(None);
            };

            let size = match raw_size {
                0 => {
                    debug!(offset, "box extends to end of file, stopping scan");
                    return Ok(None);
                }
                1 => match data.get(BOX_HEADER_SIZE..LARGE_BOX_HEADER_SIZE) {
                    Some(ext) => {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(ext);
                        u64::from_be_bytes(buf)
                    }
                    None => return Ok(None),
                },
                n => n as u64,
            };

            let min_size = if raw_size == 1 {
                LARGE_BOX_HEADER_SIZE as u64
            } else {
                BOX_HEADER_SIZE as u64
            };
            if size < min_size {
                debug!(offset, size, "malformed box size, stopping scan");
                return Ok(None);
            }

            if &fourcc == b"moov" {
                return Ok(Some(MoovPosition { offset, size }));
            }

            offset = match offset.checked_add(size) {
                Some(next) if next <= total_size => next,
                _ => {
                    debug!(offset, size, "box runs past end of file, stopping scan");
                    return Ok(None);
                }
            };
        }

        Ok(None)
    }

    /// True when `moov` starts within the first 100 KiB, or was not found
    pub fn is_front_loaded(position: Option<MoovPosition>) -> bool {
        match position {
            Some(pos) => pos.offset < FRONT_LOADED_THRESHOLD,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn boxed(fourcc: &[u8; 4], payload_len: usize) -> Vec<u8> {
        let mut out = ((payload_len + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(fourcc);
        out.extend(std::iter::repeat(0u8).take(payload_len));
        out
    }

    async fn scan(file: &[u8]) -> Option<MoovPosition> {
        let data = Bytes::copy_from_slice(file);
        let total = data.len() as u64;
        MoovAtomHandler::find_moov_position(
            |offset, len| {
                let start = offset as usize;
                let end = (start + len).min(data.len());
                let slice = data.slice(start..end);
                async move { Ok(slice) }
            },
            total,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_parse_box_header() {
        let header = [0x00, 0x00, 0x00, 0x20, b'f', b't', b'y', b'p'];
        assert_eq!(MoovAtomHandler::parse_box_header(&header), Some((32, *b"ftyp")));
        assert_eq!(MoovAtomHandler::parse_box_header(&header[..5]), None);
    }

    #[tokio::test]
    async fn test_front_loaded_layout() {
        let mut file = boxed(b"ftyp", 24);
        file.extend(boxed(b"moov", 500));
        file.extend(boxed(b"mdat", 4000));

        let pos = scan(&file).await;
        assert_eq!(pos, Some(MoovPosition { offset: 32, size: 508 }));
        assert!(MoovAtomHandler::is_front_loaded(pos));
    }

    #[tokio::test]
    async fn test_back_loaded_layout() {
        let mut file = boxed(b"ftyp", 24);
        file.extend(boxed(b"mdat", 200 * 1024));
        file.extend(boxed(b"moov", 100));

        let pos = scan(&file).await;
        assert_eq!(pos.map(|p| p.offset), Some(32 + 200 * 1024 + 8));
        assert!(!MoovAtomHandler::is_front_loaded(pos));
    }

    #[tokio::test]
    async fn test_zero_size_box_aborts() {
        let mut file = boxed(b"ftyp", 8);
        file.extend_from_slice(&[0, 0, 0, 0]);
        file.extend_from_slice(b"mdat");
        file.extend(boxed(b"moov", 16));

        assert_eq!(scan(&file).await, None);
    }

    #[tokio::test]
    async fn test_malformed_size_aborts() {
        let mut file = boxed(b"ftyp", 8);
        file.extend_from_slice(&[0, 0, 0, 4]);
        file.extend_from_slice(b"free");
        file.extend(boxed(b"moov", 16));

        assert_eq!(scan(&file).await, None);
    }

    #[tokio::test]
    async fn test_large_box_is_skipped() {
        let mut file = boxed(b"ftyp", 8);
        // 64-bit sized mdat: 16-byte header plus 32 bytes of payload
        file.extend_from_slice(&[0, 0, 0, 1]);
        file.extend_from_slice(b"mdat");
        file.extend_from_slice(&48u64.to_be_bytes());
        file.extend(std::iter::repeat(0u8).take(32));
        file.extend(boxed(b"moov", 16));

        let pos = scan(&file).await;
        assert_eq!(pos, Some(MoovPosition { offset: 16 + 48, size: 24 }));
    }

    #[tokio::test]
    async fn test_huge_extended_size_stops_scan() {
        let mut file = boxed(b"ftyp", 8);
        file.extend_from_slice(&[0, 0, 0, 1]);
        file.extend_from_slice(b"mdat");
        file.extend_from_slice(&(u64::MAX - 20).to_be_bytes());
        file.extend(boxed(b"moov", 16));

        assert_eq!(scan(&file).await, None);
    }

    #[tokio::test]
    async fn test_scan_stays_within_total_size() {
        let reads = AtomicUsize::new(0);
        let file = boxed(b"mdat", 1_000_000);
        let data = Bytes::from(file);

        let pos = MoovAtomHandler::find_moov_position(
            |offset, len| {
                reads.fetch_add(1, Ordering::SeqCst);
                let start = offset as usize;
                let slice = data.slice(start..(start + len).min(data.len()));
                async move { Ok(slice) }
            },
            data.len() as u64,
        )
        .await
        .unwrap();

        assert_eq!(pos, None);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert!(MoovAtomHandler::is_front_loaded(pos));
    }

    #[tokio::test]
    async fn test_read_errors_propagate() {
        let result = MoovAtomHandler::find_moov_position(
            |_, _| async { Err(BackendError::Transport("boom".into())) },
            1024,
        )
        .await;
        assert!(result.is_err());
    }
}
