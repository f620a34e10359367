//! Incremental record decoder for `FramedRead`

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::{check_record_size, WORD};
use crate::error::{Error, Result};

/// Decodes the record format into record bodies
///
/// Yields the bytes after the length prefix; split them with
/// [`parse_record`](super::parse_record).
#[derive(Debug, Default)]
pub struct RecordDecoder {
    /// Body length of the record currently being assembled
    pending: Option<usize>,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RecordDecoder {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let total = match self.pending {
            Some(total) => total,
            None => {
                if src.len() < WORD {
                    src.reserve(WORD - src.len());
                    return Ok(None);
                }
                let total = src.get_u64_le();
                check_record_size(total)?;
                self.pending = Some(total as usize);
                total as usize
            }
        };

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(src.split_to(total).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if let Some(body) = self.decode(src)? {
            return Ok(Some(body));
        }
        match self.pending {
            Some(total) => Err(Error::truncated(total as u64, src.len() as u64)),
            None if !src.is_empty() => Err(Error::truncated(WORD as u64, src.len() as u64)),
            None => Ok(None),
        }
    }
}
