//! Chunk block codec
//!
//! Chunk files and sorter spill files are sequences of blocks:
//!
//! - 4 bytes: block length (excluding this field)
//! - 4 bytes: record count
//! - N bytes: LZ4 block (size-prepended) of the bincode-encoded records
//! - 4 bytes: CRC32 of the record count and compressed payload

use crate::schema::RecordSchema;
use crate::types::Record;
use crate::{AggregationError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Read;

/// Records per block when writing
pub const BLOCK_RECORDS: usize = 1024;

/// Encode one block
pub fn encode_block(records: &[Record]) -> Result<Bytes> {
    let payload =
        bincode::serialize(records).map_err(|e| AggregationError::InvalidFormat(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&payload);

    let mut buf = BytesMut::with_capacity(compressed.len() + 12);
    // Length prefix, filled in below
    buf.put_u32_le(0);
    buf.put_u32_le(records.len() as u32);
    buf.put_slice(&compressed);

    let checksum = crc32fast::hash(&buf[4..]);
    buf.put_u32_le(checksum);

    let len = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());
    Ok(buf.freeze())
}

/// Decode the body of a block (everything after the length prefix)
pub fn decode_body(body: &[u8]) -> Result<Vec<Record>> {
    if body.len() < 8 {
        return Err(AggregationError::InvalidFormat("Block too short".into()));
    }

    let (data, tail) = body.split_at(body.len() - 4);
    let expected = (&tail[..]).get_u32_le();
    let actual = crc32fast::hash(data);
    if expected != actual {
        return Err(AggregationError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = data;
    let count = cursor.get_u32_le() as usize;
    let payload = lz4_flex::decompress_size_prepended(cursor)
        .map_err(|e| AggregationError::Compression(e.to_string()))?;
    let records: Vec<Record> =
        bincode::deserialize(&payload).map_err(|e| AggregationError::InvalidFormat(e.to_string()))?;

    if records.len() != count {
        return Err(AggregationError::Corruption(format!(
            "Block declares {} records, found {}",
            count,
            records.len()
        )));
    }
    Ok(records)
}

/// Decode a complete block, returning its records and the bytes consumed
pub fn decode_block(data: &[u8]) -> Result<(Vec<Record>, usize)> {
    if data.len() < 4 {
        return Err(AggregationError::InvalidFormat("Block too short".into()));
    }
    let len = (&data[..4]).get_u32_le() as usize;
    if data.len() < 4 + len {
        return Err(AggregationError::InvalidFormat("Incomplete block".into()));
    }
    let records = decode_body(&data[4..4 + len])?;
    Ok((records, 4 + len))
}

/// Read the next block from a reader, `None` at a clean end of input
pub fn read_block<R: Read>(reader: &mut R) -> Result<Option<Vec<Record>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(AggregationError::Corruption("Truncated block header".into()));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            AggregationError::Corruption("Truncated block".into())
        } else {
            AggregationError::Io(e)
        }
    })?;
    decode_body(&body).map(Some)
}

/// Check that a decoded record has the layout's shape
pub fn check_layout(schema: &RecordSchema, record: &Record) -> Result<()> {
    if record.key.len() != schema.keys().len() || record.measures.len() != schema.measures().len() {
        return Err(AggregationError::InvalidFormat(format!(
            "Record {} does not match layout {:?}/{:?}",
            record.key,
            schema.keys(),
            schema.measures()
        )));
    }
    for (ty, value) in schema.key_types().iter().zip(record.key.values()) {
        if !ty.accepts(value) {
            return Err(AggregationError::InvalidFormat(format!(
                "Key value {} is not of type {:?}",
                value, ty
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyValue, MeasureValue};

    fn records(n: i64) -> Vec<Record> {
        (0..n)
            .map(|i| {
                Record::new(
                    vec![KeyValue::Int(i), KeyValue::String(format!("site-{}", i % 3))],
                    vec![MeasureValue::Int(i * 10), MeasureValue::Null],
                )
            })
            .collect()
    }

    #[test]
    fn test_block_encoding() {
        let input = records(100);
        let encoded = encode_block(&input).unwrap();
        let (decoded, consumed) = decode_block(&encoded).unwrap();
        assert_eq!(decoded, input);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut encoded = encode_block(&records(10)).unwrap().to_vec();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xFF;
        let err = decode_block(&encoded).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_read_blocks_from_reader() {
        let mut data = Vec::new();
        data.extend_from_slice(&encode_block(&records(3)).unwrap());
        data.extend_from_slice(&encode_block(&records(5)).unwrap());

        let mut reader = std::io::Cursor::new(data.clone());
        assert_eq!(read_block(&mut reader).unwrap().unwrap().len(), 3);
        assert_eq!(read_block(&mut reader).unwrap().unwrap().len(), 5);
        assert!(read_block(&mut reader).unwrap().is_none());

        let mut truncated = std::io::Cursor::new(data[..data.len() - 3].to_vec());
        read_block(&mut truncated).unwrap();
        assert!(read_block(&mut truncated).is_err());
    }
}
