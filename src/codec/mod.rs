// Binary codec for spill pages.
//
// Zero-reflection, little-endian layout:
//   u32 rowCount
//   per row:  u16 fieldCount
//   per field: u16 keyLen, keyBytes, u8 typeTag, valueBytes
//
// Decoding is fully bounds-checked and returns `PageDecode` instead of
// panicking on truncated or corrupt input.

use crate::common::{Row, Value};
use crate::error::DbError;
use crate::Result;
use bytes::BufMut;

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
/// Legacy width-unspecified integer; accepted on decode as i64.
const TAG_INT: u8 = 2;
const TAG_INT32: u8 = 3;
const TAG_INT64: u8 = 4;
const TAG_FLOAT32: u8 = 5;
const TAG_FLOAT64: u8 = 6;
const TAG_STRING: u8 = 7;
const TAG_BYTES: u8 = 8;
const TAG_INSTANT: u8 = 9;
const TAG_VECTOR: u8 = 10;
const TAG_ARRAY: u8 = 11;
const TAG_MAP: u8 = 12;

/// Encode a sequence of rows into the page wire format.
pub fn encode_rows(rows: &[Row]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + rows.len() * 64);
    buf.put_u32_le(rows.len() as u32);
    for row in rows {
        buf.put_u16_le(row.len() as u16);
        for (key, value) in row {
            buf.put_u16_le(key.len() as u16);
            buf.put_slice(key.as_bytes());
            encode_value(&mut buf, value);
        }
    }
    buf
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.put_u8(TAG_NIL),
        Value::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(*b as u8);
        }
        Value::Int32(v) => {
            buf.put_u8(TAG_INT32);
            buf.put_i32_le(*v);
        }
        Value::Int64(v) => {
            buf.put_u8(TAG_INT64);
            buf.put_i64_le(*v);
        }
        Value::Float32(v) => {
            buf.put_u8(TAG_FLOAT32);
            buf.put_f32_le(*v);
        }
        Value::Float64(v) => {
            buf.put_u8(TAG_FLOAT64);
            buf.put_f64_le(*v);
        }
        Value::String(s) => {
            buf.put_u8(TAG_STRING);
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
        Value::Timestamp(ts) => {
            buf.put_u8(TAG_INSTANT);
            buf.put_i64_le(ts.timestamp_micros());
        }
        Value::Vector(v) => {
            buf.put_u8(TAG_VECTOR);
            buf.put_u32_le(v.len() as u32);
            for f in v {
                buf.put_f32_le(*f);
            }
        }
        Value::Array(items) => {
            buf.put_u8(TAG_ARRAY);
            buf.put_u32_le(items.len() as u32);
            for item in items {
                encode_value(buf, item);
            }
        }
        Value::Map(entries) => {
            buf.put_u8(TAG_MAP);
            buf.put_u32_le(entries.len() as u32);
            for (key, item) in entries {
                buf.put_u16_le(key.len() as u16);
                buf.put_slice(key.as_bytes());
                encode_value(buf, item);
            }
        }
    }
}

/// Decode a page buffer back into rows.
pub fn decode_rows(data: &[u8]) -> Result<Vec<Row>> {
    let mut reader = Reader::new(data);
    let row_count = reader.u32()? as usize;
    let mut rows = Vec::with_capacity(row_count.min(1 << 20));
    for _ in 0..row_count {
        let field_count = reader.u16()? as usize;
        let mut row = Row::with_capacity(field_count);
        for _ in 0..field_count {
            let key = reader.string16()?;
            let value = decode_value(&mut reader)?;
            row.insert(key, value);
        }
        rows.push(row);
    }
    if reader.remaining() != 0 {
        return Err(DbError::PageDecode(format!(
            "{} trailing bytes after last row",
            reader.remaining()
        )));
    }
    Ok(rows)
}

fn decode_value(reader: &mut Reader<'_>) -> Result<Value> {
    let tag = reader.u8()?;
    let value = match tag {
        TAG_NIL => Value::Null,
        TAG_BOOL => Value::Bool(reader.u8()? != 0),
        TAG_INT | TAG_INT64 => Value::Int64(reader.i64()?),
        TAG_INT32 => Value::Int32(reader.i32()?),
        TAG_FLOAT32 => Value::Float32(reader.f32()?),
        TAG_FLOAT64 => Value::Float64(reader.f64()?),
        TAG_STRING => {
            let len = reader.u32()? as usize;
            Value::String(reader.utf8(len)?)
        }
        TAG_BYTES => {
            let len = reader.u32()? as usize;
            Value::Bytes(reader.bytes(len)?.to_vec())
        }
        TAG_INSTANT => Value::timestamp_from_micros(reader.i64()?),
        TAG_VECTOR => {
            let len = reader.u32()? as usize;
            reader.need(len.checked_mul(4).ok_or_else(|| {
                DbError::PageDecode("vector length overflow".into())
            })?)?;
            let mut vector = Vec::with_capacity(len);
            for _ in 0..len {
                vector.push(reader.f32()?);
            }
            Value::Vector(vector)
        }
        TAG_ARRAY => {
            let len = reader.u32()? as usize;
            let mut items = Vec::with_capacity(len.min(1 << 16));
            for _ in 0..len {
                items.push(decode_value(reader)?);
            }
            Value::Array(items)
        }
        TAG_MAP => {
            let len = reader.u32()? as usize;
            let mut entries = std::collections::BTreeMap::new();
            for _ in 0..len {
                let key = reader.string16()?;
                entries.insert(key, decode_value(reader)?);
            }
            Value::Map(entries)
        }
        other => {
            return Err(DbError::PageDecode(format!("unknown type tag {}", other)));
        }
    };
    Ok(value)
}

/// Bounds-checked cursor over the page buffer.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(DbError::PageDecode(format!(
                "need {} bytes at offset {}, {} remaining",
                n,
                self.pos,
                self.remaining()
            )));
        }
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let b = self.bytes(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self) -> Result<f32> {
        let b = self.bytes(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64> {
        let b = self.bytes(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn utf8(&mut self, len: usize) -> Result<String> {
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DbError::PageDecode(format!("invalid utf-8: {}", e)))
    }

    fn string16(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        self.utf8(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn row_of(entries: Vec<(&str, Value)>) -> Row {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_round_trip_every_tag() {
        let mut map = BTreeMap::new();
        map.insert("inner".to_string(), Value::Int64(9));

        let rows = vec![row_of(vec![
            ("nil", Value::Null),
            ("flag", Value::Bool(true)),
            ("small", Value::Int32(-7)),
            ("big", Value::Int64(1 << 40)),
            ("ratio", Value::Float32(0.5)),
            ("pi", Value::Float64(3.14159)),
            ("name", Value::String("hello".into())),
            ("blob", Value::Bytes(vec![0, 1, 2, 255])),
            (
                "at",
                Value::Timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
            ),
            ("embedding", Value::Vector(vec![1.0, -2.0, 0.25])),
            (
                "tags",
                Value::Array(vec![Value::String("a".into()), Value::Int64(2)]),
            ),
            ("meta", Value::Map(map)),
        ])];

        let encoded = encode_rows(&rows);
        let decoded = decode_rows(&encoded).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_empty_row_set() {
        let encoded = encode_rows(&[]);
        let decoded = decode_rows(&encoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_legacy_int_tag() {
        // u32 rowCount=1, u16 fieldCount=1, u16 keyLen=1, "n", tag=2, i64
        let mut buf = Vec::new();
        buf.put_u32_le(1);
        buf.put_u16_le(1);
        buf.put_u16_le(1);
        buf.put_slice(b"n");
        buf.put_u8(TAG_INT);
        buf.put_i64_le(42);

        let decoded = decode_rows(&buf).unwrap();
        assert_eq!(decoded[0]["n"], Value::Int64(42));
    }

    #[test]
    fn test_unknown_tag() {
        let mut buf = Vec::new();
        buf.put_u32_le(1);
        buf.put_u16_le(1);
        buf.put_u16_le(1);
        buf.put_slice(b"x");
        buf.put_u8(200);

        let err = decode_rows(&buf).unwrap_err();
        assert!(matches!(err, DbError::PageDecode(_)));
    }

    #[test]
    fn test_truncated_input() {
        let rows = vec![row_of(vec![("name", Value::String("truncate me".into()))])];
        let encoded = encode_rows(&rows);

        for cut in 0..encoded.len() {
            // Every strict prefix must fail without panicking.
            assert!(
                decode_rows(&encoded[..cut]).is_err(),
                "prefix of {} bytes decoded unexpectedly",
                cut
            );
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let rows = vec![row_of(vec![("n", Value::Int64(1))])];
        let mut encoded = encode_rows(&rows);
        encoded.push(0xAB);
        assert!(decode_rows(&encoded).is_err());
    }
}
