//! Log record encoding.
//!
//! A serialized record is its 24-byte [`RecordMeta`] followed by the labels
//! section and the message bytes:
//!
//! ```text
//! timestamp i64 | record_size u32 | schema_version u16 | labels_count u16
//! | labels_size u32 | message_size u32 | labels... | message...
//! ```
//!
//! Each label is `tag u8 | key_len u16 | value_len u32 | key | value`.

use super::{le_i64, le_u16, le_u32, minute_of_day, DayKey};
use crate::error::{DenError, Result};
use std::fmt;
use std::io::Read;

/// Record metadata size in bytes.
pub const RECORD_META_SIZE: usize = 24;

/// Fixed part of an encoded label (tag + key length + value length).
pub const LABEL_HEADER_SIZE: usize = 7;

const TAG_STRING: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;

/// Fixed-size metadata preceding every serialized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Total serialized size: metadata, labels and message.
    pub record_size: u32,
    /// Schema version of the producer.
    pub schema_version: u16,
    /// Number of labels.
    pub labels_count: u16,
    /// Byte size of the labels section.
    pub labels_size: u32,
    /// Byte size of the message.
    pub message_size: u32,
}

impl RecordMeta {
    /// Serializes the metadata.
    pub fn to_bytes(&self) -> [u8; RECORD_META_SIZE] {
        let mut buf = [0u8; RECORD_META_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..12].copy_from_slice(&self.record_size.to_le_bytes());
        buf[12..14].copy_from_slice(&self.schema_version.to_le_bytes());
        buf[14..16].copy_from_slice(&self.labels_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.labels_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.message_size.to_le_bytes());
        buf
    }

    /// Parses metadata, checking that the sections add up to the record size.
    ///
    /// # Errors
    ///
    /// Returns `DenError::RecordSizeMismatch` if the declared total differs
    /// from the sum of the sections.
    pub fn from_bytes(buf: &[u8; RECORD_META_SIZE]) -> Result<Self> {
        let meta = Self {
            timestamp: le_i64(buf, 0),
            record_size: le_u32(buf, 8),
            schema_version: le_u16(buf, 12),
            labels_count: le_u16(buf, 14),
            labels_size: le_u32(buf, 16),
            message_size: le_u32(buf, 20),
        };
        let actual =
            RECORD_META_SIZE as u64 + meta.labels_size as u64 + meta.message_size as u64;
        if actual != meta.record_size as u64 {
            return Err(DenError::RecordSizeMismatch {
                declared: meta.record_size,
                actual,
            });
        }
        Ok(meta)
    }

    /// Reads metadata from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; RECORD_META_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }

    /// Minute-of-day of the record.
    pub fn minute(&self) -> u16 {
        minute_of_day(self.timestamp)
    }
}

/// Typed label value.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelValue {
    /// UTF-8 string.
    String(String),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
}

impl LabelValue {
    fn tag(&self) -> u8 {
        match self {
            Self::String(_) => TAG_STRING,
            Self::Int(_) => TAG_INT,
            Self::Float(_) => TAG_FLOAT,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::String(s) => s.len(),
            Self::Int(_) | Self::Float(_) => 8,
        }
    }

    /// Returns the string value, if this is a string label.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer label.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the float value, if this is a float label.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for LabelValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for LabelValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for LabelValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for LabelValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Key/value label attached to a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    /// Label key.
    pub key: String,
    /// Typed label value.
    pub value: LabelValue,
}

impl Label {
    /// Creates a label.
    pub fn new(key: impl Into<String>, value: impl Into<LabelValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Serialized size of the label.
    pub fn encoded_len(&self) -> usize {
        LABEL_HEADER_SIZE + self.key.len() + self.value.encoded_len()
    }

    /// Appends the encoded label to `buf`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::RecordTooLarge` if the key or value overflows its
    /// length field.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let key_len = u16::try_from(self.key.len())
            .map_err(|_| DenError::RecordTooLarge(format!("label key of {} bytes", self.key.len())))?;
        let value_len = u32::try_from(self.value.encoded_len()).map_err(|_| {
            DenError::RecordTooLarge(format!("label value of {} bytes", self.value.encoded_len()))
        })?;

        buf.push(self.value.tag());
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&value_len.to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        match &self.value {
            LabelValue::String(s) => buf.extend_from_slice(s.as_bytes()),
            LabelValue::Int(v) => buf.extend_from_slice(&v.to_le_bytes()),
            LabelValue::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
        }
        Ok(())
    }

    /// Decodes one label from the front of `buf`, returning it and the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidLabel` for truncated input, unknown tags,
    /// bad numeric widths or non-UTF-8 strings.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < LABEL_HEADER_SIZE {
            return Err(DenError::InvalidLabel(format!(
                "truncated label header: {} bytes",
                buf.len()
            )));
        }
        let tag = buf[0];
        let key_len = le_u16(buf, 1) as usize;
        let value_len = le_u32(buf, 3) as usize;
        let total = LABEL_HEADER_SIZE + key_len + value_len;
        if buf.len() < total {
            return Err(DenError::InvalidLabel(format!(
                "label needs {} bytes, {} available",
                total,
                buf.len()
            )));
        }

        let key_bytes = &buf[LABEL_HEADER_SIZE..LABEL_HEADER_SIZE + key_len];
        let raw = &buf[LABEL_HEADER_SIZE + key_len..total];
        let key = String::from_utf8(key_bytes.to_vec())
            .map_err(|e| DenError::InvalidLabel(format!("label key: {e}")))?;

        let value = match tag {
            TAG_STRING => LabelValue::String(
                String::from_utf8(raw.to_vec())
                    .map_err(|e| DenError::InvalidLabel(format!("label {key}: {e}")))?,
            ),
            TAG_INT | TAG_FLOAT => {
                let bytes: [u8; 8] = raw.try_into().map_err(|_| {
                    DenError::InvalidLabel(format!("label {key}: numeric value of {value_len} bytes"))
                })?;
                if tag == TAG_INT {
                    LabelValue::Int(i64::from_le_bytes(bytes))
                } else {
                    LabelValue::Float(f64::from_le_bytes(bytes))
                }
            }
            other => {
                return Err(DenError::InvalidLabel(format!(
                    "label {key}: unknown type tag {other}"
                )))
            }
        };

        Ok((Self { key, value }, total))
    }
}

/// Decodes a labels section holding exactly `count` labels.
pub fn decode_labels(buf: &[u8], count: u16) -> Result<Vec<Label>> {
    let mut labels = Vec::with_capacity(count as usize);
    let mut offset = 0;
    for _ in 0..count {
        let (label, used) = Label::decode(&buf[offset..])?;
        labels.push(label);
        offset += used;
    }
    if offset != buf.len() {
        return Err(DenError::InvalidLabel(format!(
            "{} trailing bytes after {} labels",
            buf.len() - offset,
            count
        )));
    }
    Ok(labels)
}

/// A timestamped log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Schema version of the producer.
    pub schema_version: u16,
    /// Ordered labels.
    pub labels: Vec<Label>,
    /// Opaque message body.
    pub message: Vec<u8>,
}

impl LogRecord {
    /// Creates a record without labels or message.
    pub fn new(timestamp: i64, schema_version: u16) -> Self {
        Self {
            timestamp,
            schema_version,
            labels: Vec::new(),
            message: Vec::new(),
        }
    }

    /// Appends a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<LabelValue>) -> Self {
        self.labels.push(Label::new(key, value));
        self
    }

    /// Sets the message body.
    pub fn with_message(mut self, message: impl Into<Vec<u8>>) -> Self {
        self.message = message.into();
        self
    }

    /// Returns the first label with the given key.
    pub fn label(&self, key: &str) -> Option<&LabelValue> {
        self.labels
            .iter()
            .find(|label| label.key == key)
            .map(|label| &label.value)
    }

    /// Day the record belongs to.
    pub fn day(&self) -> Result<DayKey> {
        DayKey::from_timestamp(self.timestamp)
    }

    /// Minute-of-day (page number) the record belongs to.
    pub fn minute(&self) -> u16 {
        minute_of_day(self.timestamp)
    }

    /// Byte size of the labels section.
    pub fn labels_size(&self) -> usize {
        self.labels.iter().map(Label::encoded_len).sum()
    }

    /// Total serialized size.
    pub fn encoded_len(&self) -> usize {
        RECORD_META_SIZE + self.labels_size() + self.message.len()
    }

    /// Builds the metadata describing this record.
    pub fn meta(&self) -> Result<RecordMeta> {
        let labels_count = u16::try_from(self.labels.len())
            .map_err(|_| DenError::RecordTooLarge(format!("{} labels", self.labels.len())))?;
        let labels_size = u32::try_from(self.labels_size())
            .map_err(|_| DenError::RecordTooLarge("labels section".to_string()))?;
        let message_size = u32::try_from(self.message.len())
            .map_err(|_| DenError::RecordTooLarge(format!("message of {} bytes", self.message.len())))?;
        let record_size = u32::try_from(self.encoded_len())
            .map_err(|_| DenError::RecordTooLarge(format!("record of {} bytes", self.encoded_len())))?;
        Ok(RecordMeta {
            timestamp: self.timestamp,
            record_size,
            schema_version: self.schema_version,
            labels_count,
            labels_size,
            message_size,
        })
    }

    /// Appends the serialized record to `buf`, returning its size.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<u32> {
        let meta = self.meta()?;
        buf.reserve(meta.record_size as usize);
        buf.extend_from_slice(&meta.to_bytes());
        for label in &self.labels {
            label.encode_into(buf)?;
        }
        buf.extend_from_slice(&self.message);
        Ok(meta.record_size)
    }

    /// Serializes the record into a new buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a record that occupies exactly `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_META_SIZE {
            return Err(DenError::RecordSizeMismatch {
                declared: 0,
                actual: bytes.len() as u64,
            });
        }
        let mut meta_buf = [0u8; RECORD_META_SIZE];
        meta_buf.copy_from_slice(&bytes[..RECORD_META_SIZE]);
        let meta = RecordMeta::from_bytes(&meta_buf)?;
        if meta.record_size as usize != bytes.len() {
            return Err(DenError::RecordSizeMismatch {
                declared: meta.record_size,
                actual: bytes.len() as u64,
            });
        }
        let labels_end = RECORD_META_SIZE + meta.labels_size as usize;
        let labels = decode_labels(&bytes[RECORD_META_SIZE..labels_end], meta.labels_count)?;
        Ok(Self {
            timestamp: meta.timestamp,
            schema_version: meta.schema_version,
            labels,
            message: bytes[labels_end..].to_vec(),
        })
    }

    /// Reads one record from a stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let meta = RecordMeta::read_from(reader)?;
        let mut labels_buf = vec![0u8; meta.labels_size as usize];
        reader.read_exact(&mut labels_buf)?;
        let mut message = vec![0u8; meta.message_size as usize];
        reader.read_exact(&mut message)?;
        Ok(Self {
            timestamp: meta.timestamp,
            schema_version: meta.schema_version,
            labels: decode_labels(&labels_buf, meta.labels_count)?,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogRecord {
        LogRecord::new(1_704_067_260, 3)
            .with_label("host", "web-01")
            .with_label("status", 404i64)
            .with_label("latency", 0.125f64)
            .with_message("GET /missing HTTP/1.1")
    }

    #[test]
    fn test_record_meta_roundtrip() {
        let meta = sample().meta().unwrap();
        let decoded = RecordMeta::from_bytes(&meta.to_bytes()).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.minute(), 1);
    }

    #[test]
    fn test_record_meta_size_mismatch() {
        let mut meta = sample().meta().unwrap();
        meta.record_size += 1;
        assert!(matches!(
            RecordMeta::from_bytes(&meta.to_bytes()),
            Err(DenError::RecordSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_label_roundtrip_each_type() {
        for label in [
            Label::new("path", "/index.html"),
            Label::new("bytes", -17i64),
            Label::new("ratio", 3.5f64),
            Label::new("", ""),
        ] {
            let mut buf = Vec::new();
            label.encode_into(&mut buf).unwrap();
            assert_eq!(buf.len(), label.encoded_len());
            let (decoded, used) = Label::decode(&buf).unwrap();
            assert_eq!(decoded, label);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_label_unknown_tag() {
        let mut buf = Vec::new();
        Label::new("k", "v").encode_into(&mut buf).unwrap();
        buf[0] = 99;
        assert!(matches!(Label::decode(&buf), Err(DenError::InvalidLabel(_))));
    }

    #[test]
    fn test_label_truncated() {
        let mut buf = Vec::new();
        Label::new("key", "value").encode_into(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(matches!(Label::decode(&buf), Err(DenError::InvalidLabel(_))));
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample();
        let bytes = record.to_bytes().unwrap();
        assert_eq!(bytes.len(), record.encoded_len());
        assert_eq!(LogRecord::decode(&bytes).unwrap(), record);
        assert_eq!(LogRecord::read_from(&mut bytes.as_slice()).unwrap(), record);
    }

    #[test]
    fn test_record_lookup_helpers() {
        let record = sample();
        assert_eq!(record.label("host").and_then(LabelValue::as_str), Some("web-01"));
        assert_eq!(record.label("status").and_then(LabelValue::as_int), Some(404));
        assert_eq!(record.label("missing"), None);
        assert_eq!(record.minute(), 1);
        assert_eq!(record.day().unwrap().to_string(), "2024-01-01");
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(
            LogRecord::decode(&bytes),
            Err(DenError::RecordSizeMismatch { .. })
        ));
    }
}
