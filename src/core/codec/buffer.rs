//! Fixed binary buffer codec
//!
//! Metric `path` is a byte offset into the buffer (`byte.bit` for
//! booleans); values are read and written in the metric's endianness.
//! PDP fields are big-endian with the 16-bit word order swapped, so every
//! access reorders the field slice to big-endian first and then reads it
//! with one set of big-endian primitives.

use byteorder::{BigEndian, ByteOrder};
use tracing::warn;

use crate::core::metrics::Metric;
use crate::core::types::{word_swap, Endianness, MetricType, MetricValue};
use crate::utils::{EdgeSrvError, Result};

/// Encoded width of a fixed-buffer field, if the type has one.
pub fn field_width(ty: MetricType) -> Option<usize> {
    match ty {
        MetricType::Boolean | MetricType::Int8 | MetricType::UInt8 => Some(1),
        MetricType::Int16 | MetricType::UInt16 => Some(2),
        MetricType::Int32 | MetricType::UInt32 | MetricType::Float => Some(4),
        MetricType::Int64
        | MetricType::UInt64
        | MetricType::Double
        | MetricType::DateTime => Some(8),
        _ => None,
    }
}

/// Parse a path as `byte` or `byte.bit`.
fn parse_offset(path: &str) -> Result<(usize, u8)> {
    let path = path.trim();
    if let Some((byte, bit)) = path.split_once('.') {
        let byte = byte
            .parse()
            .map_err(|_| EdgeSrvError::decode(format!("bad byte offset {path:?}")))?;
        let bit = bit
            .parse()
            .map_err(|_| EdgeSrvError::decode(format!("bad bit offset {path:?}")))?;
        if bit > 7 {
            return Err(EdgeSrvError::decode(format!("bit offset out of range: {path:?}")));
        }
        Ok((byte, bit))
    } else {
        let byte = path
            .parse()
            .map_err(|_| EdgeSrvError::decode(format!("bad byte offset {path:?}")))?;
        Ok((byte, 0))
    }
}

fn field_slice(buf: &[u8], offset: usize, width: usize) -> Result<Vec<u8>> {
    if offset + width > buf.len() {
        return Err(EdgeSrvError::decode(format!(
            "field at offset {offset} width {width} exceeds buffer of {} bytes",
            buf.len()
        )));
    }
    Ok(buf[offset..offset + width].to_vec())
}

/// Read a typed value out of a buffer at the metric's byte offset,
/// honouring its endianness.
pub fn read_value(buf: &[u8], metric: &Metric) -> Result<MetricValue> {
    let ty = metric.metric_type;
    let endian = metric.properties.endianness;
    let (offset, bit) = parse_offset(&metric.properties.path)?;

    if ty == MetricType::Boolean {
        let byte = *buf
            .get(offset)
            .ok_or_else(|| EdgeSrvError::decode(format!("boolean offset {offset} out of range")))?;
        return Ok(MetricValue::Bool(byte & (1 << bit) != 0));
    }

    if ty.is_string_like() {
        if offset > buf.len() {
            return Err(EdgeSrvError::decode(format!("string offset {offset} out of range")));
        }
        let tail = &buf[offset..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        return Ok(MetricValue::String(
            String::from_utf8_lossy(&tail[..end]).into_owned(),
        ));
    }

    let width = field_width(ty)
        .ok_or_else(|| EdgeSrvError::decode(format!("type {ty} has no fixed-buffer form")))?;
    let mut field = field_slice(buf, offset, width)?;
    endian.reorder(&mut field);

    Ok(match ty {
        MetricType::Int8 => MetricValue::Int(field[0] as i8 as i64),
        MetricType::UInt8 => MetricValue::UInt(field[0] as u64),
        MetricType::Int16 => MetricValue::Int(BigEndian::read_i16(&field) as i64),
        MetricType::UInt16 => MetricValue::UInt(BigEndian::read_u16(&field) as u64),
        MetricType::Int32 => MetricValue::Int(BigEndian::read_i32(&field) as i64),
        MetricType::UInt32 => MetricValue::UInt(BigEndian::read_u32(&field) as u64),
        MetricType::Int64 => MetricValue::Int(BigEndian::read_i64(&field)),
        MetricType::UInt64 => MetricValue::UInt(BigEndian::read_u64(&field)),
        MetricType::DateTime => MetricValue::UInt(BigEndian::read_u64(&field)),
        MetricType::Float => MetricValue::Float(BigEndian::read_f32(&field) as f64),
        MetricType::Double => MetricValue::Float(BigEndian::read_f64(&field)),
        _ => unreachable!("width implies a numeric type"),
    })
}

/// Big-endian rendering of a metric value for its declared type.
fn value_to_be_bytes(metric: &Metric) -> Option<Vec<u8>> {
    let ty = metric.metric_type;
    let v = &metric.value;
    Some(match ty {
        MetricType::Int8 => vec![(v.as_i64()? as i8) as u8],
        MetricType::UInt8 => vec![v.as_u64()? as u8],
        MetricType::Int16 => (v.as_i64()? as i16).to_be_bytes().to_vec(),
        MetricType::UInt16 => (v.as_u64()? as u16).to_be_bytes().to_vec(),
        MetricType::Int32 => (v.as_i64()? as i32).to_be_bytes().to_vec(),
        MetricType::UInt32 => (v.as_u64()? as u32).to_be_bytes().to_vec(),
        MetricType::Int64 => v.as_i64()?.to_be_bytes().to_vec(),
        MetricType::UInt64 | MetricType::DateTime => v.as_u64()?.to_be_bytes().to_vec(),
        MetricType::Float => (v.as_f64()? as f32).to_be_bytes().to_vec(),
        MetricType::Double => v.as_f64()?.to_be_bytes().to_vec(),
        _ => return None,
    })
}

/// Concatenate the metrics into one buffer at their byte offsets.
///
/// Fields are laid out in their own endianness; PDP fields are written
/// big-endian and a single word swap over the whole buffer at the end
/// produces the PDP layout.
pub fn encode_all(metrics: &[Metric]) -> Result<Vec<u8>> {
    let mut size = 0usize;
    for m in metrics {
        let (offset, _) = parse_offset(&m.properties.path)?;
        let width = match m.metric_type {
            ty if ty.is_string_like() => m.value.as_string().len(),
            MetricType::Boolean => 1,
            ty => field_width(ty)
                .ok_or_else(|| EdgeSrvError::decode(format!("type {ty} has no fixed-buffer form")))?,
        };
        size = size.max(offset + width.max(1));
    }

    let mut buf = vec![0u8; size];
    let mut any_pdp = false;

    for m in metrics {
        let (offset, bit) = parse_offset(&m.properties.path)?;
        if m.value.is_null() {
            continue;
        }
        match m.metric_type {
            MetricType::Boolean => {
                if m.value.as_bool().unwrap_or(false) {
                    buf[offset] |= 1 << bit;
                } else {
                    buf[offset] &= !(1 << bit);
                }
            }
            ty if ty.is_string_like() => {
                let s = m.value.as_string();
                buf[offset..offset + s.len()].copy_from_slice(s.as_bytes());
            }
            _ => {
                let Some(mut field) = value_to_be_bytes(m) else {
                    warn!(metric = %m.name, "value not encodable as {}", m.metric_type);
                    continue;
                };
                match m.properties.endianness {
                    Endianness::Little => field.reverse(),
                    Endianness::Pdp => any_pdp = true,
                    Endianness::Big => {}
                }
                buf[offset..offset + field.len()].copy_from_slice(&field);
            }
        }
    }

    if any_pdp {
        word_swap(&mut buf);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(ty: MetricType, path: &str, endian: Endianness) -> Metric {
        let mut m = Metric::new("t", ty);
        m.properties.method = "GET".into();
        m.properties.address = "buf".into();
        m.properties.path = path.into();
        m.properties.endianness = endian;
        m
    }

    #[test]
    fn test_pdp_u32_decode() {
        let m = metric(MetricType::UInt32, "0", Endianness::Pdp);
        let value = read_value(&[0x01, 0x02, 0x03, 0x04], &m).unwrap();
        assert_eq!(value, MetricValue::UInt(0x0304_0102));
    }

    #[test]
    fn test_little_endian_decode() {
        let m = metric(MetricType::UInt16, "1", Endianness::Little);
        let value = read_value(&[0x00, 0x34, 0x12], &m).unwrap();
        assert_eq!(value, MetricValue::UInt(0x1234));
    }

    #[test]
    fn test_boolean_bit_offset() {
        let m = metric(MetricType::Boolean, "1.3", Endianness::Big);
        assert_eq!(read_value(&[0x00, 0b0000_1000], &m).unwrap(), MetricValue::Bool(true));
        assert_eq!(read_value(&[0x00, 0b0000_0000], &m).unwrap(), MetricValue::Bool(false));
    }

    #[test]
    fn test_out_of_range_is_error() {
        let m = metric(MetricType::UInt32, "2", Endianness::Big);
        assert!(read_value(&[0x00, 0x01, 0x02], &m).is_err());
    }

    #[test]
    fn test_round_trip_all_widths_and_endians() {
        let cases: Vec<(MetricType, MetricValue)> = vec![
            (MetricType::Int8, MetricValue::Int(-5)),
            (MetricType::UInt8, MetricValue::UInt(200)),
            (MetricType::Int16, MetricValue::Int(-12345)),
            (MetricType::UInt16, MetricValue::UInt(54321)),
            (MetricType::Int32, MetricValue::Int(-1_000_000)),
            (MetricType::UInt32, MetricValue::UInt(3_000_000_000)),
            (MetricType::Int64, MetricValue::Int(-9_000_000_000)),
            (MetricType::UInt64, MetricValue::UInt(18_000_000_000)),
            (MetricType::DateTime, MetricValue::UInt(1_700_000_000_000)),
            (MetricType::Float, MetricValue::Float(1.5)),
            (MetricType::Double, MetricValue::Float(-2.25)),
        ];
        for endian in [Endianness::Big, Endianness::Little, Endianness::Pdp] {
            for (ty, value) in &cases {
                let mut m = metric(*ty, "0", endian);
                m.value = value.clone();
                let buf = encode_all(std::slice::from_ref(&m)).unwrap();
                let back = read_value(&buf, &m).unwrap();
                assert_eq!(&back, value, "{ty} {endian:?}");
            }
        }
    }

    #[test]
    fn test_string_nul_terminated() {
        let m = metric(MetricType::String, "2", Endianness::Big);
        let value = read_value(b"xxABC\0yy", &m).unwrap();
        assert_eq!(value, MetricValue::String("ABC".into()));
    }
}
