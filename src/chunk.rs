//! Chunks: the opaque, time-ordered sample payload of a series.
//!
//! The rewrite path relays chunk bytes verbatim. Samples are only decoded when
//! two series are merged and their chunks overlap in time.
//!
//! Payload layout: `uvarint(count)`, `varint(t0)`, `f64 bits(v0)` followed, for
//! every further sample, by `varint(delta-of-delta)` and
//! `uvarint(value bits XOR previous bits)`. XOR of neighbouring values shares
//! the high bits, so the varint stays short for slowly changing series.

use crate::{DataPoint, RelabelError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound of samples in a chunk produced by [`merge_chunks`].
pub const MAX_SAMPLES_PER_CHUNK: usize = 120;

/// A chunk of samples with its time bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Timestamp of the first sample (inclusive).
    pub min_time: i64,
    /// Timestamp of the last sample (inclusive).
    pub max_time: i64,
    /// Number of samples encoded in `data`.
    pub num_samples: u32,
    /// Encoded samples.
    pub data: Vec<u8>,
}

impl Chunk {
    /// Encodes points into a chunk. Timestamps must be strictly increasing.
    pub fn encode(points: &[DataPoint]) -> Result<Self> {
        let (first, last) = match (points.first(), points.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(RelabelError::InvalidConfiguration(
                    "cannot encode an empty chunk".to_string(),
                ));
            }
        };
        if points.windows(2).any(|w| w[1].timestamp <= w[0].timestamp) {
            return Err(RelabelError::InvalidConfiguration(
                "chunk timestamps must be strictly increasing".to_string(),
            ));
        }

        let mut data = Vec::with_capacity(points.len() * 4 + 16);
        put_uvarint(&mut data, points.len() as u64);
        put_varint(&mut data, first.timestamp);
        data.extend_from_slice(&first.value.to_bits().to_le_bytes());

        let mut prev_t = first.timestamp;
        let mut prev_delta = 0i64;
        let mut prev_bits = first.value.to_bits();
        for point in &points[1..] {
            let delta = point.timestamp - prev_t;
            put_varint(&mut data, delta - prev_delta);
            let bits = point.value.to_bits();
            put_uvarint(&mut data, bits ^ prev_bits);

            prev_t = point.timestamp;
            prev_delta = delta;
            prev_bits = bits;
        }

        Ok(Self {
            min_time: first.timestamp,
            max_time: last.timestamp,
            num_samples: points.len() as u32,
            data,
        })
    }

    /// Decodes all samples of the chunk.
    pub fn decode(&self) -> Result<Vec<DataPoint>> {
        let mut reader = ByteReader::new(&self.data);
        let count = reader.uvarint()? as usize;
        if count != self.num_samples as usize {
            return Err(RelabelError::DataCorruption(format!(
                "chunk header declares {} samples, payload holds {count}",
                self.num_samples
            )));
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        // Every sample takes at least one byte, so the payload bounds the count.
        let mut points = Vec::with_capacity(count.min(self.data.len()));
        let mut t = reader.varint()?;
        let mut bits = reader.u64_le()?;
        points.push(DataPoint::new(t, f64::from_bits(bits)));

        let mut delta = 0i64;
        for _ in 1..count {
            delta = delta
                .checked_add(reader.varint()?)
                .ok_or_else(|| timestamp_overflow(t))?;
            t = t.checked_add(delta).ok_or_else(|| timestamp_overflow(t))?;
            bits ^= reader.uvarint()?;
            points.push(DataPoint::new(t, f64::from_bits(bits)));
        }

        if !reader.is_empty() {
            return Err(RelabelError::DataCorruption(format!(
                "{} trailing bytes after chunk samples",
                reader.remaining()
            )));
        }
        Ok(points)
    }
}

fn timestamp_overflow(after: i64) -> RelabelError {
    RelabelError::DataCorruption(format!("chunk timestamp overflows after {after}"))
}

/// Merges the chunks of several series into one time-ordered chunk list.
///
/// Chunks that do not overlap any other are kept as they are. Overlapping
/// chunks are decoded and their samples merged; on equal timestamps the
/// sample from the chunk that came first in `chunks` wins.
pub fn merge_chunks(chunks: Vec<Chunk>) -> Result<Vec<Chunk>> {
    let mut ordered: Vec<(usize, Chunk)> = chunks.into_iter().enumerate().collect();
    ordered.sort_by_key(|(seq, c)| (c.min_time, *seq));

    let mut merged = Vec::with_capacity(ordered.len());
    let mut group: Vec<(usize, Chunk)> = Vec::new();
    let mut group_max = i64::MIN;

    for (seq, chunk) in ordered {
        if !group.is_empty() && chunk.min_time > group_max {
            flush_group(&mut group, &mut merged)?;
        }
        group_max = if group.is_empty() {
            chunk.max_time
        } else {
            group_max.max(chunk.max_time)
        };
        group.push((seq, chunk));
    }
    flush_group(&mut group, &mut merged)?;

    Ok(merged)
}

fn flush_group(group: &mut Vec<(usize, Chunk)>, out: &mut Vec<Chunk>) -> Result<()> {
    if group.len() <= 1 {
        out.extend(group.drain(..).map(|(_, c)| c));
        return Ok(());
    }

    let mut samples = Vec::new();
    for (seq, chunk) in group.drain(..) {
        for point in chunk.decode()? {
            samples.push((point.timestamp, seq, point.value));
        }
    }
    samples.sort_by_key(|&(ts, seq, _)| (ts, seq));
    samples.dedup_by_key(|&mut (ts, _, _)| ts);

    let points: Vec<DataPoint> = samples
        .into_iter()
        .map(|(ts, _, value)| DataPoint::new(ts, value))
        .collect();
    for part in points.chunks(MAX_SAMPLES_PER_CHUNK) {
        out.push(Chunk::encode(part)?);
    }
    Ok(())
}

/// Encodes a signed integer as zigzag varint.
fn put_varint(buf: &mut Vec<u8>, value: i64) {
    let uvalue = ((value << 1) ^ (value >> 63)) as u64;
    put_uvarint(buf, uvalue);
}

/// Encodes an unsigned integer as varint.
fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn uvarint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;

        loop {
            let byte = *self.data.get(self.pos).ok_or_else(|| {
                RelabelError::DataCorruption("truncated varint in chunk".to_string())
            })?;
            self.pos += 1;
            if shift >= 64 {
                return Err(RelabelError::DataCorruption(
                    "varint overflow in chunk".to_string(),
                ));
            }
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    fn varint(&mut self) -> Result<i64> {
        let result = self.uvarint()?;
        // Zigzag decode
        Ok(((result >> 1) as i64) ^ -((result & 1) as i64))
    }

    fn u64_le(&mut self) -> Result<u64> {
        let end = self.pos + 8;
        let bytes = self.data.get(self.pos..end).ok_or_else(|| {
            RelabelError::DataCorruption("truncated value in chunk".to_string())
        })?;
        self.pos = end;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
