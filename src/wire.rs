//! Tagged message codec for coordinator/worker traffic
//!
//! A frame on a stream transport is a big-endian `u32` body length followed
//! by the body. The body starts with a one byte kind tag:
//!
//! | kind         | tag | payload |
//! |--------------|-----|---------|
//! | `HELLO`      | 0   | `u32 rank` |
//! | `DISPATCH`   | 1   | `i32 hour`, `u8 last`, `u32 count`, per record `u32 ts_len`, ts bytes, `u32 light_id`, `u32 cars_passed` |
//! | `SENTINEL`   | 2   | none |
//! | `REPORT`     | 3   | `i32 hour`, `u32 count`, per entry `u32 light_id`, `u64 count` |
//! | `REPORT_END` | 4   | none |
//!
//! An hour bucket larger than one frame travels as consecutive DISPATCH
//! chunks for the same hour; only the final chunk has `last = 1`.
//!
//! [`WireMessage::encode`] and [`WireMessage::decode`] work on bodies;
//! framing is left to the transport.

use crate::error::{Result, TrafficError};
use crate::model::{Hour, RankedEntry, TrafficEvent};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Largest body accepted on either side of a link
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Size of the length prefix in front of every body
pub const FRAME_HEADER_LEN: usize = 4;

/// DISPATCH body bytes before the first record
pub const DISPATCH_HEADER_LEN: usize = 10;

/// Message kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 0,
    Dispatch = 1,
    Sentinel = 2,
    Report = 3,
    ReportEnd = 4,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = TrafficError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(MessageKind::Hello),
            1 => Ok(MessageKind::Dispatch),
            2 => Ok(MessageKind::Sentinel),
            3 => Ok(MessageKind::Report),
            4 => Ok(MessageKind::ReportEnd),
            other => Err(TrafficError::Protocol(format!(
                "unknown message tag {}",
                other
            ))),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Hello => "HELLO",
            MessageKind::Dispatch => "DISPATCH",
            MessageKind::Sentinel => "SENTINEL",
            MessageKind::Report => "REPORT",
            MessageKind::ReportEnd => "REPORT_END",
        };
        f.write_str(name)
    }
}

/// One hour bucket, or one chunk of it, sent from the coordinator to its worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchMessage {
    pub hour: Hour,
    /// Final chunk of the bucket
    pub last: bool,
    pub records: Vec<TrafficEvent>,
}

impl DispatchMessage {
    /// A whole bucket in a single message
    pub fn new(hour: Hour, records: Vec<TrafficEvent>) -> Self {
        Self::chunk(hour, records, true)
    }

    pub fn chunk(hour: Hour, records: Vec<TrafficEvent>, last: bool) -> Self {
        Self {
            hour,
            last,
            records,
        }
    }

    /// Cut a bucket into chunks whose encoded body fits in `max_body` bytes.
    ///
    /// Record order is kept and every chunk holds at least one record, so a
    /// single record larger than `max_body` still gets its own chunk (and
    /// fails to encode if it exceeds [`MAX_FRAME_LEN`]). An empty bucket
    /// yields one empty final chunk.
    pub fn split(hour: Hour, records: Vec<TrafficEvent>, max_body: usize) -> Vec<Self> {
        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut body_len = DISPATCH_HEADER_LEN;

        for record in records {
            let len = encoded_record_len(&record);
            if !current.is_empty() && body_len + len > max_body {
                chunks.push(Self::chunk(hour, std::mem::take(&mut current), false));
                body_len = DISPATCH_HEADER_LEN;
            }
            body_len += len;
            current.push(record);
        }
        chunks.push(Self::chunk(hour, current, true));
        chunks
    }

    /// Sum of `cars_passed` over the bucket
    pub fn total_cars(&self) -> u64 {
        self.records.iter().map(|r| u64::from(r.cars_passed)).sum()
    }
}

/// Per-hour ranking sent back by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportMessage {
    pub hour: Hour,
    pub entries: Vec<RankedEntry>,
}

impl ReportMessage {
    pub fn new(hour: Hour, entries: Vec<RankedEntry>) -> Self {
        Self { hour, entries }
    }
}

/// Everything that travels between ranks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// TCP handshake carrying the sender's rank
    Hello { rank: u32 },
    Dispatch(DispatchMessage),
    /// No more buckets for this worker
    Sentinel,
    Report(ReportMessage),
    /// No more reports from this worker
    ReportEnd,
}

impl WireMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::Hello { .. } => MessageKind::Hello,
            WireMessage::Dispatch(_) => MessageKind::Dispatch,
            WireMessage::Sentinel => MessageKind::Sentinel,
            WireMessage::Report(_) => MessageKind::Report,
            WireMessage::ReportEnd => MessageKind::ReportEnd,
        }
    }

    /// Encode into a frame body (tag + payload)
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        buf.put_u8(self.kind().tag());

        match self {
            WireMessage::Hello { rank } => buf.put_u32(*rank),
            WireMessage::Dispatch(dispatch) => {
                buf.put_i32(i32::from(dispatch.hour.value()));
                buf.put_u8(u8::from(dispatch.last));
                buf.put_u32(len_u32(dispatch.records.len(), "record count")?);
                for record in &dispatch.records {
                    let timestamp = record.timestamp.as_bytes();
                    buf.put_u32(len_u32(timestamp.len(), "timestamp length")?);
                    buf.put_slice(timestamp);
                    buf.put_u32(record.light_id);
                    buf.put_u32(record.cars_passed);
                }
            }
            WireMessage::Report(report) => {
                buf.put_i32(i32::from(report.hour.value()));
                buf.put_u32(len_u32(report.entries.len(), "result count")?);
                for entry in &report.entries {
                    buf.put_u32(entry.light_id);
                    buf.put_u64(entry.count);
                }
            }
            WireMessage::Sentinel | WireMessage::ReportEnd => {}
        }

        if buf.len() > MAX_FRAME_LEN {
            return Err(TrafficError::Protocol(format!(
                "{} body of {} bytes exceeds the {} byte limit",
                self.kind(),
                buf.len(),
                MAX_FRAME_LEN
            )));
        }
        Ok(buf.freeze())
    }

    /// Decode a frame body produced by [`WireMessage::encode`]
    pub fn decode(mut body: Bytes) -> Result<Self> {
        if body.len() > MAX_FRAME_LEN {
            return Err(TrafficError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                body.len(),
                MAX_FRAME_LEN
            )));
        }
        ensure(&body, 1, "message tag")?;
        let kind = MessageKind::try_from(body.get_u8())?;

        let message = match kind {
            MessageKind::Hello => WireMessage::Hello {
                rank: get_u32(&mut body, "rank")?,
            },
            MessageKind::Dispatch => {
                let hour = get_hour(&mut body)?;
                ensure(&body, 1, "last flag")?;
                let last = match body.get_u8() {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(TrafficError::Protocol(format!(
                            "invalid last flag {}",
                            other
                        )))
                    }
                };
                let count = get_u32(&mut body, "record count")? as usize;
                // smallest record is 12 bytes
                let mut records = Vec::with_capacity(count.min(body.remaining() / 12));
                for _ in 0..count {
                    let ts_len = get_u32(&mut body, "timestamp length")? as usize;
                    ensure(&body, ts_len, "timestamp")?;
                    let timestamp = String::from_utf8(body.split_to(ts_len).to_vec())
                        .map_err(|_| TrafficError::Protocol("timestamp is not UTF-8".to_string()))?;
                    let light_id = get_u32(&mut body, "light_id")?;
                    let cars_passed = get_u32(&mut body, "cars_passed")?;
                    records.push(TrafficEvent {
                        timestamp,
                        light_id,
                        cars_passed,
                    });
                }
                WireMessage::Dispatch(DispatchMessage {
                    hour,
                    last,
                    records,
                })
            }
            MessageKind::Report => {
                let hour = get_hour(&mut body)?;
                let count = get_u32(&mut body, "result count")? as usize;
                let mut entries = Vec::with_capacity(count.min(body.remaining() / 12));
                for _ in 0..count {
                    let light_id = get_u32(&mut body, "light_id")?;
                    ensure(&body, 8, "count")?;
                    entries.push(RankedEntry::new(light_id, body.get_u64()));
                }
                WireMessage::Report(ReportMessage { hour, entries })
            }
            MessageKind::Sentinel => WireMessage::Sentinel,
            MessageKind::ReportEnd => WireMessage::ReportEnd,
        };

        if body.has_remaining() {
            return Err(TrafficError::Protocol(format!(
                "{} frame has {} trailing bytes",
                kind,
                body.remaining()
            )));
        }
        Ok(message)
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            WireMessage::Dispatch(dispatch) => {
                DISPATCH_HEADER_LEN
                    + dispatch
                        .records
                        .iter()
                        .map(encoded_record_len)
                        .sum::<usize>()
            }
            WireMessage::Report(report) => 9 + report.entries.len() * 12,
            _ => 5,
        }
    }
}

fn encoded_record_len(record: &TrafficEvent) -> usize {
    12 + record.timestamp.len()
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| TrafficError::Protocol(format!("{} {} does not fit in u32", what, len)))
}

fn ensure(body: &Bytes, needed: usize, what: &str) -> Result<()> {
    if body.remaining() < needed {
        return Err(TrafficError::Protocol(format!(
            "truncated frame: {} needs {} bytes, {} left",
            what,
            needed,
            body.remaining()
        )));
    }
    Ok(())
}

fn get_u32(body: &mut Bytes, what: &str) -> Result<u32> {
    ensure(body, 4, what)?;
    Ok(body.get_u32())
}

fn get_hour(body: &mut Bytes) -> Result<Hour> {
    ensure(body, 4, "hour")?;
    let raw = body.get_i32();
    u8::try_from(raw)
        .ok()
        .and_then(Hour::new)
        .ok_or_else(|| TrafficError::Protocol(format!("hour {} out of range", raw)))
}
