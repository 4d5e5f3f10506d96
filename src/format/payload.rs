//! Materialized segment data
//!
//! A `Payload` is the decoded content of one segment over one sub-span.
//! Payloads can be sliced to a narrower span and appended to an adjacent
//! payload, which is what the decode cache uses to grow partial entries.

use crate::storage::{Tick, TimeSpan};
use serde::{Deserialize, Serialize};

/// A single irregular record (event line, metadata epoch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub time: Tick,
    pub text: String,
}

/// Decoded content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PayloadData {
    /// Regularly sampled values. `values[i]` sits at `first + i * period`.
    Samples {
        first: Tick,
        period: Tick,
        values: Vec<f64>,
    },
    /// Irregular records sorted by time
    Records(Vec<Record>),
}

/// Decoded content of a segment over `span`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub span: TimeSpan,
    pub data: PayloadData,
}

impl Payload {
    /// Sampled payload. `first` must be the first grid tick at or after `span.start`.
    pub fn samples(span: TimeSpan, first: Tick, period: Tick, values: Vec<f64>) -> Self {
        Self {
            span,
            data: PayloadData::Samples {
                first,
                period,
                values,
            },
        }
    }

    pub fn records(span: TimeSpan, records: Vec<Record>) -> Self {
        Self {
            span,
            data: PayloadData::Records(records),
        }
    }

    /// Approximate heap footprint, used for the cache byte budget
    pub fn byte_size(&self) -> usize {
        let base = std::mem::size_of::<Payload>();
        match &self.data {
            PayloadData::Samples { values, .. } => base + values.len() * std::mem::size_of::<f64>(),
            PayloadData::Records(records) => {
                base + records
                    .iter()
                    .map(|r| r.text.len() + std::mem::size_of::<Record>())
                    .sum::<usize>()
            }
        }
    }

    /// Number of samples or records
    pub fn len(&self) -> usize {
        match &self.data {
            PayloadData::Samples { values, .. } => values.len(),
            PayloadData::Records(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cut the payload down to `span`, which must lie inside `self.span`
    pub fn slice(&self, span: TimeSpan) -> Option<Payload> {
        if !self.span.contains_span(&span) {
            return None;
        }

        let data = match &self.data {
            PayloadData::Samples {
                first,
                period,
                values,
            } => {
                let index_at = |t: Tick| -> usize {
                    let offset = ceil_div(t - first, *period).max(0) as usize;
                    offset.min(values.len())
                };
                let i0 = index_at(span.start);
                let i1 = index_at(span.end);
                PayloadData::Samples {
                    first: first + i0 as Tick * period,
                    period: *period,
                    values: values[i0..i1.max(i0)].to_vec(),
                }
            }
            PayloadData::Records(records) => PayloadData::Records(
                records
                    .iter()
                    .filter(|r| span.contains(r.time))
                    .cloned()
                    .collect(),
            ),
        };

        Some(Payload { span, data })
    }

    /// Append a payload that starts where this one ends
    ///
    /// Returns the payload back unchanged if it is not adjacent or not on
    /// the same sample grid.
    pub fn append(&mut self, next: Payload) -> Result<(), Payload> {
        if self.span.end != next.span.start {
            return Err(next);
        }

        match (&mut self.data, next.data) {
            (
                PayloadData::Samples {
                    first,
                    period,
                    values,
                },
                PayloadData::Samples {
                    first: next_first,
                    period: next_period,
                    values: next_values,
                },
            ) => {
                let expected = *first + values.len() as Tick * *period;
                if *period != next_period || (next_first != expected && !next_values.is_empty()) {
                    return Err(Payload {
                        span: next.span,
                        data: PayloadData::Samples {
                            first: next_first,
                            period: next_period,
                            values: next_values,
                        },
                    });
                }
                values.extend(next_values);
            }
            (PayloadData::Records(records), PayloadData::Records(next_records)) => {
                records.extend(next_records);
            }
            (_, data) => {
                return Err(Payload {
                    span: next.span,
                    data,
                })
            }
        }

        self.span.end = next.span.end;
        Ok(())
    }
}

/// Integer division rounding toward positive infinity
fn ceil_div(a: Tick, b: Tick) -> Tick {
    let q = a / b;
    if a % b != 0 && ((a > 0) == (b > 0)) {
        q + 1
    } else {
        q
    }
}

/// Join ordered, adjacent payload pieces into as few payloads as possible
pub fn coalesce(pieces: Vec<Payload>) -> Vec<Payload> {
    let mut out: Vec<Payload> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match out.last_mut() {
            Some(last) => {
                if let Err(piece) = last.append(piece) {
                    out.push(piece);
                }
            }
            None => out.push(piece),
        }
    }
    out
}
