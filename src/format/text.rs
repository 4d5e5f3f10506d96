//! Text trace format
//!
//! A small line-oriented format used as the built-in reference adapter.
//!
//! ```text
//! %TRACE
//! # comment
//! @ GE.APE..BHZ start=0 period=10000000      ← waveform block header
//! 0.25                                       ← one sample per line
//! 0.31
//! ! GE.APE..PICK time=1500000000 P onset     ← event (instant record)
//! $ GE.APE..BHZ start=0 end=86400000000000 STS-2   ← channel epoch
//! ```
//!
//! Each `@` block, `!` line and `$` line becomes one segment whose offset
//! hints point at the exact bytes of that block.

use super::{DecodeError, FormatAdapter, HeaderEntry, Payload, Record};
use crate::storage::{ChannelId, ChannelIdentity, DataKind, OffsetHints, Tick, TimeSpan};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{all_consuming, map, map_opt, map_res, opt, recognize, rest},
    sequence::{pair, preceded, tuple},
    IResult,
};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Kind name of the text trace format
pub const TEXT_TRACE_KIND: &str = "text_trace";

const MAGIC: &str = "%TRACE";

/// Built-in adapter for the text trace format
#[derive(Debug, Default, Clone, Copy)]
pub struct TextTraceAdapter;

impl TextTraceAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl FormatAdapter for TextTraceAdapter {
    fn kind(&self) -> &str {
        TEXT_TRACE_KIND
    }

    fn recognizes(&self, path: &Path) -> bool {
        let mut head = [0u8; MAGIC.len()];
        match File::open(path).and_then(|mut f| f.read_exact(&mut head)) {
            Ok(()) => head == MAGIC.as_bytes(),
            Err(_) => false,
        }
    }

    fn read_headers(&self, path: &Path) -> Result<Vec<HeaderEntry>, DecodeError> {
        let text = std::fs::read_to_string(path)?;
        let blocks = parse_blocks(&text, true)?;

        Ok(blocks
            .into_iter()
            .map(|block| HeaderEntry {
                identity: block.identity,
                span: block.span,
                sample_period: block.sample_period,
                hints: OffsetHints::new(block.offset as u64, block.len as u64),
            })
            .collect())
    }

    fn read_payload(
        &self,
        path: &Path,
        hints: &OffsetHints,
        span: TimeSpan,
    ) -> Result<Payload, DecodeError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(hints.byte_offset))?;
        let mut buf = vec![0u8; hints.byte_len as usize];
        file.read_exact(&mut buf)?;

        let text = String::from_utf8(buf).map_err(|e| DecodeError::Parse {
            line: 0,
            message: e.to_string(),
        })?;

        let block = parse_blocks(&text, false)?
            .into_iter()
            .next()
            .ok_or_else(|| DecodeError::Parse {
                line: 0,
                message: "offset hints point at an empty block".to_string(),
            })?;

        block
            .into_payload()
            .slice(span)
            .ok_or(DecodeError::OutOfRange(span))
    }
}

/// One parsed segment with its byte location
#[derive(Debug)]
struct Block {
    identity: ChannelIdentity,
    span: TimeSpan,
    sample_period: Option<Tick>,
    offset: usize,
    len: usize,
    content: BlockContent,
}

#[derive(Debug)]
enum BlockContent {
    Samples(Vec<f64>),
    Record(Tick, String),
}

impl Block {
    fn into_payload(self) -> Payload {
        match self.content {
            BlockContent::Samples(values) => Payload::samples(
                self.span,
                self.span.start,
                self.sample_period.unwrap_or(1),
                values,
            ),
            BlockContent::Record(time, text) => {
                Payload::records(self.span, vec![Record { time, text }])
            }
        }
    }
}

/// A header line of the format
#[derive(Debug, PartialEq)]
enum Line<'a> {
    Waveform {
        codes: ChannelId,
        start: Tick,
        period: Tick,
    },
    Event {
        codes: ChannelId,
        time: Tick,
        text: &'a str,
    },
    Epoch {
        codes: ChannelId,
        start: Tick,
        end: Tick,
        text: &'a str,
    },
}

/// Block being accumulated while walking the lines
struct OpenWaveform {
    codes: ChannelId,
    start: Tick,
    period: Tick,
    offset: usize,
    end: usize,
    values: Vec<f64>,
}

impl OpenWaveform {
    fn finish(self) -> Option<Block> {
        let n = self.values.len() as Tick;
        let end = self.start.checked_add(n.checked_mul(self.period)?)?;
        let span = TimeSpan::try_new(self.start, end)?;
        Some(Block {
            identity: ChannelIdentity::waveform(self.codes),
            span,
            sample_period: Some(self.period),
            offset: self.offset,
            len: self.end - self.offset,
            content: BlockContent::Samples(self.values),
        })
    }
}

fn parse_blocks(text: &str, require_magic: bool) -> Result<Vec<Block>, DecodeError> {
    let mut blocks = Vec::new();
    let mut open: Option<OpenWaveform> = None;
    let mut offset = 0usize;

    for (line_no, raw) in text.split_inclusive('\n').enumerate() {
        let line_start = offset;
        offset += raw.len();
        let line = raw.trim_end();

        if line_no == 0 && require_magic {
            if line != MAGIC {
                return Err(DecodeError::Parse {
                    line: 1,
                    message: format!("missing {} magic", MAGIC),
                });
            }
            continue;
        }

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parse_error = |message: String| DecodeError::Parse {
            line: line_no + 1,
            message,
        };

        if line.starts_with(['@', '!', '$']) {
            if let Some(block) = open.take().and_then(OpenWaveform::finish) {
                blocks.push(block);
            }

            let (_, parsed) = parse_line(line)
                .map_err(|e| parse_error(format!("bad header line: {:?}", e)))?;

            match parsed {
                Line::Waveform {
                    codes,
                    start,
                    period,
                } => {
                    if period <= 0 {
                        return Err(parse_error(format!("non-positive period {}", period)));
                    }
                    open = Some(OpenWaveform {
                        codes,
                        start,
                        period,
                        offset: line_start,
                        end: offset,
                        values: Vec::new(),
                    });
                }
                Line::Event { codes, time, text } => blocks.push(Block {
                    identity: ChannelIdentity::new(DataKind::Event, codes),
                    span: TimeSpan::instant(time),
                    sample_period: None,
                    offset: line_start,
                    len: raw.len(),
                    content: BlockContent::Record(time, text.to_string()),
                }),
                Line::Epoch {
                    codes,
                    start,
                    end,
                    text,
                } => {
                    let span = TimeSpan::try_new(start, end)
                        .ok_or_else(|| parse_error(format!("empty epoch [{}, {})", start, end)))?;
                    blocks.push(Block {
                        identity: ChannelIdentity::new(DataKind::Channel, codes),
                        span,
                        sample_period: None,
                        offset: line_start,
                        len: raw.len(),
                        content: BlockContent::Record(start, text.to_string()),
                    });
                }
            }
            continue;
        }

        match open.as_mut() {
            Some(block) => {
                let value: f64 = line
                    .trim()
                    .parse()
                    .map_err(|_| parse_error(format!("bad sample value '{}'", line)))?;
                block.values.push(value);
                block.end = offset;
            }
            None => return Err(parse_error("sample outside of a waveform block".to_string())),
        }
    }

    if let Some(block) = open.take().and_then(OpenWaveform::finish) {
        blocks.push(block);
    }

    Ok(blocks)
}

fn parse_line(input: &str) -> IResult<&str, Line<'_>> {
    all_consuming(alt((waveform_line, event_line, epoch_line)))(input)
}

fn codes(input: &str) -> IResult<&str, ChannelId> {
    map_opt(take_while1(|c: char| !c.is_whitespace()), ChannelId::parse)(input)
}

fn tick(input: &str) -> IResult<&str, Tick> {
    map_res(recognize(pair(opt(char('-')), digit1)), str::parse::<Tick>)(input)
}

fn field<'a>(name: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, Tick> {
    preceded(pair(tag(name), char('=')), tick)
}

fn trailing_text(input: &str) -> IResult<&str, &str> {
    map(opt(preceded(space1, rest)), |t: Option<&str>| {
        t.map(str::trim).unwrap_or("")
    })(input)
}

fn waveform_line(input: &str) -> IResult<&str, Line<'_>> {
    map(
        tuple((
            char('@'),
            space1,
            codes,
            space1,
            field("start"),
            space1,
            field("period"),
            space0,
        )),
        |(_, _, codes, _, start, _, period, _)| Line::Waveform {
            codes,
            start,
            period,
        },
    )(input)
}

fn event_line(input: &str) -> IResult<&str, Line<'_>> {
    map(
        tuple((char('!'), space1, codes, space1, field("time"), trailing_text)),
        |(_, _, codes, _, time, text)| Line::Event { codes, time, text },
    )(input)
}

fn epoch_line(input: &str) -> IResult<&str, Line<'_>> {
    map(
        tuple((
            char('$'),
            space1,
            codes,
            space1,
            field("start"),
            space1,
            field("end"),
            trailing_text,
        )),
        |(_, _, codes, _, start, _, end, text)| Line::Epoch {
            codes,
            start,
            end,
            text,
        },
    )(input)
}

/// Render samples as a text trace block. Used by tests and benches to build archives.
pub fn render_waveform(codes: &ChannelId, start: Tick, period: Tick, values: &[f64]) -> String {
    let mut out = format!("@ {} start={} period={}\n", codes, start, period);
    for v in values {
        out.push_str(&v.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PayloadData;
    use tempfile::tempdir;

    fn sample_file() -> String {
        let codes = ChannelId::new("GE", "APE", "", "BHZ");
        let mut text = String::from("%TRACE\n# test archive\n");
        text.push_str(&render_waveform(&codes, 0, 10, &[1.0, 2.0, 3.0, 4.0]));
        text.push_str("! GE.APE..PICK time=25 P onset\n");
        text.push_str(&render_waveform(&codes, 100, 10, &[5.0, 6.0]));
        text.push_str("$ GE.APE..BHZ start=0 end=1000 STS-2\n");
        text
    }

    #[test]
    fn test_parse_line() {
        let (_, line) = parse_line("@ GE.APE..BHZ start=-5 period=2").unwrap();
        assert_eq!(
            line,
            Line::Waveform {
                codes: ChannelId::new("GE", "APE", "", "BHZ"),
                start: -5,
                period: 2
            }
        );

        let (_, line) = parse_line("! GE.APE..PICK time=7").unwrap();
        assert!(matches!(line, Line::Event { time: 7, text: "", .. }));

        assert!(parse_line("@ GE.APE start=0 period=1").is_err());
        assert!(parse_line("@ GE.APE..BHZ start=x period=1").is_err());
    }

    #[test]
    fn test_read_headers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.trace");
        std::fs::write(&path, sample_file()).unwrap();

        let adapter = TextTraceAdapter::new();
        assert!(adapter.recognizes(&path));

        let headers = adapter.read_headers(&path).unwrap();
        assert_eq!(headers.len(), 4);

        assert_eq!(headers[0].identity.kind, DataKind::Waveform);
        assert_eq!(headers[0].span, TimeSpan::new(0, 40));
        assert_eq!(headers[0].sample_period, Some(10));

        assert_eq!(headers[1].identity.kind, DataKind::Event);
        assert_eq!(headers[1].span, TimeSpan::instant(25));

        assert_eq!(headers[2].span, TimeSpan::new(100, 120));
        assert_eq!(headers[3].identity.kind, DataKind::Channel);
    }

    #[test]
    fn test_read_payload_uses_hints() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.trace");
        std::fs::write(&path, sample_file()).unwrap();

        let adapter = TextTraceAdapter::new();
        let headers = adapter.read_headers(&path).unwrap();

        let payload = adapter
            .read_payload(&path, &headers[2].hints, TimeSpan::new(110, 120))
            .unwrap();
        match payload.data {
            PayloadData::Samples { first, values, .. } => {
                assert_eq!(first, 110);
                assert_eq!(values, vec![6.0]);
            }
            _ => panic!("expected samples"),
        }

        let event = adapter
            .read_payload(&path, &headers[1].hints, headers[1].span)
            .unwrap();
        match event.data {
            PayloadData::Records(records) => assert_eq!(records[0].text, "P onset"),
            _ => panic!("expected records"),
        }

        let err = adapter
            .read_payload(&path, &headers[0].hints, TimeSpan::new(30, 50))
            .unwrap_err();
        assert!(matches!(err, DecodeError::OutOfRange(_)));
    }

    #[test]
    fn test_rejects_bad_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.trace");
        std::fs::write(&path, "%TRACE\n@ GE.APE..BHZ start=0 period=1\nnot-a-number\n").unwrap();

        let err = TextTraceAdapter::new().read_headers(&path).unwrap_err();
        assert!(matches!(err, DecodeError::Parse { line: 3, .. }));

        std::fs::write(&path, "hello\n").unwrap();
        assert!(!TextTraceAdapter::new().recognizes(&path));
    }
}
