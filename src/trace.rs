//! Trace-line decoding for the two accepted input formats.

use clap::ValueEnum;

/// One memory reference from a trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    pub address: u64,
    pub write: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum, Debug)]
#[clap(rename_all = "verbatim")]
pub enum TraceFormat {
    /// `<op> <hex-address> ...`; an op starting with `W` is a write and a
    /// line starting with `#eof` terminates the stream.
    Hex,
    /// Whitespace-tokenized with a decimal address in the third-from-last
    /// token; the literal word `Write` anywhere marks a write.
    Memtrace,
}

/// A line the selected format cannot decode. How to react is the driver's
/// call, not the simulator's.
#[derive(Debug, thiserror::Error)]
#[error("malformed trace line: {line:?}")]
pub struct MalformedTrace {
    pub line: String,
}

/// Decodes one trace line; `Ok(None)` signals end of stream.
pub fn parse_line(format: TraceFormat, line: &str) -> Result<Option<Access>, MalformedTrace> {
    let malformed = || MalformedTrace {
        line: line.to_string(),
    };
    match format {
        TraceFormat::Hex => {
            if line.starts_with("#eof") {
                return Ok(None);
            }
            let mut fields = line.split_whitespace();
            let op = fields.next().ok_or_else(malformed)?;
            let address = fields
                .next()
                .map(|f| f.strip_prefix("0x").unwrap_or(f))
                .and_then(|f| u64::from_str_radix(f, 16).ok())
                .ok_or_else(malformed)?;
            Ok(Some(Access {
                address,
                write: op.starts_with('W'),
            }))
        }
        TraceFormat::Memtrace => {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 3 {
                return Err(malformed());
            }
            let address = tokens[tokens.len() - 3]
                .parse::<u64>()
                .map_err(|_| malformed())?;
            Ok(Some(Access {
                address,
                write: line.contains("Write"),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_lines_decode_op_and_address() {
        assert_eq!(
            parse_line(TraceFormat::Hex, "W 7fff0040 extra").unwrap(),
            Some(Access {
                address: 0x7fff0040,
                write: true,
            })
        );
        assert_eq!(
            parse_line(TraceFormat::Hex, "R 0x1000").unwrap(),
            Some(Access {
                address: 0x1000,
                write: false,
            })
        );
    }

    #[test]
    fn hex_stream_terminates_on_eof_marker() {
        assert_eq!(parse_line(TraceFormat::Hex, "#eof").unwrap(), None);
        assert_eq!(parse_line(TraceFormat::Hex, "#eof trailing").unwrap(), None);
    }

    #[test]
    fn hex_rejects_unparseable_lines() {
        assert!(parse_line(TraceFormat::Hex, "").is_err());
        assert!(parse_line(TraceFormat::Hex, "R").is_err());
        assert!(parse_line(TraceFormat::Hex, "R not-hex").is_err());
    }

    #[test]
    fn memtrace_takes_decimal_address_and_write_keyword() {
        let line = "12 core0 Write 8192 0 1";
        assert_eq!(
            parse_line(TraceFormat::Memtrace, line).unwrap(),
            Some(Access {
                address: 8192,
                write: true,
            })
        );
        let line = "12 core0 Read 8192 0 1";
        assert_eq!(
            parse_line(TraceFormat::Memtrace, line).unwrap(),
            Some(Access {
                address: 8192,
                write: false,
            })
        );
    }

    #[test]
    fn memtrace_rejects_short_or_non_decimal_lines() {
        assert!(parse_line(TraceFormat::Memtrace, "1 2").is_err());
        assert!(parse_line(TraceFormat::Memtrace, "a b c d").is_err());
    }
}
