//! Observers of finished code.

use std::fmt::Write as _;
use std::io::Write;

use log::{debug, warn};

use crate::ir::SourceLoc;

/// A resolved function, as shown to a [`DiagnosticsSink`].
#[derive(Debug, Clone, Copy)]
pub struct EmittedCode<'a> {
    pub name: &'a str,
    /// Address of the first instruction.
    pub address: u64,
    pub code: &'a [u8],
    pub debug_locs: &'a [(usize, SourceLoc)],
}

/// Receives each function once its relocations are patched.
pub trait DiagnosticsSink: Send {
    fn code_emitted(&mut self, code: &EmittedCode<'_>);
}

pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn code_emitted(&mut self, _code: &EmittedCode<'_>) {}
}

/// Logs a one-line summary per function at debug level.
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn code_emitted(&mut self, code: &EmittedCode<'_>) {
        debug!(
            "JIT: '{}' {} bytes @ {:#x}",
            code.name,
            code.code.len(),
            code.address
        );
    }
}

/// Writes a hex dump of every function to `W`.
pub struct HexDump<W> {
    out: W,
}

impl<W: Write> HexDump<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> DiagnosticsSink for HexDump<W> {
    fn code_emitted(&mut self, code: &EmittedCode<'_>) {
        let text = format!(
            "{} @ {:#x} ({} bytes):\n{}",
            code.name,
            code.address,
            code.code.len(),
            hex_dump(code.address, code.code)
        );
        if let Err(err) = self.out.write_all(text.as_bytes()) {
            warn!("hex dump of '{}' failed: {}", code.name, err);
        }
    }
}

/// 16 bytes per line, each line prefixed with its address.
pub fn hex_dump(address: u64, bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "  {:016x}:", address + (i * 16) as u64);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_format() {
        let bytes: Vec<u8> = (0..18).collect();
        let dump = hex_dump(0x1000, &bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  0000000000001000: 00 01 02"));
        assert_eq!(lines[1], "  0000000000001010: 10 11");
    }

    #[test]
    fn test_hex_dump_sink() {
        let mut sink = HexDump::new(Vec::new());
        sink.code_emitted(&EmittedCode {
            name: "f",
            address: 0x2000,
            code: &[0xC3],
            debug_locs: &[],
        });
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.starts_with("f @ 0x2000 (1 bytes):"));
        assert!(text.contains(": c3"));
    }
}
