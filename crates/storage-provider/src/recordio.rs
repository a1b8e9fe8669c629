//! Length-prefixed framing for the subscription event stream. Each record is
//! its byte length in decimal ASCII, a newline, then the payload. The format
//! survives arbitrary chunking by the HTTP transport.

/// Frames one record.
pub fn encode_frame(record: &[u8]) -> Vec<u8> {
    let header = format!("{}\n", record.len());
    let mut out = Vec::with_capacity(header.len() + record.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(record);
    out
}

/// Incremental decoder. Feed it transport chunks as they arrive; it yields
/// every record that has fully accumulated.
#[derive(Debug, Default)]
pub struct RecordIoDecoder {
    buffer: Vec<u8>,
}

impl RecordIoDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a chunk and drains all complete records. An unparsable length
    /// header poisons the stream and returns an error.
    pub fn decode(&mut self, chunk: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();
        loop {
            let newline = match self.buffer.iter().position(|b| *b == b'\n') {
                Some(i) => i,
                None => break,
            };

            let length: usize = std::str::from_utf8(&self.buffer[..newline])
                .map_err(|_| anyhow::anyhow!("record length is not valid UTF-8"))?
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("record length is not a number"))?;

            if self.buffer.len() < newline + 1 + length {
                break;
            }

            let record = self.buffer[newline + 1..newline + 1 + length].to_vec();
            self.buffer.drain(..newline + 1 + length);
            records.push(record);
        }
        Ok(records)
    }
}
