/// A single decoded `text/event-stream` frame.
#[derive(Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bytes.
///
/// Frames are terminated by a blank line. Comment lines (leading `:`) and
/// fields other than `event` / `data` are ignored. Multiple `data` lines
/// within one frame are joined with `\n` per the SSE grammar.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = vec![];

        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=position).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.take_frame() {
                    frames.push(frame);
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = value.to_owned(),
                "data" => self.data.push(value.to_owned()),
                _ => {}
            }
        }

        frames
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        let event = core::mem::take(&mut self.event);
        let data = core::mem::take(&mut self.data);

        if data.is_empty() && event.is_empty() {
            return None;
        }

        Some(SseFrame {
            event,
            data: data.join("\n"),
        })
    }
}
