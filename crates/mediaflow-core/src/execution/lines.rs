use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Splits an engine's diagnostic stream into lines.
///
/// Engines redraw their status line with a bare `\r`, so both `\r` and `\n`
/// terminate a line. Empty lines are skipped. Reading is cancel safe: a
/// partially read line survives a dropped `next_line` future.
pub struct DiagnosticLines<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> DiagnosticLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let buffer = self.reader.fill_buf().await?;
            if buffer.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_pending()));
            }

            match buffer.iter().position(|byte| matches!(byte, b'\n' | b'\r')) {
                Some(end) => {
                    self.pending.extend_from_slice(&buffer[..end]);
                    self.reader.consume(end + 1);
                    if !self.pending.is_empty() {
                        return Ok(Some(self.take_pending()));
                    }
                }
                None => {
                    let consumed = buffer.len();
                    self.pending.extend_from_slice(buffer);
                    self.reader.consume(consumed);
                }
            }
        }
    }

    fn take_pending(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::DiagnosticLines;

    #[tokio::test]
    async fn carriage_returns_split_lines() {
        let input: &[u8] = b"Duration: 00:01:00.00\nframe=1 time=00:00:01.00\rframe=2 time=00:00:02.00\r\n\ntail";
        let mut lines = DiagnosticLines::new(input);

        let mut collected = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            collected.push(line);
        }

        assert_eq!(
            collected,
            vec![
                "Duration: 00:01:00.00",
                "frame=1 time=00:00:01.00",
                "frame=2 time=00:00:02.00",
                "tail",
            ]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let input: &[u8] = b"bad \xff byte\n";
        let mut lines = DiagnosticLines::new(input);
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.starts_with("bad "));
        assert!(lines.next_line().await.unwrap().is_none());
    }
}
