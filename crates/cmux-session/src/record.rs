use std::collections::VecDeque;

/// Bounded record of a session's filtered output, used to repaint a surface
/// that remounts while the backend stays attached. Oldest chunks are dropped
/// once the limit is exceeded.
#[derive(Debug)]
pub struct ScrollbackRecord {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    limit: usize,
}

impl ScrollbackRecord {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            limit,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() > self.limit {
            // Nothing older survives; keep what fits of this chunk
            self.clear();
            let tail = oversized_tail(data, self.limit);
            self.total_bytes = tail.len();
            if !tail.is_empty() {
                self.chunks.push_back(tail.to_vec());
            }
            return;
        }
        self.chunks.push_back(data.to_vec());
        self.total_bytes += data.len();
        while self.total_bytes > self.limit {
            match self.chunks.pop_front() {
                Some(removed) => {
                    self.total_bytes = self.total_bytes.saturating_sub(removed.len());
                }
                None => {
                    self.total_bytes = 0;
                    break;
                }
            }
        }
    }

    /// Record a chunk that contained ED3: everything before `offset` is gone.
    pub fn push_after_clear(&mut self, data: &[u8], offset: usize) {
        self.clear();
        self.push(data.get(offset..).unwrap_or_default());
    }

    /// Put `data` in front of everything recorded so far (attach content
    /// that arrived after early live output).
    pub fn prepend(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let tail = std::mem::take(&mut self.chunks);
        self.total_bytes = 0;
        self.push(data);
        for chunk in tail {
            self.push(&chunk);
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    /// Recorded bytes as one buffer.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// The last `limit` bytes of `data`, starting on a line boundary when one
/// exists, otherwise on a character boundary.
fn oversized_tail(data: &[u8], limit: usize) -> &[u8] {
    if limit == 0 {
        return &[];
    }
    let start = data.len() - limit;
    let body = &data[..data.len() - 1];
    if let Some(pos) = body[start..].iter().position(|&b| b == b'\n') {
        return &data[start + pos + 1..];
    }
    let skip = data[start..]
        .iter()
        .take_while(|&&b| (0x80..0xC0).contains(&b))
        .count();
    &data[start + skip..]
}
