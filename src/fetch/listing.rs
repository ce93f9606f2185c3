use std::sync::LazyLock;

/// One `<LOG_FILE><id><mtime><path><NL>` frame decoded from the control
/// channel stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRecord {
    pub id: usize,
    pub mtime: i64,
    pub remote_path: String,
}

/// 写给远端交互 shell 的列举命令行 — one command per LogFileSpec
pub fn listing_command(id: usize, glob_pattern: &str) -> String {
    format!("stat --format='<LOG_FILE><{}><%Y><%n><NL>' {}\n", id, glob_pattern)
}

// 帧正则：非贪婪前缀吞掉混入流中的 ssh 噪声；(?s) 让 . 匹配换行
static FRAME_RE: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
    regex::bytes::Regex::new(r"(?s)^(.*?)<LOG_FILE><([0-9]+)><([0-9]+)><(.+?)><NL>")
        .expect("valid frame regex")
});

const FIRST_SAMPLE_LIMIT: usize = 256;

/// Incremental frame parser over the merged stdout/stderr byte stream of one
/// control channel. Stderr noise between frames is tolerated by the
/// non-greedy prefix; there is no resynchronization beyond that — a remote
/// that emits the literal frame tokens corrupts the channel.
pub struct ListingParser {
    buf: Vec<u8>,
    first_sample: Option<Vec<u8>>,
}

impl ListingParser {
    pub fn new() -> Self {
        Self { buf: Vec::new(), first_sample: None }
    }

    /// 首块数据的前 256 字节，供卡死诊断输出 — retained verbatim for diagnostics
    pub fn first_sample(&self) -> Option<&[u8]> {
        self.first_sample.as_deref()
    }

    /// Feed one chunk, drain every complete frame currently in the buffer.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ListingRecord> {
        if self.first_sample.is_none() {
            let take = chunk.len().min(FIRST_SAMPLE_LIMIT);
            self.first_sample = Some(chunk[..take].to_vec());
        }
        self.buf.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some(caps) = FRAME_RE.captures(&self.buf) {
            let all = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let id = std::str::from_utf8(&caps[2]).ok().and_then(|s| s.parse::<usize>().ok());
            let mtime = std::str::from_utf8(&caps[3]).ok().and_then(|s| s.parse::<i64>().ok());
            let remote_path = String::from_utf8_lossy(&caps[4]).into_owned();
            self.buf.drain(..all);
            match (id, mtime) {
                (Some(id), Some(mtime)) => records.push(ListingRecord { id, mtime, remote_path }),
                // 数字字段溢出等畸形帧只丢弃本帧，不污染后续 — drop the frame only
                _ => tracing::debug!("[fetch][listing] 丢弃畸形帧: path={}", remote_path),
            }
        }
        records
    }
}

impl Default for ListingParser {
    fn default() -> Self {
        Self::new()
    }
}
