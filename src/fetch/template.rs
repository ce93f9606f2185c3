use std::sync::LazyLock;

use anyhow::{Result, bail};
use chrono::format::{Item, StrftimeItems};

static RXMATCH_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{RXMATCH_([1-5])\}").expect("valid rxmatch regex"));

/// strftime 语法检查，配置装载时调用 — checked once at config load
pub fn strftime_is_valid(template: &str) -> bool {
    !StrftimeItems::new(template).any(|item| matches!(item, Item::Error))
}

/// Resolve a destination template for one listing record.
///
/// Order matters: strftime runs over localtime(mtime) first, then the
/// `${RXMATCH_k}` tokens are substituted literally from the filter captures.
/// A percent sign inside a capture value must survive as-is, so the capture
/// text is never fed back through strftime.
pub fn resolve_destination(
    template: &str,
    mtime: i64,
    caps: Option<&regex::bytes::Captures<'_>>,
) -> Result<String> {
    let Some(utc) = chrono::DateTime::from_timestamp(mtime, 0) else {
        bail!("无效的远端时间戳: {}", mtime);
    };
    let local = utc.with_timezone(&chrono::Local);
    let items: Vec<Item<'_>> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        bail!("destinationFile 含无效 strftime 指令: {}", template);
    }
    let dated = local.format_with_items(items.into_iter()).to_string();

    let resolved = RXMATCH_RE.replace_all(&dated, |token: &regex::Captures<'_>| {
        let k: usize = token[1].parse().unwrap_or(0);
        match caps.and_then(|c| c.get(k)) {
            Some(group) => String::from_utf8_lossy(group.as_bytes()).into_owned(),
            // 未匹配的捕获组替换为空串 — unmatched group becomes empty
            None => String::new(),
        }
    });
    Ok(resolved.into_owned())
}
