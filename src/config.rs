use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CFG_PATH: &str = "./etc/logfetcher.cfg";
pub const CFG_ENV: &str = "LOGFETCHER_CFG";

/// 配置文件路径：环境变量优先，否则使用默认路径 — env override, else default
pub fn config_path() -> PathBuf {
    match std::env::var_os(CFG_ENV) {
        Some(p) => PathBuf::from(p),
        None => PathBuf::from(DEFAULT_CFG_PATH),
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "GENERAL")]
    pub general: GeneralConfig,
    #[serde(rename = "CONSTANTS", default)]
    pub constants: BTreeMap<String, String>,
    #[serde(rename = "HOSTS")]
    pub hosts: Vec<HostConfig>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GeneralConfig {
    pub log_file: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "default_log_check_interval")]
    pub log_check_interval: u64,
    #[serde(default = "default_status_log_interval")]
    pub status_log_interval: u64,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// 每主机并发传输上限；0 表示不限制 — per-host cap; 0 disables the limit
    #[serde(default = "default_transfer_task_limit")]
    pub transfer_task_limit: usize,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HostConfig {
    pub name: String,
    pub ssh_connect: Vec<String>,
    pub log_files: Vec<LogFileSpec>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogFileSpec {
    pub glob_pattern: String,
    #[serde(default)]
    pub filter_regexp: Option<String>,
    pub destination_file: String,
    // 样例配置中出现但引擎不执行；仅被模式校验接受 — accepted, not enforced
    #[serde(default)]
    pub min_age: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// tracing 没有 fatal 级别，归并到 error
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_check_interval() -> u64 {
    10
}
fn default_status_log_interval() -> u64 {
    60
}
fn default_timeout() -> u64 {
    5
}
fn default_transfer_task_limit() -> usize {
    20
}

static CONSTANT_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[_A-Z]+$").expect("valid constant key regex"));

/// Load, strip comments, parse, substitute constants and validate.
/// Any error here is startup-fatal; nothing has been fetched yet.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.to_path_buf(), e.to_string()))?;
    let stripped = strip_comments(&raw);
    let mut cfg: Config = serde_json::from_str(&stripped).map_err(|e| {
        let line = e.line();
        let column = e.column();
        let source_line = raw.lines().nth(line.saturating_sub(1)).unwrap_or("").to_string();
        ConfigError::Parse { line, column, message: e.to_string(), source_line }
    })?;
    substitute_constants(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Strip `//` line comments outside of JSON string literals. Keeps newlines
/// so parse errors still report the original line numbers.
fn strip_comments(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for line in src.split_inclusive('\n') {
        let mut in_string = false;
        let mut escaped = false;
        let mut cut = line.len();
        let bytes = line.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == b'\\' {
                    escaped = true;
                } else if c == b'"' {
                    in_string = false;
                }
            } else if c == b'"' {
                in_string = true;
            } else if c == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                cut = i;
                break;
            }
            i += 1;
        }
        out.push_str(&line[..cut]);
        if cut < line.len() && line.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// 将每个 ${KEY} 替换到 globPattern 与 destinationFile 中 — per-key global replace
fn substitute_constants(cfg: &mut Config) -> Result<(), ConfigError> {
    for key in cfg.constants.keys() {
        if !CONSTANT_KEY_RE.is_match(key) {
            return Err(ConfigError::BadConstantName(key.clone()));
        }
    }
    for host in &mut cfg.hosts {
        for spec in &mut host.log_files {
            for (key, value) in &cfg.constants {
                let token = format!("${{{}}}", key);
                spec.glob_pattern = spec.glob_pattern.replace(&token, value);
                spec.destination_file = spec.destination_file.replace(&token, value);
            }
        }
    }
    Ok(())
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.general.log_check_interval == 0 {
        return Err(ConfigError::InvalidValue("logCheckInterval", "0".to_string()));
    }
    if cfg.general.status_log_interval == 0 {
        return Err(ConfigError::InvalidValue("statusLogInterval", "0".to_string()));
    }
    if cfg.general.timeout == 0 {
        return Err(ConfigError::InvalidValue("timeout", "0".to_string()));
    }
    for host in &cfg.hosts {
        if host.name.is_empty() {
            return Err(ConfigError::InvalidValue("HOSTS[].name", "空字符串".to_string()));
        }
        if host.ssh_connect.is_empty() {
            return Err(ConfigError::InvalidValue("HOSTS[].sshConnect", host.name.clone()));
        }
        for spec in &host.log_files {
            if let Some(pattern) = &spec.filter_regexp
                && let Err(e) = regex::bytes::Regex::new(pattern)
            {
                return Err(ConfigError::BadFilter {
                    host: host.name.clone(),
                    pattern: pattern.clone(),
                    message: e.to_string(),
                });
            }
            if !crate::fetch::template::strftime_is_valid(&spec.destination_file) {
                return Err(ConfigError::BadTemplate {
                    host: host.name.clone(),
                    template: spec.destination_file.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tmp_dir() -> std::path::PathBuf {
        let mut base = std::env::temp_dir();
        let uniq = format!(
            "lf_cfg_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        base.push(uniq);
        std::fs::create_dir(&base).expect("create tmp dir");
        base
    }

    const SAMPLE: &str = r#"
// 示例配置
{
  "GENERAL": {
    "logFile": "/var/log/logfetcher.log", // 日志文件
    "logLevel": "info",
    "logCheckInterval": 10,
    "statusLogInterval": 60,
    "transferTaskLimit": 20,
    "timeout": 5
  },
  "CONSTANTS": {
    "ARCHIVE": "/srv/archive"
  },
  "HOSTS": [
    {
      "name": "web-01",
      "sshConnect": ["log@web-01.example.org"],
      "logFiles": [
        {
          "globPattern": "/var/log/nginx/*.log.*",
          "filterRegexp": "([^/]+-access\\.log)\\.\\d+$",
          "destinationFile": "${ARCHIVE}/%Y/%m/${RXMATCH_1}-%Y%m%d.gz",
          "minAge": 300
        }
      ]
    }
  ]
}
"#;

    #[test]
    fn load_sample_and_substitute_constants() {
        let dir = make_tmp_dir();
        let path = dir.join("logfetcher.cfg");
        std::fs::write(&path, SAMPLE).expect("write cfg");
        let cfg = load(&path).expect("load sample config");
        assert_eq!(cfg.general.log_check_interval, 10);
        assert_eq!(cfg.general.transfer_task_limit, 20);
        assert_eq!(cfg.hosts.len(), 1);
        let spec = &cfg.hosts[0].log_files[0];
        // ${ARCHIVE} 已替换；${RXMATCH_1} 保留给运行期
        assert_eq!(spec.destination_file, "/srv/archive/%Y/%m/${RXMATCH_1}-%Y%m%d.gz");
        assert_eq!(spec.min_age, Some(300));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn defaults_fill_missing_general_fields() {
        let dir = make_tmp_dir();
        let path = dir.join("min.cfg");
        std::fs::write(&path, r#"{"GENERAL": {"logFile": "x.log"}, "HOSTS": []}"#)
            .expect("write cfg");
        let cfg = load(&path).expect("load minimal config");
        assert_eq!(cfg.general.log_check_interval, 10);
        assert_eq!(cfg.general.status_log_interval, 60);
        assert_eq!(cfg.general.timeout, 5);
        assert_eq!(cfg.general.transfer_task_limit, 20);
        assert_eq!(cfg.general.log_level, LogLevel::Info);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn strip_comments_keeps_slashes_inside_strings() {
        let src = "{\"a\": \"http://x//y\"} // tail\n";
        assert_eq!(strip_comments(src), "{\"a\": \"http://x//y\"} \n");
    }

    #[test]
    fn strip_comments_handles_escaped_quote() {
        let src = "{\"a\": \"q\\\"//still-string\"}// c\n";
        assert_eq!(strip_comments(src), "{\"a\": \"q\\\"//still-string\"}\n");
    }

    #[test]
    fn parse_error_reports_offending_line_with_caret() {
        let dir = make_tmp_dir();
        let path = dir.join("bad.cfg");
        std::fs::write(&path, "{\n  \"GENERAL\": {\n    \"logFile\" 42\n  }\n}\n")
            .expect("write cfg");
        let err = load(&path).expect_err("must fail");
        let rendered = err.to_string();
        assert!(rendered.contains("\"logFile\" 42"), "rendered: {}", rendered);
        assert!(rendered.contains('^'), "rendered: {}", rendered);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_key_is_a_schema_error() {
        let dir = make_tmp_dir();
        let path = dir.join("unknown.cfg");
        std::fs::write(
            &path,
            r#"{"GENERAL": {"logFile": "x.log", "bogus": 1}, "HOSTS": []}"#,
        )
        .expect("write cfg");
        assert!(load(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bad_constant_key_rejected() {
        let dir = make_tmp_dir();
        let path = dir.join("badkey.cfg");
        std::fs::write(
            &path,
            r#"{"GENERAL": {"logFile": "x.log"}, "CONSTANTS": {"lower": "v"}, "HOSTS": []}"#,
        )
        .expect("write cfg");
        match load(&path) {
            Err(ConfigError::BadConstantName(k)) => assert_eq!(k, "lower"),
            other => panic!("expected BadConstantName, got {:?}", other.map(|_| ())),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bad_filter_regexp_rejected() {
        let dir = make_tmp_dir();
        let path = dir.join("badre.cfg");
        std::fs::write(
            &path,
            r#"{"GENERAL": {"logFile": "x.log"}, "HOSTS": [{"name": "h", "sshConnect": ["u@h"],
               "logFiles": [{"globPattern": "/x/*", "filterRegexp": "([", "destinationFile": "/a/%Y.gz"}]}]}"#,
        )
        .expect("write cfg");
        assert!(matches!(load(&path), Err(ConfigError::BadFilter { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn zero_interval_rejected() {
        let dir = make_tmp_dir();
        let path = dir.join("zero.cfg");
        std::fs::write(
            &path,
            r#"{"GENERAL": {"logFile": "x.log", "logCheckInterval": 0}, "HOSTS": []}"#,
        )
        .expect("write cfg");
        assert!(matches!(load(&path), Err(ConfigError::InvalidValue("logCheckInterval", _))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
