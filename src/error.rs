/// Repository-wide structured errors for configuration loading.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// 读取配置文件失败，保留路径与原始错误消息
    Read(std::path::PathBuf, String),
    /// JSON 解析/模式校验失败；带出错行与列，用于渲染脱字符指示
    Parse { line: usize, column: usize, message: String, source_line: String },
    /// CONSTANTS 键名不符合 [_A-Z]+
    BadConstantName(String),
    /// filterRegexp 无法编译
    BadFilter { host: String, pattern: String, message: String },
    /// destinationFile 含无效 strftime 指令
    BadTemplate { host: String, template: String },
    /// 数值型配置项取值无效（为 0 等）
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ConfigError::*;
        match self {
            Read(p, msg) => write!(f, "无法读取配置文件: {} — {}", p.display(), msg),
            Parse { line, column, message, source_line } => {
                // 打印出错行并在列位置放置脱字符 — print offending line with a caret
                writeln!(f, "配置解析失败 (行 {} 列 {}): {}", line, column, message)?;
                writeln!(f, "  {}", source_line)?;
                write!(f, "  {}^", " ".repeat(column.saturating_sub(1)))
            }
            BadConstantName(k) => write!(f, "CONSTANTS 键名必须匹配 [_A-Z]+: {}", k),
            BadFilter { host, pattern, message } => {
                write!(f, "主机 {} 的 filterRegexp 无法编译: {} — {}", host, pattern, message)
            }
            BadTemplate { host, template } => {
                write!(f, "主机 {} 的 destinationFile 含无效 strftime 指令: {}", host, template)
            }
            InvalidValue(key, got) => write!(f, "配置项 {} 取值无效: {}", key, got),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Per-transfer errors. A task never retries on its own; the next listing
/// tick is the retry, so every variant is terminal for its task.
#[derive(Debug, Clone)]
pub enum TaskError {
    /// 目标已有进行中的传输（工作文件被占用）
    AlreadyInProgress(std::path::PathBuf),
    CreateDirFailed(std::path::PathBuf, String),
    OpenWorkingFailed(std::path::PathBuf, String),
    /// 无法启动子进程（数据/校验/完整性）
    SpawnFailed(&'static str, String),
    /// 数据进程退出异常：非零退出码或被信号终止
    DataExit { code: Option<i32>, signal: Option<i32> },
    /// 数据流为空（0 字节）
    EmptyStream,
    /// 数据通道空闲超时
    IdleTimeout(u64),
    LocalWrite(String),
    /// 列举时与校验时的远端 mtime 不一致（文件在间隙中被轮转）
    VerifierMismatch { listed: i64, observed: i64 },
    VerifierFailed(String),
    IntegrityFailed(String),
    IntegrityTimeout,
    RenameFailed(std::path::PathBuf, String),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use TaskError::*;
        match self {
            AlreadyInProgress(p) => write!(f, "目标已在传输中: {}", p.display()),
            CreateDirFailed(p, msg) => write!(f, "创建目标目录失败: {} — {}", p.display(), msg),
            OpenWorkingFailed(p, msg) => {
                write!(f, "打开工作文件失败: {} — {}", p.display(), msg)
            }
            SpawnFailed(what, msg) => write!(f, "无法启动 {} 子进程: {}", what, msg),
            DataExit { code, signal } => {
                write!(f, "数据进程异常退出: code={:?} signal={:?}", code, signal)
            }
            EmptyStream => write!(f, "数据流为空（0 字节）"),
            IdleTimeout(secs) => write!(f, "数据通道空闲超时（{}s）", secs),
            LocalWrite(msg) => write!(f, "本地写入失败: {}", msg),
            VerifierMismatch { listed, observed } => {
                write!(f, "远端时间戳不一致: 列举时={} 校验时={}", listed, observed)
            }
            VerifierFailed(msg) => write!(f, "时间戳校验失败: {}", msg),
            IntegrityFailed(msg) => write!(f, "gunzip --test 校验失败: {}", msg),
            IntegrityTimeout => write!(f, "gunzip --test 超时"),
            RenameFailed(p, msg) => write!(f, "重命名到归档路径失败: {} — {}", p.display(), msg),
        }
    }
}

impl std::error::Error for TaskError {}
