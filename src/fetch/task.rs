use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::Event;
use super::channel::SSH_DEFAULT_OPTS;
use crate::error::TaskError;
use crate::util::{exit_parts, wait_with_timeout};

// gunzip --test 的绝对超时
const INTEGRITY_TIMEOUT: Duration = Duration::from_secs(600);

/// Everything one transfer attempt needs; owned by the task thread.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub host: usize,
    pub ssh_program: PathBuf,
    pub ssh_connect: Vec<String>,
    pub remote_path: String,
    pub destination: PathBuf,
    /// 列举时观察到的远端 mtime；校验支路据此比对
    pub mtime: i64,
    /// per-chunk idle timeout for the data and stat channels
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub destination: PathBuf,
    pub remote_path: String,
    pub result: Result<TaskSuccess, TaskError>,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskSuccess {
    pub bytes: u64,
    /// 从首块数据到数据进程关闭的耗时
    pub elapsed_secs: f64,
}

/// Run one transfer attempt on its own thread. The thread reaps every child
/// it spawns before reporting, then sends exactly one `TaskDone` event.
pub fn spawn(spec: TaskSpec, events: Sender<Event>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let host = spec.host;
        let destination = spec.destination.clone();
        let remote_path = spec.remote_path.clone();
        let result = run(&spec);
        let outcome = TaskOutcome { destination, remote_path, result };
        let _ = events.send(Event::TaskDone { host, outcome });
    })
}

pub(crate) fn working_path(destination: &Path) -> PathBuf {
    let mut s = destination.as_os_str().to_os_string();
    s.push(".working");
    PathBuf::from(s)
}

/// 已压缩的远端文件直接取流，否则远端压缩后取流
pub(crate) fn remote_command(remote_path: &str) -> String {
    if remote_path.ends_with(".gz") {
        format!("cat {}", remote_path)
    } else {
        format!("gzip -c {}", remote_path)
    }
}

fn run(spec: &TaskSpec) -> Result<TaskSuccess, TaskError> {
    if let Some(parent) = spec.destination.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| TaskError::CreateDirFailed(parent.to_path_buf(), e.to_string()))?;
    }
    let working = working_path(&spec.destination);
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&working) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // 工作文件被其他任务占用：不触碰任何磁盘状态
            return Err(TaskError::AlreadyInProgress(spec.destination.clone()));
        }
        Err(e) => return Err(TaskError::OpenWorkingFailed(working, e.to_string())),
    };
    match transfer(spec, &mut file, &working) {
        Ok(done) => {
            drop(file);
            // 写屏障之后的原子重命名；观察者要么看不到，要么看到完整文件
            if let Err(e) = std::fs::rename(&working, &spec.destination) {
                let _ = std::fs::remove_file(&working);
                return Err(TaskError::RenameFailed(spec.destination.clone(), e.to_string()));
            }
            Ok(done)
        }
        Err(e) => {
            drop(file);
            let _ = std::fs::remove_file(&working);
            Err(e)
        }
    }
}

/// Data leg, verifier leg and integrity check. Completion is a barrier: the
/// verifier thread is always joined once spawned, even when the data leg has
/// already failed, so no child outlives the task.
fn transfer(spec: &TaskSpec, file: &mut File, working: &Path) -> Result<TaskSuccess, TaskError> {
    let cmd = remote_command(&spec.remote_path);
    let mut data_child = Command::new(&spec.ssh_program)
        .args(&spec.ssh_connect)
        .args(SSH_DEFAULT_OPTS)
        .arg(&cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| TaskError::SpawnFailed("数据", e.to_string()))?;
    let Some(stdout) = data_child.stdout.take() else {
        let _ = data_child.kill();
        let _ = data_child.wait();
        return Err(TaskError::SpawnFailed("数据", "缺少 stdout 管道".to_string()));
    };
    let chunk_rx = spawn_pipe_reader(stdout);

    let mut bytes: u64 = 0;
    let mut start: Option<Instant> = None;
    let mut verifier: Option<VerifierHandle> = None;
    let mut data_leg: Result<(), TaskError> = Ok(());

    loop {
        match chunk_rx.recv_timeout(spec.timeout) {
            Ok(chunk) => {
                if start.is_none() {
                    // 首块数据：开始计时，并发起时间戳校验支路
                    start = Some(Instant::now());
                    verifier = Some(spawn_verifier(spec));
                }
                if let Err(e) = file.write_all(&chunk) {
                    data_leg = Err(TaskError::LocalWrite(e.to_string()));
                    let _ = data_child.kill();
                    break;
                }
                bytes += chunk.len() as u64;
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                data_leg = Err(TaskError::IdleTimeout(spec.timeout.as_secs()));
                let _ = data_child.kill();
                break;
            }
        }
    }
    let elapsed_secs = start.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0);

    // 数据子进程必须收割；流已关闭但进程赖着不走的也要杀掉
    if let Ok(None) = wait_with_timeout(&mut data_child, spec.timeout) {
        let _ = data_child.kill();
    }
    match data_child.wait() {
        Ok(status) => {
            if data_leg.is_ok() {
                let (code, signal) = exit_parts(status);
                if code != Some(0) || signal.is_some() {
                    data_leg = Err(TaskError::DataExit { code, signal });
                } else if bytes == 0 {
                    data_leg = Err(TaskError::EmptyStream);
                }
            }
        }
        Err(e) => {
            tracing::debug!("[fetch][task] 数据进程收割失败: {}", e);
            if data_leg.is_ok() {
                data_leg = Err(TaskError::DataExit { code: None, signal: None });
            }
        }
    }

    if data_leg.is_ok()
        && let Err(e) = file.sync_all()
    {
        data_leg = Err(TaskError::LocalWrite(e.to_string()));
    }
    if data_leg.is_ok() {
        data_leg = integrity_check(working);
    }

    // 屏障：校验支路无论成败都要汇合
    let verifier_leg = match verifier {
        Some(v) => v.join(),
        None => Ok(()),
    };

    data_leg?;
    verifier_leg?;
    Ok(TaskSuccess { bytes, elapsed_secs })
}

fn spawn_pipe_reader<R: Read + Send + 'static>(mut src: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    std::thread::spawn(move || {
        let mut buf = [0u8; 64 * 1024];
        loop {
            match src.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

struct VerifierHandle {
    thread: std::thread::JoinHandle<Result<(), TaskError>>,
}

impl VerifierHandle {
    fn join(self) -> Result<(), TaskError> {
        self.thread
            .join()
            .unwrap_or_else(|_| Err(TaskError::VerifierFailed("校验线程异常退出".to_string())))
    }
}

fn spawn_verifier(spec: &TaskSpec) -> VerifierHandle {
    let ssh_program = spec.ssh_program.clone();
    let ssh_connect = spec.ssh_connect.clone();
    let remote_path = spec.remote_path.clone();
    let expected = spec.mtime;
    let timeout = spec.timeout;
    let thread = std::thread::spawn(move || {
        run_verifier(&ssh_program, &ssh_connect, &remote_path, expected, timeout)
    });
    VerifierHandle { thread }
}

static STAT_RE: LazyLock<regex::bytes::Regex> =
    LazyLock::new(|| regex::bytes::Regex::new(r"<([0-9]+)>").expect("valid stat regex"));

/// Re-read the remote mtime while the data stream is flowing; a mismatch
/// against the mtime from the listing means the file rotated in between.
fn run_verifier(
    ssh_program: &Path,
    ssh_connect: &[String],
    remote_path: &str,
    expected: i64,
    timeout: Duration,
) -> Result<(), TaskError> {
    let cmd = format!("stat --format='<%Y>' {}", remote_path);
    let mut child = Command::new(ssh_program)
        .args(ssh_connect)
        .args(SSH_DEFAULT_OPTS)
        .arg(&cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| TaskError::SpawnFailed("校验", e.to_string()))?;
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(TaskError::SpawnFailed("校验", "缺少 stdout 管道".to_string()));
    };
    let rx = spawn_pipe_reader(stdout);
    let mut out: Vec<u8> = Vec::new();
    loop {
        match rx.recv_timeout(timeout) {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TaskError::VerifierFailed(format!(
                    "空闲超时（{}s）",
                    timeout.as_secs()
                )));
            }
        }
    }
    if let Ok(None) = wait_with_timeout(&mut child, timeout) {
        let _ = child.kill();
    }
    let status = child.wait().map_err(|e| TaskError::VerifierFailed(e.to_string()))?;
    if !status.success() {
        return Err(TaskError::VerifierFailed(format!("退出状态 {}", status)));
    }
    let Some(caps) = STAT_RE.captures(&out) else {
        return Err(TaskError::VerifierFailed("输出中没有时间戳".to_string()));
    };
    let observed = std::str::from_utf8(&caps[1])
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| TaskError::VerifierFailed("时间戳无法解析".to_string()))?;
    if observed != expected {
        return Err(TaskError::VerifierMismatch { listed: expected, observed });
    }
    Ok(())
}

fn integrity_check(working: &Path) -> Result<(), TaskError> {
    let mut child = Command::new("gunzip")
        .arg("--test")
        .arg("--quiet")
        .arg(working)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| TaskError::SpawnFailed("完整性", e.to_string()))?;
    match wait_with_timeout(&mut child, INTEGRITY_TIMEOUT) {
        Ok(Some(status)) if status.success() => Ok(()),
        Ok(Some(status)) => Err(TaskError::IntegrityFailed(format!("退出状态 {}", status))),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(TaskError::IntegrityTimeout)
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(TaskError::IntegrityFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tmp_dir() -> std::path::PathBuf {
        let mut base = std::env::temp_dir();
        let uniq = format!(
            "lf_task_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        base.push(uniq);
        std::fs::create_dir(&base).expect("create tmp dir");
        base
    }

    #[test]
    fn working_path_appends_suffix() {
        assert_eq!(
            working_path(Path::new("/a/2023/x.gz")),
            PathBuf::from("/a/2023/x.gz.working")
        );
    }

    #[test]
    fn remote_command_picks_cat_for_gz() {
        assert_eq!(remote_command("/var/log/x.gz"), "cat /var/log/x.gz");
        assert_eq!(remote_command("/var/log/x.1"), "gzip -c /var/log/x.1");
    }

    #[test]
    fn occupied_working_file_aborts_without_side_effects() {
        let dir = make_tmp_dir();
        let destination = dir.join("x.gz");
        let working = working_path(&destination);
        std::fs::write(&working, b"held by someone else").expect("pre-create working");
        let spec = TaskSpec {
            host: 0,
            ssh_program: PathBuf::from("/bin/false"),
            ssh_connect: vec![],
            remote_path: "/var/log/x".to_string(),
            destination: destination.clone(),
            mtime: 1_700_000_000,
            timeout: Duration::from_secs(1),
        };
        match run(&spec) {
            Err(TaskError::AlreadyInProgress(p)) => assert_eq!(p, destination),
            other => panic!("expected AlreadyInProgress, got {:?}", other),
        }
        // 工作文件保持原样，目标不存在
        assert_eq!(std::fs::read(&working).expect("read working"), b"held by someone else");
        assert!(!destination.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn integrity_check_accepts_valid_gzip() {
        let dir = make_tmp_dir();
        let gz = dir.join("ok.gz");
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("printf 'payload' | gzip -c > {}", gz.display()))
            .status()
            .expect("run gzip");
        assert!(status.success());
        assert!(integrity_check(&gz).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn integrity_check_rejects_garbage() {
        let dir = make_tmp_dir();
        let bad = dir.join("bad.gz");
        std::fs::write(&bad, b"definitely not gzip").expect("write garbage");
        assert!(matches!(integrity_check(&bad), Err(TaskError::IntegrityFailed(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
