use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use super::Event;

/// 所有 ssh 调用共用的强制选项 — mandatory for every ssh invocation
pub const SSH_DEFAULT_OPTS: [&str; 7] =
    ["-T", "-x", "-y", "-o", "BatchMode=yes", "-o", "ConnectTimeout=10"];

/// One persistent ssh subprocess per host, hosting the interactive remote
/// shell that serves listing traffic. Writes are non-blocking for the caller
/// (a writer thread owns stdin); stdout and stderr are forwarded as `Data`
/// events in arrival order, which is the merged-stream contract the listing
/// parser expects. The channel is terminal once `Closed` is seen.
pub struct ControlChannel {
    child: Child,
    writer_tx: Sender<String>,
}

impl ControlChannel {
    pub fn start(
        ssh_program: &Path,
        ssh_connect: &[String],
        host: usize,
        events: Sender<Event>,
    ) -> Result<Self> {
        let mut child = Command::new(ssh_program)
            .args(ssh_connect)
            .args(SSH_DEFAULT_OPTS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("无法启动控制通道 ssh: {:?}", ssh_connect))?;

        let mut stdin = child.stdin.take().context("控制通道缺少 stdin 管道")?;
        let stdout = child.stdout.take().context("控制通道缺少 stdout 管道")?;
        let stderr = child.stderr.take().context("控制通道缺少 stderr 管道")?;

        let (writer_tx, writer_rx) = crossbeam_channel::unbounded::<String>();
        std::thread::spawn(move || {
            while let Ok(line) = writer_rx.recv() {
                if stdin.write_all(line.as_bytes()).is_err() {
                    break;
                }
            }
        });

        // stdout 读完即认为通道终结；stderr 只并入数据流
        spawn_reader(stdout, events.clone(), host, true);
        spawn_reader(stderr, events, host, false);

        Ok(Self { child, writer_tx })
    }

    /// Queue one command line for the remote shell. Never blocks; a dead
    /// writer side is discovered through the `Closed` event instead.
    pub fn write_line(&self, line: String) {
        let _ = self.writer_tx.send(line);
    }

    /// SIGKILL and reap. Safe to call after the child already exited.
    pub fn shutdown(&mut self) -> Option<ExitStatus> {
        let _ = self.child.kill();
        self.child.wait().ok()
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut src: R,
    events: Sender<Event>,
    host: usize,
    is_stdout: bool,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match src.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if events.send(Event::ControlData { host, chunk: buf[..n].to_vec() }).is_err() {
                        break;
                    }
                }
            }
        }
        if is_stdout {
            let _ = events.send(Event::ControlClosed { host });
        }
    });
}
