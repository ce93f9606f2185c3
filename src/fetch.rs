// fetch module: per-host engine, control channel, listing protocol, transfer tasks
pub mod channel;
pub mod listing;
pub mod task;
pub mod template;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use self::channel::ControlChannel;
use self::listing::{ListingParser, ListingRecord};
use self::task::{TaskOutcome, TaskSpec};
use crate::config::{GeneralConfig, HostConfig, LogFileSpec};

/// 子进程线程与任务线程发往调度线程的事件；引擎状态只在调度线程上变化
/// — all engine state mutation happens on the scheduler thread
#[derive(Debug)]
pub enum Event {
    ControlData { host: usize, chunk: Vec<u8> },
    ControlClosed { host: usize },
    TaskDone { host: usize, outcome: TaskOutcome },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub files_checked: u64,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
}

struct SpecRuntime {
    spec: LogFileSpec,
    filter: Option<regex::bytes::Regex>,
}

/// Per-host supervisor. Owns the control channel, the in-flight transfer
/// set and the done/working destination sets. Driven by `tick()` on a timer
/// and by `handle_*` calls for subprocess events.
pub struct FetchEngine {
    idx: usize,
    name: String,
    ssh_connect: Vec<String>,
    ssh_program: PathBuf,
    specs: Vec<SpecRuntime>,
    timeout: Duration,
    check_interval: Duration,
    task_limit: usize,
    control: Option<ControlChannel>,
    parser: ListingParser,
    active: HashMap<PathBuf, std::thread::JoinHandle<()>>,
    done_files: HashSet<PathBuf>,
    working_files: HashSet<PathBuf>,
    last_activity: Instant,
    stats: Stats,
    events: Sender<Event>,
}

impl FetchEngine {
    pub fn new(
        idx: usize,
        host: HostConfig,
        general: &GeneralConfig,
        ssh_program: PathBuf,
        events: Sender<Event>,
    ) -> Result<Self> {
        let mut specs = Vec::with_capacity(host.log_files.len());
        for spec in host.log_files {
            let filter = match &spec.filter_regexp {
                Some(pattern) => Some(
                    regex::bytes::Regex::new(pattern)
                        .with_context(|| format!("主机 {} 的 filterRegexp 无法编译", host.name))?,
                ),
                None => None,
            };
            specs.push(SpecRuntime { spec, filter });
        }
        Ok(Self {
            idx,
            name: host.name,
            ssh_connect: host.ssh_connect,
            ssh_program,
            specs,
            timeout: Duration::from_secs(general.timeout),
            check_interval: Duration::from_secs(general.log_check_interval),
            task_limit: general.transfer_task_limit,
            control: None,
            parser: ListingParser::new(),
            active: HashMap::new(),
            done_files: HashSet::new(),
            working_files: HashSet::new(),
            last_activity: Instant::now(),
            stats: Stats::default(),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// 读取并清零统计计数 — the status reporter owns the reset
    pub fn flush_stats(&mut self) -> Stats {
        std::mem::take(&mut self.stats)
    }

    pub fn control_alive(&self) -> bool {
        self.control.is_some()
    }

    pub fn active_transfers(&self) -> usize {
        self.active.len()
    }

    /// One scheduler tick: ensure the control channel, service the stall
    /// watchdog, then write one listing command per spec.
    pub fn tick(&mut self) {
        if self.control.is_none() {
            match ControlChannel::start(
                &self.ssh_program,
                &self.ssh_connect,
                self.idx,
                self.events.clone(),
            ) {
                Ok(ch) => {
                    tracing::debug!("[fetch][chan] {} 控制通道已建立", self.name);
                    self.control = Some(ch);
                    self.parser = ListingParser::new();
                    self.last_activity = Instant::now();
                }
                Err(e) => {
                    tracing::error!("[fetch][chan] {} 控制通道建立失败: {:#}", self.name, e);
                    return;
                }
            }
        } else {
            let stall_after = self.timeout + self.check_interval;
            if self.last_activity.elapsed() > stall_after {
                let sample = self
                    .parser
                    .first_sample()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                tracing::error!(
                    "[fetch][chan] {} 控制通道卡死（{}s 无记录），终止并待重建；首块样本: {:?}",
                    self.name,
                    stall_after.as_secs(),
                    sample
                );
                if let Some(mut ch) = self.control.take() {
                    let _ = ch.shutdown();
                }
                // 本轮不发列举，下一 tick 重建通道
                return;
            }
        }
        if let Some(control) = &self.control {
            for (id, rt) in self.specs.iter().enumerate() {
                control.write_line(listing::listing_command(id, &rt.spec.glob_pattern));
            }
        }
    }

    /// Control channel bytes arrived; feed the frame parser and act on every
    /// decoded record.
    pub fn handle_data(&mut self, chunk: &[u8]) {
        if self.control.is_none() {
            // 已丢弃通道的迟到数据
            return;
        }
        for record in self.parser.push(chunk) {
            self.last_activity = Instant::now();
            self.process_record(record);
        }
    }

    /// Control channel hit EOF. The channel is terminal: reap it and let the
    /// next tick build a fresh one.
    pub fn handle_closed(&mut self) {
        if let Some(mut ch) = self.control.take() {
            let status = ch.shutdown();
            tracing::warn!("[fetch][chan] {} 控制通道关闭: {:?}；下一轮重建", self.name, status);
        }
    }

    pub fn handle_task_done(&mut self, outcome: TaskOutcome) {
        self.working_files.remove(&outcome.destination);
        if let Some(handle) = self.active.remove(&outcome.destination) {
            let _ = handle.join();
        }
        match outcome.result {
            Ok(done) => {
                self.stats.files_transferred += 1;
                self.stats.bytes_transferred += done.bytes;
                let rate =
                    if done.elapsed_secs > 0.0 { done.bytes as f64 / done.elapsed_secs } else { 0.0 };
                tracing::info!(
                    "[fetch][task] {} 归档完成: {} -> {} ({}, {}/s)",
                    self.name,
                    outcome.remote_path,
                    outcome.destination.display(),
                    crate::util::human_bytes(done.bytes),
                    crate::util::human_bytes(rate as u64)
                );
                self.done_files.insert(outcome.destination);
            }
            Err(e) => {
                tracing::error!(
                    "[fetch][task] {} 传输失败: {} -> {} — {}",
                    self.name,
                    outcome.remote_path,
                    outcome.destination.display(),
                    e
                );
            }
        }
    }

    fn process_record(&mut self, record: ListingRecord) {
        let Some(rt) = self.specs.get(record.id) else {
            tracing::debug!(
                "[fetch][listing] {} 记录 id 越界: {} ({})",
                self.name,
                record.id,
                record.remote_path
            );
            return;
        };
        let caps = match &rt.filter {
            Some(re) => match re.captures(record.remote_path.as_bytes()) {
                Some(c) => Some(c),
                // 未通过过滤，静默跳过
                None => return,
            },
            None => None,
        };
        let destination = match template::resolve_destination(
            &rt.spec.destination_file,
            record.mtime,
            caps.as_ref(),
        ) {
            Ok(d) => PathBuf::from(d),
            Err(e) => {
                tracing::error!(
                    "[fetch] {} 目标模板解析失败: {} — {:#}",
                    self.name,
                    record.remote_path,
                    e
                );
                return;
            }
        };
        self.stats.files_checked += 1;
        if self.done_files.contains(&destination) {
            return;
        }
        if self.working_files.contains(&destination) {
            tracing::debug!("[fetch] {} 已在传输中: {}", self.name, destination.display());
            return;
        }
        if destination.exists() {
            // 归档目录是唯一事实来源；进程内集合只是备忘
            self.done_files.insert(destination);
            return;
        }
        if self.task_limit != 0 && self.active.len() >= self.task_limit {
            tracing::debug!(
                "[fetch] {} 并发已达上限（{}），{} 留待下一轮",
                self.name,
                self.task_limit,
                destination.display()
            );
            return;
        }
        tracing::debug!(
            "[fetch][task] {} 启动传输: {} -> {}",
            self.name,
            record.remote_path,
            destination.display()
        );
        let spec = TaskSpec {
            host: self.idx,
            ssh_program: self.ssh_program.clone(),
            ssh_connect: self.ssh_connect.clone(),
            remote_path: record.remote_path,
            destination: destination.clone(),
            mtime: record.mtime,
            timeout: self.timeout,
        };
        self.working_files.insert(destination.clone());
        let handle = task::spawn(spec, self.events.clone());
        self.active.insert(destination, handle);
    }
}
