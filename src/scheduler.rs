use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, select, tick};

use crate::config::Config;
use crate::fetch::{Event, FetchEngine};

/// Process-wide driver: one fetch engine per configured host, all sharing a
/// single event channel so engine state only ever changes on this thread.
pub struct Scheduler {
    engines: Vec<FetchEngine>,
    events: Receiver<Event>,
    check_interval: Duration,
    status_interval: Duration,
}

impl Scheduler {
    pub fn new(cfg: &Config, ssh_program: PathBuf) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut engines = Vec::with_capacity(cfg.hosts.len());
        for (idx, host) in cfg.hosts.iter().enumerate() {
            engines.push(FetchEngine::new(
                idx,
                host.clone(),
                &cfg.general,
                ssh_program.clone(),
                tx.clone(),
            )?);
        }
        Ok(Self {
            engines,
            events: rx,
            check_interval: Duration::from_secs(cfg.general.log_check_interval),
            status_interval: Duration::from_secs(cfg.general.status_log_interval),
        })
    }

    /// 主循环。Timer A 驱动列举，Timer B 刷统计，其余全部事件驱动。
    /// 只在收到信号被杀时退出；归档不变量保证 kill -9 也安全。
    pub fn run(self) -> Result<()> {
        let Scheduler { mut engines, events, check_interval, status_interval } = self;

        // 启动时立即各发一轮列举，不等 Timer A
        for engine in &mut engines {
            engine.tick();
        }

        let listing_timer = tick(check_interval);
        let status_timer = tick(status_interval);
        loop {
            select! {
                recv(events) -> ev => match ev {
                    Ok(ev) => dispatch(&mut engines, ev),
                    // 所有引擎都持有发送端；断开意味着没有引擎了
                    Err(_) => return Ok(()),
                },
                recv(listing_timer) -> _ => {
                    for engine in &mut engines {
                        engine.tick();
                    }
                }
                recv(status_timer) -> _ => flush_status(&mut engines),
            }
        }
    }
}

/// Route one subprocess event to the engine it belongs to.
pub fn dispatch(engines: &mut [FetchEngine], ev: Event) {
    match ev {
        Event::ControlData { host, chunk } => {
            if let Some(engine) = engines.get_mut(host) {
                engine.handle_data(&chunk);
            }
        }
        Event::ControlClosed { host } => {
            if let Some(engine) = engines.get_mut(host) {
                engine.handle_closed();
            }
        }
        Event::TaskDone { host, outcome } => {
            if let Some(engine) = engines.get_mut(host) {
                engine.handle_task_done(outcome);
            }
        }
    }
}

fn flush_status(engines: &mut [FetchEngine]) {
    for engine in engines {
        let s = engine.flush_stats();
        tracing::info!(
            "[fetch][status] {} checked={} transferred={} bytes={}",
            engine.name(),
            s.files_checked,
            s.files_transferred,
            s.bytes_transferred
        );
    }
}
