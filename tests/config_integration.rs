use logfetcher::config::{self, LogLevel};

fn make_tmp_dir() -> std::path::PathBuf {
    let mut base = std::env::temp_dir();
    let uniq = format!(
        "lf_cfgint_test_{}_{}",
        std::process::id(),
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
    );
    base.push(uniq);
    std::fs::create_dir(&base).expect("create tmp dir");
    base
}

// 贴近生产形态的多主机配置，含注释与常量
const FLEET: &str = r#"
// log harvester fleet config
{
  "GENERAL": {
    "logFile": "/var/log/logfetcher/lf.log",
    "logLevel": "debug",
    "timeout": 5
  },
  "CONSTANTS": {
    "ARCHIVE": "/srv/archive",
    "NGINX_GLOB": "/var/log/nginx/*.log.*"
  },
  "HOSTS": [
    {
      "name": "web-01",
      "sshConnect": ["log@web-01"],
      "logFiles": [
        {
          "globPattern": "${NGINX_GLOB}",
          "filterRegexp": "([^/]+)\\.\\d+$",
          "destinationFile": "${ARCHIVE}/web-01/%Y/%m/${RXMATCH_1}-%Y%m%d.gz"
        }
      ]
    },
    {
      "name": "db-01",
      "sshConnect": ["-p", "2222", "log@db-01"],
      "logFiles": [
        { "globPattern": "/var/log/pg/*.gz", "destinationFile": "${ARCHIVE}/db-01/%Y/pg-%j.gz" },
        { "globPattern": "/var/log/syslog.*", "destinationFile": "${ARCHIVE}/db-01/%Y/sys-%j.gz" }
      ]
    }
  ]
}
"#;

#[test]
fn fleet_config_loads_with_constants_applied() {
    let dir = make_tmp_dir();
    let path = dir.join("fleet.cfg");
    std::fs::write(&path, FLEET).expect("write cfg");
    let cfg = config::load(&path).expect("load fleet config");

    assert_eq!(cfg.general.log_level, LogLevel::Debug);
    // 未给出的字段取默认值
    assert_eq!(cfg.general.log_check_interval, 10);
    assert_eq!(cfg.general.transfer_task_limit, 20);

    assert_eq!(cfg.hosts.len(), 2);
    assert_eq!(cfg.hosts[0].log_files[0].glob_pattern, "/var/log/nginx/*.log.*");
    assert_eq!(
        cfg.hosts[0].log_files[0].destination_file,
        "/srv/archive/web-01/%Y/%m/${RXMATCH_1}-%Y%m%d.gz"
    );
    assert_eq!(cfg.hosts[1].ssh_connect, vec!["-p", "2222", "log@db-01"]);
    assert_eq!(cfg.hosts[1].log_files.len(), 2);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn fatal_level_maps_to_error_filter() {
    assert_eq!(LogLevel::Fatal.as_filter(), "error");
    assert_eq!(LogLevel::Debug.as_filter(), "debug");
    assert_eq!(LogLevel::Warn.as_filter(), "warn");
}

#[test]
fn default_config_path_without_env() {
    // 该测试不触碰环境变量；默认值本身必须稳定
    if std::env::var_os(config::CFG_ENV).is_none() {
        assert_eq!(config::config_path(), std::path::PathBuf::from("./etc/logfetcher.cfg"));
    }
}
