use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use serde::{Deserialize, Serialize};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "silent" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("未知的日志级别 `{}`", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

/// 日志输出目标
#[derive(Debug, Clone, PartialEq)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
    /// 同时输出到标准输出和文件
    Both(PathBuf),
    RotatingFile {
        path: PathBuf,
        /// 单个文件最大大小（字节）
        max_size: u64,
        max_backups: usize,
    },
}

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub show_timestamp: bool,
    pub show_module: bool,
    /// 仅对终端输出生效
    pub use_color: bool,
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_timestamp: true,
            show_module: true,
            use_color: true,
            output: LogOutput::Stdout,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.as_ref().to_path_buf());
        self
    }

    pub fn with_both<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::Both(path.as_ref().to_path_buf());
        self
    }

    pub fn with_rotating_file<P: AsRef<Path>>(mut self, path: P, max_size: u64, max_backups: usize) -> Self {
        self.output = LogOutput::RotatingFile {
            path: path.as_ref().to_path_buf(),
            max_size,
            max_backups,
        };
        self
    }
}

/// 配置文件中的 `general.log`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogSettings {
    /// off / error / warn / info / debug / trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// stdout / file / both
    #[serde(default = "default_log_output")]
    pub output: String,
    pub file_path: Option<String>,
    #[serde(default)]
    pub enable_rotation: bool,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_true")]
    pub show_timestamp: bool,
    #[serde(default = "default_true")]
    pub show_module: bool,
    #[serde(default = "default_true")]
    pub use_color: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_max_backups() -> usize {
    5
}

fn default_true() -> bool {
    true
}

const DEFAULT_LOG_FILE: &str = "logs/rule-tunnel.log";

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            file_path: None,
            enable_rotation: false,
            max_size_mb: default_max_size_mb(),
            max_backups: default_max_backups(),
            show_timestamp: true,
            show_module: true,
            use_color: true,
        }
    }
}

impl LogSettings {
    /// 无法识别的级别按 info 处理
    pub fn level(&self) -> LogLevel {
        self.level.parse().unwrap_or_default()
    }

    pub fn to_log_config(&self) -> LogConfig {
        let mut config = LogConfig::new(self.level())
            .with_timestamp(self.show_timestamp)
            .with_module(self.show_module)
            .with_color(self.use_color);

        let file_path = self.file_path.as_deref().unwrap_or(DEFAULT_LOG_FILE);
        let to_file = matches!(self.output.as_str(), "file" | "both");
        if to_file && self.enable_rotation {
            config = config.with_rotating_file(file_path, self.max_size_mb * 1024 * 1024, self.max_backups);
        } else if self.output == "file" {
            config = config.with_file(file_path);
        } else if self.output == "both" {
            config = config.with_both(file_path);
        }
        config
    }
}

/// 文件写入器，可选按大小轮转
struct FileWriter {
    file: File,
    current_size: u64,
    path: PathBuf,
    max_size: Option<u64>,
    max_backups: usize,
}

impl FileWriter {
    fn new(path: PathBuf, max_size: Option<u64>, max_backups: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            file,
            current_size,
            path,
            max_size,
            max_backups,
        })
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if let Some(max_size) = self.max_size {
            if self.current_size > 0 && self.current_size + len > max_size {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)?;
        self.current_size += len;
        Ok(())
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    /// app.log → app.log.1 → app.log.2 ...，超过 max_backups 的删除
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_backups == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.current_size = 0;
            return Ok(());
        }

        let _ = std::fs::remove_file(self.backup_path(self.max_backups));
        for i in (1..self.max_backups).rev() {
            let from = self.backup_path(i);
            if from.exists() {
                let _ = std::fs::rename(from, self.backup_path(i + 1));
            }
        }
        std::fs::rename(&self.path, self.backup_path(1))?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

struct Logger {
    config: LogConfig,
    file_writer: Option<Mutex<FileWriter>>,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if matches!(self.config.output, LogOutput::Stdout | LogOutput::Both(_)) {
            let line = format_record(&self.config, record, self.config.use_color);
            let _ = writeln!(io::stdout().lock(), "{}", line);
        }

        // 文件中不使用颜色
        if let Some(writer) = &self.file_writer {
            let line = format_record(&self.config, record, false);
            let _ = writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_line(&line);
        }
    }

    fn flush(&self) {
        if let Some(writer) = &self.file_writer {
            let _ = writer.lock().unwrap_or_else(PoisonError::into_inner).file.flush();
        }
        let _ = io::stdout().flush();
    }
}

fn level_label(level: log::Level, color: bool) -> &'static str {
    match (level, color) {
        (log::Level::Error, true) => "\x1b[31mERROR\x1b[0m",
        (log::Level::Warn, true) => "\x1b[33mWARN \x1b[0m",
        (log::Level::Info, true) => "\x1b[32mINFO \x1b[0m",
        (log::Level::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
        (log::Level::Trace, true) => "\x1b[35mTRACE\x1b[0m",
        (log::Level::Error, false) => "ERROR",
        (log::Level::Warn, false) => "WARN ",
        (log::Level::Info, false) => "INFO ",
        (log::Level::Debug, false) => "DEBUG",
        (log::Level::Trace, false) => "TRACE",
    }
}

fn format_record(config: &LogConfig, record: &Record, color: bool) -> String {
    let mut line = String::with_capacity(128);
    if config.show_timestamp {
        line.push_str(&format!("[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f")));
    }
    line.push_str(level_label(record.level(), color));
    line.push(' ');
    if config.show_module {
        if let Some(module) = record.module_path() {
            line.push_str(&format!("[{}] ", module));
        }
    }
    line.push_str(&record.args().to_string());
    line
}

/// 初始化日志系统，只能调用一次
pub fn init_logger(config: LogConfig) -> Result<(), String> {
    let file_writer = match &config.output {
        LogOutput::Stdout => None,
        LogOutput::File(path) | LogOutput::Both(path) => Some(
            FileWriter::new(path.clone(), None, 0).map_err(|e| format!("无法创建日志文件: {}", e))?,
        ),
        LogOutput::RotatingFile {
            path,
            max_size,
            max_backups,
        } => Some(
            FileWriter::new(path.clone(), Some(*max_size), *max_backups)
                .map_err(|e| format!("无法创建日志文件: {}", e))?,
        ),
    };

    let level = config.level;
    let logger = Logger {
        config,
        file_writer: file_writer.map(Mutex::new),
    };
    log::set_boxed_logger(Box::new(logger)).map_err(|e| format!("设置日志器失败: {}", e))?;
    log::set_max_level(level.to_level_filter());
    Ok(())
}

/// 运行中调整日志级别（配置重载时使用）
pub fn set_level(level: LogLevel) {
    log::set_max_level(level.to_level_filter());
}

/// 读取 RUST_LOG 环境变量来设置日志级别
///
/// ```bash
/// RUST_LOG=debug ./rule-tunnel config.json
/// ```
pub fn init_from_env() -> Result<(), String> {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    init_logger(LogConfig::new(level))
}
