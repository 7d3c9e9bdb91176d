//! セッション
//!
//! 1 回の実行に名前をつけ、ログの出力先を持つ。
//! テキストログと構造化ログ（JSONL）はどちらも省略でき、
//! 省略されたシンクへの書き込みは何もしない。
//! 既存セッションを再開したときは両方とも追記する。

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::debug;
use serde_json::json;

use crate::config::RunnerConfig;

/// セッション名・ログ行のタイムスタンプ書式
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// 実行フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Valid,
    Test,
}

impl Phase {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `{prefix}{model}_{timestamp}`
pub fn session_name(prefix: &str, model_name: &str, now: &DateTime<Local>) -> String {
    format!("{prefix}{model_name}_{}", now.format(TIMESTAMP_FORMAT))
}

fn open_append(path: &Path) -> io::Result<File> {
    fs::OpenOptions::new().create(true).append(true).open(path)
}

/// テキストログ
///
/// `timestamp @ step: name=value, name=value, `
pub struct TextLog {
    w: BufWriter<File>,
}

impl TextLog {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self { w: BufWriter::new(open_append(path)?) })
    }

    pub fn write_raw(&mut self, s: &str) -> io::Result<()> {
        self.w.write_all(s.as_bytes())?;
        self.w.flush()
    }

    pub fn log(&mut self, step: u64, values: &[(&str, f64)]) -> io::Result<()> {
        write!(self.w, "{} @ {step}: ", Local::now().format(TIMESTAMP_FORMAT))?;
        for (name, value) in values {
            write!(self.w, "{name}={value}, ")?;
        }
        writeln!(self.w)?;
        self.w.flush()
    }

    pub fn close(mut self) -> io::Result<()> {
        self.w.flush()
    }
}

/// 構造化ログ（1 行 1 スカラー）
///
/// `{"step": 10, "wall_time": 1.7e9, "tag": "accuracy_pt", "value": 0.5}`
pub struct SummaryWriter {
    w: BufWriter<File>,
}

impl SummaryWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self { w: BufWriter::with_capacity(1 << 16, open_append(path)?) })
    }

    pub fn write_json(&mut self, v: &serde_json::Value) -> io::Result<()> {
        writeln!(self.w, "{v}")
    }

    pub fn add_scalars(&mut self, step: u64, values: &[(&str, f64)]) -> io::Result<()> {
        let wall_time = Local::now().timestamp_millis() as f64 / 1000.0;
        for (tag, value) in values {
            self.write_json(&json!({
                "step": step,
                "wall_time": wall_time,
                "tag": tag,
                "value": value,
            }))?;
        }
        self.w.flush()
    }

    pub fn close(mut self) -> io::Result<()> {
        self.w.flush()
    }
}

/// 名前付きの実行単位
pub struct Session {
    name: String,
    dir: PathBuf,
    text: [Option<TextLog>; 3],
    summaries: [Option<SummaryWriter>; 3],
}

impl Session {
    /// `{logdir}/{name}` を作り、`phases` のシンクを開く
    pub fn open(config: &RunnerConfig, name: &str, phases: &[Phase]) -> io::Result<Self> {
        let dir = config.logdir.join(name);
        fs::create_dir_all(&dir)?;
        let mut session = Self {
            name: name.to_string(),
            dir,
            text: [None, None, None],
            summaries: [None, None, None],
        };
        let params = config.params_string();
        for &phase in phases {
            if config.log.text() {
                let mut log = TextLog::create(&session.dir.join(format!("{phase}.txt")))?;
                log.write_raw(&params)?;
                session.text[phase.index()] = Some(log);
            }
            if config.log.structured() {
                let path = session.dir.join(format!("{phase}.jsonl"));
                session.summaries[phase.index()] = Some(SummaryWriter::create(&path)?);
            }
        }
        debug!("Session {} opened at {} (log={})", name, session.dir.display(), config.log);
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 両方のシンクに書く（開いていないシンクは無視）
    pub fn log(&mut self, phase: Phase, step: u64, values: &[(&str, f64)]) -> io::Result<()> {
        if let Some(t) = self.text[phase.index()].as_mut() {
            t.log(step, values)?;
        }
        if let Some(s) = self.summaries[phase.index()].as_mut() {
            s.add_scalars(step, values)?;
        }
        Ok(())
    }

    /// すべてのシンクをフラッシュして閉じる
    pub fn close(self) -> io::Result<()> {
        for t in self.text.into_iter().flatten() {
            t.close()?;
        }
        for s in self.summaries.into_iter().flatten() {
            s.close()?;
        }
        Ok(())
    }
}
