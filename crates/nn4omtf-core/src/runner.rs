//! 学習・テストの制御ループ
//!
//! TRAIN: 1 ステップごとに学習バッチを 1 つ取り出して順伝播・逆伝播する。
//! `acc_ival` ステップごとに検証ストリームを先頭から流し直して精度を測る。
//! ステップ上限・ストリーム終端・キャンセルのいずれで止まっても
//! `finish` と `save` を呼んでからセッションを閉じる。
//!
//! TEST: テストストリームを 1 回流し、NN と OMTF の精度と統計を集計する。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Serialize;

use crate::bucket::SIGN_CLASSES;
use crate::config::RunnerConfig;
use crate::dataset::DatasetFiles;
use crate::error::{ConfigError, RunnerError, RunnerResult};
use crate::io::Compression;
use crate::metrics::{MetricSet, StepLoss, Target};
use crate::model::{ForwardMode, Gradients, Logits, Model};
use crate::pipeline::{Batch, InputPipe, PipeConfig, default_fan_out};
use crate::session::{Phase, Session, session_name};
use crate::stats::{TestAccuracy, TestStatistics};

const PT: &str = "pt";
const SGN: &str = "sgn";

/// 協調的キャンセルのトークン（ステップ境界でのみ確認する）
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// シグナルハンドラに渡すフラグ
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// 学習の終了理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    StepLimit,
    Exhausted,
    Cancelled,
}

/// 学習の結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainSummary {
    pub session_name: String,
    /// 完了したステップ数
    pub steps: u64,
    pub examples_seen: u64,
    pub stop: StopReason,
    /// 最後の検証の `(名前, 精度)`
    pub last_validation: Vec<(String, f64)>,
}

/// テストの結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestSummary {
    pub session_name: String,
    pub accuracy: TestAccuracy,
    pub model: String,
    pub examples: u64,
}

/// 制御ループ
pub struct Runner {
    config: RunnerConfig,
}

impl Runner {
    /// 設定を検証して作成
    pub fn new(config: RunnerConfig) -> Result<Self, ConfigError> {
        Ok(Self { config: config.validated()? })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn base_session_name(&self, model: &dyn Model) -> String {
        self.config
            .sess_name
            .clone()
            .unwrap_or_else(|| session_name(&self.config.sess_prefix, model.name(), &Local::now()))
    }

    fn pipe_config(&self, model: &dyn Model, compression: Compression) -> PipeConfig {
        let mut c = PipeConfig::new(model.hits_variant(), model.pt_edges().clone());
        c.compression = compression;
        c.strategy = self.config.expansion;
        c.remap = Some(self.config.remap());
        c.detect_no_signal = true;
        c.fan_out = self.config.fan_out.unwrap_or_else(default_fan_out);
        c.seed = self.config.seed;
        c
    }

    fn progress_bar(&self, len: Option<u64>) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let (pb, template) = match len {
            Some(n) => (ProgressBar::new(n), "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}"),
            None => (ProgressBar::new_spinner(), "[{elapsed_precise}] {spinner} {pos} {msg}"),
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            pb.set_style(style);
        }
        pb
    }

    /// 学習する
    pub fn train(
        &self,
        model: &mut dyn Model,
        dataset: &DatasetFiles,
        cancel: &CancelToken,
    ) -> RunnerResult<TrainSummary> {
        let name = self.base_session_name(model);
        info!("Preparing training session: {name}");

        let mut train_cfg = self.pipe_config(model, dataset.compression);
        train_cfg.batch_size = Some(self.config.batch_size);
        train_cfg.shuffle = self.config.shuffle;
        train_cfg.reps = self.config.epochs;
        let mut valid_cfg = self.pipe_config(model, dataset.compression);
        valid_cfg.batch_size = Some(self.config.valid_batch_size);
        valid_cfg.limit = self.config.limit_valid_examples;
        valid_cfg.seed = self.config.seed.map(|s| s.wrapping_add(1));

        let mut train_pipe = InputPipe::new(Phase::Train.name(), train_cfg)?;
        let mut valid_pipe = InputPipe::new(Phase::Valid.name(), valid_cfg)?;

        model.restore(&name).map_err(RunnerError::Model)?;
        info!("Loaded model: {}", model.name());
        let mut session = Session::open(&self.config, &name, &[Phase::Train, Phase::Valid])?;

        train_pipe.bind(&dataset.train)?;
        let mut state = TrainState::default();
        let started = Instant::now();
        let outcome = self.train_loop(model, dataset, cancel, &mut train_pipe, &mut valid_pipe, &mut session, &mut state);

        let stop = match outcome {
            Ok(stop) => stop,
            Err(e) => {
                if let Err(close_err) = session.close() {
                    warn!("Failed to close session logs: {close_err}");
                }
                return Err(e);
            }
        };
        match stop {
            StopReason::Cancelled => info!("Training stopped by user"),
            StopReason::Exhausted => info!("Training stream exhausted"),
            StopReason::StepLimit => {}
        }
        info!(
            "Training finished: {} steps, {} examples in {:.1} sec",
            state.steps,
            state.examples_seen,
            started.elapsed().as_secs_f64()
        );

        model.finish().map_err(RunnerError::Model)?;
        model.save().map_err(RunnerError::Model)?;
        info!("Model saved");
        session.close()?;

        Ok(TrainSummary {
            session_name: name,
            steps: state.steps,
            examples_seen: state.examples_seen,
            stop,
            last_validation: state.last_validation,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn train_loop(
        &self,
        model: &mut dyn Model,
        dataset: &DatasetFiles,
        cancel: &CancelToken,
        train_pipe: &mut InputPipe,
        valid_pipe: &mut InputPipe,
        session: &mut Session,
        state: &mut TrainState,
    ) -> RunnerResult<StopReason> {
        let limit = self.config.steps_limit();
        let progress = self.progress_bar(limit);
        let mut metrics = MetricSet::new(&[PT, SGN]);
        let mut last_cross = None;
        let mut step: u64 = 1;

        let stop = loop {
            if limit.is_some_and(|l| step > l) {
                break StopReason::StepLimit;
            }
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            let Some(batch) = train_pipe.fetch()? else {
                break StopReason::Exhausted;
            };

            let logits = model.forward(&batch.hits, ForwardMode::Train).map_err(RunnerError::Model)?;
            check_logits(&logits, &batch)?;
            let loss = StepLoss::compute(&[
                Target::new(PT, &logits.pt, &batch.pt_labels),
                Target::new(SGN, &logits.sgn, &batch.sign_labels),
            ]);
            let cross = cross_entropies(&loss);
            let total = loss.total;
            let mut grads = loss.grads.into_iter();
            if let (Some(pt), Some(sgn)) = (grads.next(), grads.next()) {
                model
                    .backward(&Gradients { pt, sgn }, self.config.learning_rate)
                    .map_err(RunnerError::Model)?;
            }
            state.steps = step;
            state.examples_seen += batch.len() as u64;
            debug!("Training step {step}: cross-pt={:.6} cross-sgn={:.6}", cross[0].1, cross[1].1);
            session.log(Phase::Train, step, &cross)?;
            progress.set_message(format!("loss:{total:.4}"));
            last_cross = Some(cross);

            if step % self.config.acc_ival == 0 {
                info!("Validation @ step {step}");
                self.validate(model, valid_pipe, &dataset.valid, &mut metrics)?;
                let mut values: Vec<(&str, f64)> =
                    metrics.values().into_iter().map(|(n, v)| (accuracy_tag(n), v)).collect();
                // 検証直前の学習バッチの損失も目安として残す
                values.extend(last_cross.into_iter().flatten());
                session.log(Phase::Valid, step, &values)?;
                for (n, v) in &values {
                    info!("  {n}: {v:.6}");
                }
                state.last_validation = values.iter().map(|&(n, v)| (n.to_string(), v)).collect();
            }

            progress.inc(1);
            step += 1;
        };
        progress.finish_and_clear();
        Ok(stop)
    }

    /// 検証ストリームを先頭から流して累積精度を更新する
    fn validate(
        &self,
        model: &mut dyn Model,
        pipe: &mut InputPipe,
        files: &[std::path::PathBuf],
        metrics: &mut MetricSet,
    ) -> RunnerResult<()> {
        metrics.reset();
        pipe.bind(files)?;
        while let Some(batch) = pipe.fetch()? {
            let logits = model.forward(&batch.hits, ForwardMode::Eval).map_err(RunnerError::Model)?;
            check_logits(&logits, &batch)?;
            metrics.update(&[
                Target::new(PT, &logits.pt, &batch.pt_labels),
                Target::new(SGN, &logits.sgn, &batch.sign_labels),
            ]);
            debug!("Examples processed: {}", metrics.examples());
            if self.config.limit_valid_examples.is_some_and(|l| metrics.examples() >= l as u64) {
                break;
            }
        }
        Ok(())
    }

    /// テストする（セッションは `{base}/test`）
    pub fn test(&self, model: &mut dyn Model, dataset: &DatasetFiles) -> RunnerResult<TestSummary> {
        let base = self.base_session_name(model);
        self.test_in(model, dataset, format!("{base}/test"))
    }

    fn test_in(
        &self,
        model: &mut dyn Model,
        dataset: &DatasetFiles,
        name: String,
    ) -> RunnerResult<TestSummary> {
        info!("Preparing test session: {name}");

        let mut cfg = self.pipe_config(model, dataset.compression);
        cfg.batch_size = Some(self.config.valid_batch_size);
        cfg.limit = self.config.limit_test_examples;
        let mut pipe = InputPipe::new(Phase::Test.name(), cfg)?;

        model.restore(&name).map_err(RunnerError::Model)?;
        info!("Loaded model: {}", model.name());
        let mut session = Session::open(&self.config, &name, &[Phase::Test])?;

        let started = Instant::now();
        let mut stats = TestStatistics::new(model.pt_edges());
        let progress = self.progress_bar(None);
        pipe.bind(&dataset.test)?;
        let collected = (|| -> RunnerResult<()> {
            while let Some(batch) = pipe.fetch()? {
                let logits = model.forward(&batch.hits, ForwardMode::Eval).map_err(RunnerError::Model)?;
                check_logits(&logits, &batch)?;
                stats.update(&batch, &logits.pt, &logits.sgn);
                progress.inc(batch.len() as u64);
            }
            Ok(())
        })();
        progress.finish_and_clear();
        if let Err(e) = collected {
            if let Err(close_err) = session.close() {
                warn!("Failed to close session logs: {close_err}");
            }
            return Err(e);
        }

        let accuracy = stats.accuracy();
        session.log(
            Phase::Test,
            1,
            &[
                ("accuracy_pt", accuracy.pt),
                ("accuracy_sgn", accuracy.sgn),
                ("omtf_accuracy_pt", accuracy.omtf_pt),
                ("omtf_accuracy_sgn", accuracy.omtf_sgn),
            ],
        )?;
        std::fs::write(session.dir().join("test_stats.json"), stats.to_json()?)?;
        model.record_test(&name, &accuracy, &stats).map_err(RunnerError::Model)?;
        session.close()?;

        info!(
            "Test finished in {:.1} sec: {} examples, pt={:.6} sgn={:.6} (OMTF pt={:.6} sgn={:.6})",
            started.elapsed().as_secs_f64(),
            stats.examples,
            accuracy.pt,
            accuracy.sgn,
            accuracy.omtf_pt,
            accuracy.omtf_sgn
        );
        Ok(TestSummary {
            session_name: name,
            accuracy,
            model: model.name().to_string(),
            examples: stats.examples,
        })
    }

    /// 複数のモデルを順にテストする
    ///
    /// `sess_name` 指定時は `{sess_name}/{model}/test` に分けて書く。
    /// モデル名は重複してはならない。
    pub fn test_many_models(
        &self,
        models: &mut [Box<dyn Model>],
        dataset: &DatasetFiles,
    ) -> RunnerResult<Vec<TestSummary>> {
        let mut seen = HashSet::new();
        if let Some(dup) = models.iter().map(|m| m.name()).find(|&n| !seen.insert(n)) {
            return Err(ConfigError::DuplicateModelName(dup.to_string()).into());
        }
        models
            .iter_mut()
            .map(|m| {
                let name = match &self.config.sess_name {
                    Some(base) => format!("{base}/{}/test", m.name()),
                    None => format!("{}/test", self.base_session_name(m.as_ref())),
                };
                self.test_in(m.as_mut(), dataset, name)
            })
            .collect()
    }
}

#[derive(Default)]
struct TrainState {
    steps: u64,
    examples_seen: u64,
    last_validation: Vec<(String, f64)>,
}

fn accuracy_tag(name: &str) -> &'static str {
    match name {
        PT => "accuracy_pt",
        _ => "accuracy_sgn",
    }
}

fn cross_entropies(loss: &StepLoss) -> [(&'static str, f64); 2] {
    [
        ("cross-pt", f64::from(loss.loss(PT).unwrap_or(0.0))),
        ("cross-sgn", f64::from(loss.loss(SGN).unwrap_or(0.0))),
    ]
}

fn check_logits(logits: &Logits, batch: &Batch) -> RunnerResult<()> {
    let rows = batch.len();
    for (target, arr, classes) in [
        (PT, &logits.pt, batch.pt_labels.row_len()),
        (SGN, &logits.sgn, SIGN_CLASSES),
    ] {
        if arr.shape() != [rows, classes] {
            return Err(RunnerError::LogitsShape {
                target,
                rows,
                classes,
                actual: arr.shape().to_vec(),
            });
        }
    }
    Ok(())
}
