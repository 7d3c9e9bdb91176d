use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use nn4omtf_core::{
    BatchArray, BucketEdges, CancelToken, Compression, ConfigError, DatasetFiles, Event, ForwardMode,
    Gradients, HitsVariant, LinearClassifier, LogMode, Logits, Model, RecordWriter, Runner,
    RunnerConfig, RunnerError, StopReason, TestAccuracy, TestStatistics,
};
use tempfile::tempdir;

#[derive(Debug, Default)]
struct Counts {
    restored: Vec<String>,
    train_forwards: usize,
    train_examples: usize,
    eval_examples: usize,
    backwards: usize,
    saves: usize,
    finishes: usize,
    tests: Vec<(String, u64)>,
}

/// 常にクラス 0 を予測し、呼び出し回数を数えるモデル
struct CountingModel {
    name: String,
    edges: BucketEdges,
    counts: Arc<Mutex<Counts>>,
    cancel_after: Option<(usize, CancelToken)>,
    pt_width: Option<usize>,
}

impl CountingModel {
    fn new(name: &str) -> (Self, Arc<Mutex<Counts>>) {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let model = Self {
            name: name.to_string(),
            edges: edges(),
            counts: Arc::clone(&counts),
            cancel_after: None,
            pt_width: None,
        };
        (model, counts)
    }
}

impl Model for CountingModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn hits_variant(&self) -> HitsVariant {
        HitsVariant::Reduced
    }

    fn pt_edges(&self) -> &BucketEdges {
        &self.edges
    }

    fn restore(&mut self, session_name: &str) -> anyhow::Result<()> {
        self.counts.lock().unwrap().restored.push(session_name.to_string());
        Ok(())
    }

    fn forward(&mut self, hits: &BatchArray, mode: ForwardMode) -> anyhow::Result<Logits> {
        let n = hits.rows();
        let mut c = self.counts.lock().unwrap();
        match mode {
            ForwardMode::Train => {
                c.train_forwards += 1;
                c.train_examples += n;
            }
            ForwardMode::Eval => c.eval_examples += n,
        }
        let width = self.pt_width.unwrap_or(self.edges.class_count());
        Ok(Logits { pt: BatchArray::zeros(vec![n, width]), sgn: BatchArray::zeros(vec![n, 2]) })
    }

    fn backward(&mut self, grads: &Gradients, learning_rate: f32) -> anyhow::Result<()> {
        assert_eq!(learning_rate, 0.001);
        assert_eq!(grads.pt.shape()[1], 4);
        let mut c = self.counts.lock().unwrap();
        c.backwards += 1;
        if let Some((after, token)) = &self.cancel_after {
            if c.backwards >= *after {
                token.cancel();
            }
        }
        Ok(())
    }

    fn save(&mut self) -> anyhow::Result<()> {
        self.counts.lock().unwrap().saves += 1;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.counts.lock().unwrap().finishes += 1;
        Ok(())
    }

    fn record_test(
        &mut self,
        session_name: &str,
        _accuracy: &TestAccuracy,
        stats: &TestStatistics,
    ) -> anyhow::Result<()> {
        self.counts.lock().unwrap().tests.push((session_name.to_string(), stats.examples));
        Ok(())
    }
}

fn edges() -> BucketEdges {
    BucketEdges::pt(vec![10.0, 20.0, 30.0]).unwrap()
}

/// pt は 5, 15, 25, ... と巡回し、電荷は交互
fn write_phase(root: &Path, phase: &str, files: usize, per_file: usize) {
    let dir = root.join(phase);
    fs::create_dir_all(&dir).unwrap();
    for f in 0..files {
        let mut w = RecordWriter::create(dir.join(format!("c{f}.omtfrec")), Compression::None).unwrap();
        for i in 0..per_file {
            let pt = 5.0 + 10.0 * (i % 4) as f32;
            let q = if i % 2 == 0 { -1.0 } else { 1.0 };
            let ev = Event::empty([pt, 0.0, 0.0, q], [pt, 0.0, 0.0, q, 12.0, 0.0], f as f32 + 1.0);
            w.write_record(&ev.encode()).unwrap();
        }
        w.close().unwrap();
    }
}

fn config(logdir: &Path) -> RunnerConfig {
    RunnerConfig {
        batch_size: 6,
        valid_batch_size: 4,
        logdir: logdir.to_path_buf(),
        seed: Some(11),
        fan_out: Some(2),
        sess_name: Some("run".to_string()),
        ..Default::default()
    }
}

#[test]
fn one_step_consumes_one_batch_then_exhausts() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "train", 2, 3);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let runner = Runner::new(config(logs.path())).unwrap();
    let (mut model, counts) = CountingModel::new("mock");
    let summary = runner.train(&mut model, &ds, &CancelToken::new()).unwrap();

    assert_eq!(summary.steps, 1);
    assert_eq!(summary.examples_seen, 6);
    assert_eq!(summary.stop, StopReason::Exhausted);
    assert_eq!(summary.session_name, "run");
    let c = counts.lock().unwrap();
    assert_eq!((c.train_forwards, c.train_examples, c.backwards), (1, 6, 1));
    assert_eq!((c.finishes, c.saves), (1, 1));
    assert_eq!(c.restored, vec!["run".to_string()]);
}

#[test]
fn step_limit_stops_training() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "train", 2, 30);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let runner = Runner::new(RunnerConfig { steps: 3, ..config(logs.path()) }).unwrap();
    let (mut model, counts) = CountingModel::new("mock");
    let summary = runner.train(&mut model, &ds, &CancelToken::new()).unwrap();
    assert_eq!(summary.stop, StopReason::StepLimit);
    assert_eq!(summary.steps, 3);
    assert_eq!(counts.lock().unwrap().train_examples, 18);
}

#[test]
fn epochs_repeat_the_training_stream() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "train", 2, 3);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let runner = Runner::new(RunnerConfig { epochs: 3, ..config(logs.path()) }).unwrap();
    let (mut model, _) = CountingModel::new("mock");
    let summary = runner.train(&mut model, &ds, &CancelToken::new()).unwrap();
    assert_eq!(summary.steps, 3);
    assert_eq!(summary.examples_seen, 18);
}

#[test]
fn cancellation_still_saves() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "train", 2, 30);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let token = CancelToken::new();
    let runner = Runner::new(config(logs.path())).unwrap();
    let (mut model, counts) = CountingModel::new("mock");
    model.cancel_after = Some((2, token.clone()));
    let summary = runner.train(&mut model, &ds, &token).unwrap();

    assert_eq!(summary.stop, StopReason::Cancelled);
    assert_eq!(summary.steps, 2);
    let c = counts.lock().unwrap();
    assert_eq!((c.finishes, c.saves), (1, 1));
}

#[test]
fn validation_runs_every_interval_with_limit() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "train", 2, 12);
    write_phase(data.path(), "valid", 1, 10);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let cfg = RunnerConfig {
        acc_ival: 2,
        limit_valid_examples: Some(5),
        log: LogMode::Both,
        ..config(logs.path())
    };
    let runner = Runner::new(cfg).unwrap();
    let (mut model, counts) = CountingModel::new("mock");
    let summary = runner.train(&mut model, &ds, &CancelToken::new()).unwrap();

    // 24 / 6 = 4 ステップ、検証は 2, 4 ステップ目
    assert_eq!(summary.steps, 4);
    assert_eq!(counts.lock().unwrap().eval_examples, 2 * 5);
    let names: Vec<_> = summary.last_validation.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["accuracy_pt", "accuracy_sgn", "cross-pt", "cross-sgn"]);
    // 常にクラス 0: pt は 5, 15, 25, 35, 5 のうち 2 件、符号は負の 3 件が正解
    assert!((summary.last_validation[0].1 - 0.4).abs() < 1e-12);
    assert!((summary.last_validation[1].1 - 0.6).abs() < 1e-12);

    let valid_txt = fs::read_to_string(logs.path().join("run/valid.txt")).unwrap();
    assert!(valid_txt.starts_with("==== Runner configuration"));
    assert_eq!(valid_txt.lines().filter(|l| l.contains(" @ ")).count(), 2);
    let train_jsonl = fs::read_to_string(logs.path().join("run/train.jsonl")).unwrap();
    assert_eq!(train_jsonl.lines().count(), 4 * 2);
}

#[test]
fn bad_logits_shape_is_reported() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "train", 1, 6);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let runner = Runner::new(config(logs.path())).unwrap();
    let (mut model, counts) = CountingModel::new("mock");
    model.pt_width = Some(3);
    let err = runner.train(&mut model, &ds, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, RunnerError::LogitsShape { target: "pt", classes: 4, .. }));
    assert_eq!(counts.lock().unwrap().saves, 0);
}

#[test]
fn invalid_config_is_rejected_before_io() {
    let logs = tempdir().unwrap();
    assert!(Runner::new(RunnerConfig { batch_size: 0, ..config(logs.path()) }).is_err());
    assert!(Runner::new(RunnerConfig { learning_rate: 0.0, ..config(logs.path()) }).is_err());
}

#[test]
fn test_phase_writes_statistics() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "test", 2, 8);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let cfg = RunnerConfig { log: LogMode::Txt, limit_test_examples: Some(12), ..config(logs.path()) };
    let runner = Runner::new(cfg).unwrap();
    let (mut model, counts) = CountingModel::new("mock");
    let summary = runner.test(&mut model, &ds).unwrap();

    assert_eq!(summary.session_name, "run/test");
    assert_eq!(summary.model, "mock");
    assert_eq!(summary.examples, 12);
    // OMTF は正解と同じ値を出すので完全一致
    assert_eq!(summary.accuracy.omtf_pt, 1.0);
    assert_eq!(summary.accuracy.omtf_sgn, 1.0);
    assert_eq!(counts.lock().unwrap().tests, vec![("run/test".to_string(), 12)]);

    let dir = logs.path().join("run/test");
    assert!(dir.join("test.txt").exists());
    let stats: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.join("test_stats.json")).unwrap()).unwrap();
    assert_eq!(stats["examples"], 12);
    assert_eq!(stats["curves"]["pt_codes"], serde_json::json!([1, 2]));
}

#[test]
fn test_many_models_collects_summaries() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "test", 1, 4);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let cfg = RunnerConfig { sess_name: None, sess_prefix: "cmp-".to_string(), ..config(logs.path()) };
    let runner = Runner::new(cfg).unwrap();
    let mut models: Vec<Box<dyn Model>> = vec![
        Box::new(CountingModel::new("a").0),
        Box::new(LinearClassifier::new("lin", HitsVariant::Reduced, edges(), 5)),
    ];
    let summaries = runner.test_many_models(&mut models, &ds).unwrap();
    assert_eq!(summaries.len(), 2);
    assert!(summaries[0].session_name.starts_with("cmp-a_"));
    assert!(summaries[1].session_name.starts_with("cmp-lin_"));
    assert!(summaries[1].session_name.ends_with("/test"));
    assert!(summaries.iter().all(|s| s.examples == 4));
}

#[test]
fn test_many_models_keeps_each_model_statistics() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "test", 1, 6);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let cfg = RunnerConfig { log: LogMode::Txt, ..config(logs.path()) };
    let runner = Runner::new(cfg).unwrap();
    let mut models: Vec<Box<dyn Model>> = vec![
        Box::new(LinearClassifier::new("a", HitsVariant::Reduced, edges(), 1)),
        Box::new(CountingModel::new("b").0),
    ];
    let summaries = runner.test_many_models(&mut models, &ds).unwrap();
    let names: Vec<_> = summaries.iter().map(|s| s.session_name.as_str()).collect();
    assert_eq!(names, vec!["run/a/test", "run/b/test"]);
    for model in ["a", "b"] {
        let dir = logs.path().join("run").join(model).join("test");
        assert!(dir.join("test.txt").exists(), "{model}");
        let stats: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("test_stats.json")).unwrap()).unwrap();
        assert_eq!(stats["examples"], 6);
    }

    // 単体の test は従来どおり `{sess_name}/test`
    let mut single = LinearClassifier::new("a", HitsVariant::Reduced, edges(), 1);
    assert_eq!(runner.test(&mut single, &ds).unwrap().session_name, "run/test");
    assert_eq!(single.tests()[0].session, "run/test");
}

#[test]
fn test_many_models_rejects_duplicate_names() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "test", 1, 2);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let runner = Runner::new(config(logs.path())).unwrap();
    let (first, counts) = CountingModel::new("same");
    let mut models: Vec<Box<dyn Model>> = vec![Box::new(first), Box::new(CountingModel::new("same").0)];
    let err = runner.test_many_models(&mut models, &ds).unwrap_err();
    assert!(matches!(err, RunnerError::Config(ConfigError::DuplicateModelName(ref n)) if n == "same"));
    assert!(counts.lock().unwrap().tests.is_empty());
}

#[test]
fn linear_model_trains_end_to_end() {
    let data = tempdir().unwrap();
    write_phase(data.path(), "train", 2, 24);
    write_phase(data.path(), "valid", 1, 8);
    let ds = DatasetFiles::discover(data.path(), Compression::None).unwrap();
    let logs = tempdir().unwrap();

    let ckpt = logs.path().join("lin.bin");
    let cfg = RunnerConfig { acc_ival: 4, epochs: 2, shuffle: true, ..config(logs.path()) };
    let runner = Runner::new(cfg).unwrap();
    let mut model = LinearClassifier::new("lin", HitsVariant::Reduced, edges(), 1).with_checkpoint(&ckpt);
    let summary = runner.train(&mut model, &ds, &CancelToken::new()).unwrap();
    assert_eq!(summary.steps, 16);
    assert_eq!(summary.stop, StopReason::Exhausted);
    assert!(ckpt.exists());
}
