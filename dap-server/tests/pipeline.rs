//! End-to-end exercises of the response pipeline: functional constraint
//! expressions against a cold and warm cache, multipart framing, cache
//! read-back, and timeout injection.

use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dap_server::builder::{ResponseBuilder, read_data_from_cache};
use dap_server::ce::{ConstraintEvaluator, Evaluator, ServerFunction};
use dap_server::config::ServerConfig;
use dap_server::dap_types::constraint::Argument;
use dap_server::dap_types::core::Keyword;
use dap_server::dap_types::variable::{
    ArrayData, ArrayValue, Dimension, ScalarType, SequenceValue, Value, Variable,
};
use dap_server::dap_types::{DapError, Dataset, VarName};

fn name(s: &str) -> VarName {
    VarName::try_from(s).unwrap()
}

fn sample() -> Dataset {
    let mut ds = Dataset::new("Sample");

    let mut arr = ArrayValue::new(
        ScalarType::Int32,
        vec![Dimension::new(Some(name("time")), 4)],
    );
    arr.data = Some(ArrayData::Int32(vec![10, 20, 30, 40]));
    ds.add_var(Variable::new(name("x"), Value::Array(arr)))
        .unwrap();

    ds.add_var(Variable::new(name("t"), Value::Float64(Some(1.5))))
        .unwrap();

    ds
}

/// Mean of the named array variable, as a tree-building server function.
fn mean_of(args: &[Argument], dataset: &Dataset) -> Result<Dataset, DapError> {
    let Some(Argument::Path(path)) = args.first() else {
        return Err(DapError::CeParse("mean() needs a variable".to_owned()));
    };
    let var = dataset
        .var_by_path(path.segments())
        .ok_or_else(|| DapError::CeParse(format!("No such variable: `{path}`")))?;
    let Value::Array(arr) = &var.value else {
        return Err(DapError::CeParse(format!("`{path}` is not an array")));
    };
    let Some(ArrayData::Int32(data)) = &arr.data else {
        return Err(DapError::Dataset(format!("`{path}` has not been read")));
    };

    let mean = data.iter().copied().sum::<i32>() as f64 / data.len() as f64;

    let mut out = Dataset::new("mean_result");
    out.add_var(Variable::new(name("m"), Value::Float64(Some(mean))))
        .unwrap();
    Ok(out)
}

fn builder_with_cache(dir: &std::path::Path, ce: &str) -> ResponseBuilder {
    let config = ServerConfig {
        dataset: "Sample".to_owned(),
        cache_root: dir.to_owned(),
        cache_prefix: "f".to_owned(),
        cache_max_bytes: 1 << 20,
        ..ServerConfig::default()
    };
    let mut builder = ResponseBuilder::new(&config).unwrap();
    builder.set_ce(ce);
    builder
}

#[test]
fn functional_ce_cold_then_warm_cache() {
    static EVALS: AtomicUsize = AtomicUsize::new(0);

    fn counted_mean(args: &[Argument], dataset: &Dataset) -> Result<Dataset, DapError> {
        EVALS.fetch_add(1, Ordering::SeqCst);
        mean_of(args, dataset)
    }

    let dir = tempfile::tempdir().unwrap();

    // Cold: miss, evaluate, cache, stream.
    let mut out1 = Vec::new();
    {
        let mut builder = builder_with_cache(dir.path(), "mean(x,0)");
        let mut eval = Evaluator::new();
        eval.register("mean", ServerFunction::BaseType(counted_mean));

        let mut ds = sample();
        builder
            .send_data(&mut out1, &mut ds, &mut eval, true)
            .unwrap();
    }
    assert_eq!(EVALS.load(Ordering::SeqCst), 1);

    // The entry landed under the mangled key.
    let entry = dir.path().join("fSample#mean#x#0#");
    assert!(entry.exists(), "expected cache entry at {}", entry.display());

    // Warm: hit, stream without re-evaluating.
    let mut out2 = Vec::new();
    {
        let mut builder = builder_with_cache(dir.path(), "mean(x,0)");
        let mut eval = Evaluator::new();
        eval.register("mean", ServerFunction::BaseType(counted_mean));

        let mut ds = sample();
        builder
            .send_data(&mut out2, &mut ds, &mut eval, true)
            .unwrap();
    }
    assert_eq!(EVALS.load(Ordering::SeqCst), 1);

    // Both responses carry the same values: 25.0 as one big-endian float.
    for out in [&out1, &out2] {
        let text = String::from_utf8_lossy(out);
        assert!(text.contains("Float64 m;"));
        let marker = b"Data:\n";
        let pos = out.windows(marker.len()).position(|w| w == marker).unwrap();
        assert_eq!(&out[pos + marker.len()..], 25.0f64.to_be_bytes());
    }
}

#[test]
fn functional_ce_with_residual_projection() {
    fn stats(args: &[Argument], dataset: &Dataset) -> Result<Dataset, DapError> {
        let mut out = mean_of(args, dataset)?;
        out.add_var(Variable::new(name("n"), Value::Int32(Some(4))))
            .unwrap();
        Ok(out)
    }

    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_with_cache(dir.path(), "stats(x),n");
    let mut eval = Evaluator::new();
    eval.register("stats", ServerFunction::BaseType(stats));

    let mut ds = sample();
    let mut out = Vec::new();
    builder.send_data(&mut out, &mut ds, &mut eval, false).unwrap();

    let text = String::from_utf8_lossy(&out);
    // Only `n` survives the residual projection.
    assert!(text.contains("Int32 n;"));
    assert!(!text.contains("Float64 m;"));

    let marker = b"Data:\n";
    let pos = out.windows(marker.len()).position(|w| w == marker).unwrap();
    assert_eq!(&out[pos + marker.len()..], 4i32.to_be_bytes());
}

#[test]
fn trailing_function_call_after_projection() {
    // The call is the last comma-separated term; the splitter must consume
    // the separator cleanly and leave `m` as the residual projection.
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_with_cache(dir.path(), "m,mean(x,0)");
    let mut eval = Evaluator::new();
    eval.register("mean", ServerFunction::BaseType(mean_of));

    let mut ds = sample();
    let mut out = Vec::new();
    builder.send_data(&mut out, &mut ds, &mut eval, false).unwrap();

    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("Float64 m;"));

    let marker = b"Data:\n";
    let pos = out.windows(marker.len()).position(|w| w == marker).unwrap();
    assert_eq!(&out[pos + marker.len()..], 25.0f64.to_be_bytes());
}

#[test]
fn disabled_cache_reevaluates_every_time() {
    static EVALS: AtomicUsize = AtomicUsize::new(0);

    fn counted_mean(args: &[Argument], dataset: &Dataset) -> Result<Dataset, DapError> {
        EVALS.fetch_add(1, Ordering::SeqCst);
        mean_of(args, dataset)
    }

    let config = ServerConfig {
        dataset: "Sample".to_owned(),
        cache_max_bytes: 0,
        ..ServerConfig::default()
    };

    for _ in 0..2 {
        let mut builder = ResponseBuilder::new(&config).unwrap();
        builder.set_ce("mean(x,0)");

        let mut eval = Evaluator::new();
        eval.register("mean", ServerFunction::BaseType(counted_mean));

        let mut ds = sample();
        let mut out = Vec::new();
        builder.send_data(&mut out, &mut ds, &mut eval, false).unwrap();
    }

    assert_eq!(EVALS.load(Ordering::SeqCst), 2);
}

#[test]
fn cache_entry_reads_back_byte_exact() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_with_cache(dir.path(), "mean(x,0)");
    let mut eval = Evaluator::new();
    eval.register("mean", ServerFunction::BaseType(mean_of));

    let mut ds = sample();
    let mut out = Vec::new();
    builder.send_data(&mut out, &mut ds, &mut eval, false).unwrap();

    let entry = dir.path().join("fSample#mean#x#0#");
    let mut reader = BufReader::new(File::open(&entry).unwrap());
    let cached = read_data_from_cache(&mut reader).unwrap();

    let m = cached.var("m").unwrap();
    assert!(m.read);
    assert_eq!(m.value, Value::Float64(Some(25.0)));
}

#[test]
fn data_ddx_multipart_framing() {
    let mut ds = sample();
    let config = ServerConfig {
        dataset: "Sample".to_owned(),
        cache_max_bytes: 0,
        ..ServerConfig::default()
    };
    let mut builder = ResponseBuilder::new(&config).unwrap();
    builder.set_ce("t");

    let mut eval = Evaluator::new();
    let mut out = Vec::new();
    builder
        .send_data_ddx(&mut out, &mut ds, &mut eval, "start-id", "frontier", true)
        .unwrap();

    let text = String::from_utf8_lossy(&out);
    assert!(text.contains(
        "Content-Type: Multipart/Related; boundary=frontier; \
         start=\"<start-id>\"; type=\"Text/xml\"\r\n"
    ));

    // Two part boundaries plus the closing boundary.
    assert_eq!(text.matches("--frontier\r\n").count(), 2);
    assert!(text.ends_with("\r\n--frontier--\r\n"));

    // The DDX part's blob element references the data part's Content-Id.
    let cid_start = text.find("<blob href=\"cid:").unwrap() + "<blob href=\"cid:".len();
    let cid_end = cid_start + text[cid_start..].find('"').unwrap();
    let cid = &text[cid_start..cid_end];
    assert!(text.contains(&format!("Content-Id: <{cid}>\r\n")));

    // The DDX is constrained to the projected variable.
    assert!(text.contains(r#"<Float64 name="t"/>"#));
    assert!(!text.contains(r#"<Array name="x">"#));
}

/// Delegates to the real evaluator but dawdles over every sequence row, so a
/// short deadline fires mid-emission.
struct SlowEvaluator {
    inner: Evaluator,
    delay: Duration,
}

impl ConstraintEvaluator for SlowEvaluator {
    fn parse_constraint(&mut self, ce: &str, dataset: &mut Dataset) -> Result<(), DapError> {
        self.inner.parse_constraint(ce, dataset)
    }

    fn find_function(&self, name: &str) -> Option<dap_server::ce::FunctionKind> {
        self.inner.find_function(name)
    }

    fn eval_function_clauses(&self, dataset: &Dataset) -> Result<Dataset, DapError> {
        self.inner.eval_function_clauses(dataset)
    }

    fn has_function_clauses(&self) -> bool {
        self.inner.has_function_clauses()
    }

    fn functional_expression(&self) -> bool {
        self.inner.functional_expression()
    }

    fn keywords(&self) -> Vec<Keyword> {
        self.inner.keywords()
    }

    fn row_matches(&self, fields: &[Variable], row: &[Value]) -> Result<bool, DapError> {
        std::thread::sleep(self.delay);
        self.inner.row_matches(fields, row)
    }
}

#[test]
fn timeout_injects_error_mid_stream() {
    let mut ds = Dataset::new("Sample");

    let fields = vec![Variable::new(name("depth"), Value::Float64(None))];
    let mut seq = SequenceValue::new(fields);
    for i in 0..3 {
        seq.rows.push(vec![Value::Float64(Some(f64::from(i)))]);
    }
    ds.add_var(Variable::new(name("cast"), Value::Sequence(seq)))
        .unwrap();
    ds.add_var(Variable::new(name("t"), Value::Float64(Some(0.0))))
        .unwrap();

    let config = ServerConfig {
        dataset: "Sample".to_owned(),
        timeout_seconds: 1,
        cache_max_bytes: 0,
        ..ServerConfig::default()
    };
    let mut builder = ResponseBuilder::new(&config).unwrap();
    builder.set_ce("");

    let mut eval = SlowEvaluator {
        inner: Evaluator::new(),
        delay: Duration::from_millis(500),
    };

    let mut out = Vec::new();
    let err = builder
        .send_data(&mut out, &mut ds, &mut eval, false)
        .unwrap_err();
    assert!(matches!(err, DapError::Timeout));

    let text = String::from_utf8_lossy(&out);
    // Partial data, then the blank-line marker and a serialized error.
    assert!(text.contains("Data:\n"));
    assert!(text.contains("\r\n\r\nError {\n    code = 408;"));
}
