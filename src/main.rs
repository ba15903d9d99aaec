use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(author, version, about = "cols fixture harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the self-checks and the fixture suite (default)
    Run {
        /// Only run fixtures whose stem contains this filter
        #[arg(short, long)]
        filter: Option<String>,
        /// Print per-spawn execution details
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },
    /// Run the suite under kcov and fail on any uncovered line
    Coverage {
        /// Directory receiving the kcov traces and merged report
        #[arg(short, long, default_value = "coverage")]
        output: PathBuf,
        /// Print per-spawn execution details
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },
}

static VERBOSE: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        filter: None,
        verbose: false,
    });

    match command {
        Commands::Run { filter, verbose } => {
            VERBOSE.store(verbose, Ordering::Relaxed);
            let harness = Harness::new()?;
            run_suite(&harness, filter.as_deref(), None)
        }
        Commands::Coverage { output, verbose } => {
            VERBOSE.store(verbose, Ordering::Relaxed);
            let harness = Harness::new()?;
            let mut gate = CoverageGate::new(output)?;
            run_suite(&harness, None, Some(&mut gate))
        }
    }
}

// --------------------- Shared harness --------------------------------------
struct Harness {
    cols: PathBuf,
    fixture_dir: PathBuf,
}

impl Harness {
    fn new() -> Result<Self> {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .context("expected the harness crate to have a parent directory")?
            .to_path_buf();
        Ok(Self {
            cols: root.join("cols"),
            fixture_dir: root.join("tests"),
        })
    }
}

// --------------------- Fixtures --------------------------------------------
struct Fixture {
    stem: String,
    dir: PathBuf,
}

impl Fixture {
    fn new(stem: &str, dir: &Path) -> Self {
        Self {
            stem: stem.to_string(),
            dir: dir.to_path_buf(),
        }
    }

    fn sidecar(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.stem))
    }

    /// First line of `<stem>.args`, shell-tokenized. An absent sidecar means
    /// no extra arguments, which is distinct from a present-but-empty one.
    fn args(&self) -> Result<Vec<String>> {
        let path = self.sidecar("args");
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let line = text.lines().next().unwrap_or("");
        shlex::split(line).with_context(|| format!("unbalanced quoting in {}", path.display()))
    }

    fn stdin(&self) -> Result<File> {
        let path = self.sidecar("in");
        File::open(&path).with_context(|| format!("opening {}", path.display()))
    }

    fn expected_stdout(&self) -> Result<Vec<u8>> {
        let path = self.sidecar("out");
        fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }

    fn expected_ret(&self) -> Result<i32> {
        let path = self.sidecar("ret");
        match fs::read_to_string(&path) {
            Ok(text) => text
                .trim()
                .parse()
                .with_context(|| format!("parsing exit code in {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

fn discover_fixtures(dir: &Path) -> Result<Vec<Fixture>> {
    let mut stems = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("scanning {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if let Some(stem) = name.strip_suffix(".in") {
            stems.push(stem.to_string());
        }
    }
    stems.sort_by_key(|stem| natural_key(stem));
    Ok(stems
        .into_iter()
        .map(|stem| Fixture::new(&stem, dir))
        .collect())
}

// --------------------- Natural ordering ------------------------------------
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Number(u128),
    Text(String),
}

/// Splits a stem on digit runs so "t2" sorts before "t10". A digit run too
/// long for u128 falls back to a text segment.
fn natural_key(stem: &str) -> Vec<Segment> {
    let mut key = Vec::new();
    let mut chars = stem.chars().peekable();
    while let Some(&first) = chars.peek() {
        let digits = first.is_ascii_digit();
        let mut run = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() != digits {
                break;
            }
            run.push(c);
            chars.next();
        }
        if digits {
            match run.parse() {
                Ok(n) => key.push(Segment::Number(n)),
                Err(_) => key.push(Segment::Text(run)),
            }
        } else {
            key.push(Segment::Text(run));
        }
    }
    key
}

// --------------------- Execution & comparison ------------------------------
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Passed,
    BadReturn(i32),
    Signaled,
    StderrOutput,
    StdoutMismatch,
}

impl Verdict {
    fn message(&self) -> String {
        match self {
            Verdict::Passed => "passed".into(),
            Verdict::BadReturn(code) => format!("failed; returned {code}"),
            Verdict::Signaled => "failed; terminated by signal".into(),
            Verdict::StderrOutput => "failed; output on STDERR".into(),
            Verdict::StdoutMismatch => "failed; incorrect output on STDOUT".into(),
        }
    }
}

fn check_fixture(harness: &Harness, fixture: &Fixture) -> Result<Verdict> {
    let args = fixture.args()?;
    let expected_ret = fixture.expected_ret()?;
    let output = Command::new(&harness.cols)
        .args(&args)
        .stdin(Stdio::from(fixture.stdin()?))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("spawning {:?}", harness.cols))?;
    if VERBOSE.load(Ordering::Relaxed) {
        println!(
            "[CMD ] {:?} {:?} -> status {:?}, stdout {}B, stderr {}B",
            harness.cols,
            args,
            output.status.code(),
            output.stdout.len(),
            output.stderr.len()
        );
    }
    // Exit code first, then stderr, then stdout; stop at the first miss.
    match output.status.code() {
        Some(code) if code == expected_ret => {}
        Some(code) => return Ok(Verdict::BadReturn(code)),
        None => return Ok(Verdict::Signaled),
    }
    if !output.stderr.is_empty() {
        return Ok(Verdict::StderrOutput);
    }
    if output.stdout != fixture.expected_stdout()? {
        return Ok(Verdict::StdoutMismatch);
    }
    Ok(Verdict::Passed)
}

fn run_suite(
    harness: &Harness,
    filter: Option<&str>,
    mut coverage: Option<&mut CoverageGate>,
) -> Result<()> {
    let failures = run_self_checks();
    if failures > 0 {
        std::process::exit(i32::try_from(failures).unwrap_or(1));
    }

    let fixtures = discover_fixtures(&harness.fixture_dir)?;
    let total = fixtures.len();
    let mut ran = 0usize;
    for fixture in &fixtures {
        if let Some(f) = filter {
            if !fixture.stem.contains(f) {
                continue;
            }
        }
        // Announce before spawning so a hung child is attributable.
        print!("{} ", fixture.stem);
        io::stdout().flush()?;
        let verdict = check_fixture(harness, fixture)?;
        println!("{}", verdict.message());
        if verdict != Verdict::Passed {
            bail!("fixture {} failed", fixture.stem);
        }
        if let Some(gate) = coverage.as_deref_mut() {
            gate.record(harness, fixture)?;
        }
        ran += 1;
    }
    println!(
        "\n{ran}/{total} fixtures passed{}.",
        if filter.is_some() { " (filtered)" } else { "" }
    );
    if let Some(gate) = coverage {
        gate.analyze()?;
    }
    Ok(())
}

// --------------------- Self-checks -----------------------------------------
// In-process example/assert pairs over the harness's own helpers, run before
// any fixture. A failure here aborts the run with the failure count as the
// process exit status.
type SelfCheck = (&'static str, fn() -> Result<()>);

fn run_self_checks() -> usize {
    let checks: Vec<SelfCheck> = vec![
        ("numeric stem runs order as integers", check_numeric_ordering),
        ("text and digit runs interleave in keys", check_mixed_key),
        ("argument lines honor shell quoting", check_arg_quoting),
        ("absent sidecars fall back to defaults", check_sidecar_defaults),
        ("expected output is read verbatim", check_verbatim_read),
    ];
    let total = checks.len();
    let mut passed = 0usize;
    for (name, check) in checks {
        match check() {
            Ok(()) => {
                passed += 1;
                if VERBOSE.load(Ordering::Relaxed) {
                    println!("[PASS] {name}");
                }
            }
            Err(e) => println!("[FAIL] {name}: {e:#}"),
        }
    }
    println!("self-check: {passed}/{total} passed");
    total - passed
}

fn check_numeric_ordering() -> Result<()> {
    let mut stems = vec!["t10".to_string(), "t1".to_string(), "t2".to_string()];
    stems.sort_by_key(|stem| natural_key(stem));
    if stems != ["t1", "t2", "t10"] {
        bail!("got {stems:?}");
    }
    Ok(())
}

fn check_mixed_key() -> Result<()> {
    if natural_key("a2b") >= natural_key("a10b") {
        bail!("a2b did not sort before a10b");
    }
    if natural_key("case7x") != natural_key("case7x") {
        bail!("key extraction is not stable");
    }
    Ok(())
}

fn check_arg_quoting() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(dir.path().join("q.args"), "-x foo \"bar baz\"\n")?;
    let args = Fixture::new("q", dir.path()).args()?;
    if args != ["-x", "foo", "bar baz"] {
        bail!("got {args:?}");
    }
    Ok(())
}

fn check_sidecar_defaults() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = Fixture::new("bare", dir.path());
    if !fixture.args()?.is_empty() {
        bail!("missing .args did not default to no arguments");
    }
    if fixture.expected_ret()? != 0 {
        bail!("missing .ret did not default to 0");
    }
    Ok(())
}

fn check_verbatim_read() -> Result<()> {
    let dir = TempDir::new()?;
    let bytes = b"spaces  \n\ttabs\nno final newline";
    fs::write(dir.path().join("raw.out"), bytes)?;
    if Fixture::new("raw", dir.path()).expected_stdout()? != bytes {
        bail!("expected output was not read byte-for-byte");
    }
    Ok(())
}

// --------------------- Coverage gate ---------------------------------------
// Line coverage is delegated to kcov: each fixture is re-invoked under it
// after the behavioral run already judged the outputs, the per-fixture
// traces are merged, and the merged codecov report is scanned for lines
// with zero hits.
struct CoverageGate {
    kcov: PathBuf,
    out_root: PathBuf,
    runs: Vec<PathBuf>,
}

impl CoverageGate {
    fn new(out_root: PathBuf) -> Result<Self> {
        let kcov = which::which("kcov").context("kcov not found on PATH")?;
        fs::create_dir_all(&out_root)
            .with_context(|| format!("creating {}", out_root.display()))?;
        Ok(Self {
            kcov,
            out_root,
            runs: Vec::new(),
        })
    }

    fn record(&mut self, harness: &Harness, fixture: &Fixture) -> Result<()> {
        let run_dir = self.out_root.join(&fixture.stem);
        let status = Command::new(&self.kcov)
            .arg(&run_dir)
            .arg(&harness.cols)
            .args(fixture.args()?)
            .stdin(Stdio::from(fixture.stdin()?))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("spawning {:?}", self.kcov))?;
        // kcov mirrors the child's exit code, which may legitimately be
        // non-zero here; the plain run already judged the behavior.
        if VERBOSE.load(Ordering::Relaxed) {
            println!("[COV ] {} -> status {:?}", fixture.stem, status.code());
        }
        self.runs.push(run_dir);
        Ok(())
    }

    fn analyze(&self) -> Result<()> {
        if self.runs.is_empty() {
            bail!("no coverage traces were recorded");
        }
        let merged = self.out_root.join("merged");
        let mut command = Command::new(&self.kcov);
        command.arg("--merge").arg(&merged);
        for run in &self.runs {
            command.arg(run);
        }
        let status = command
            .status()
            .with_context(|| format!("spawning {:?}", self.kcov))?;
        if !status.success() {
            bail!("kcov --merge exited with status {:?}", status.code());
        }

        let report = WalkDir::new(&merged)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .find(|entry| entry.file_name() == "codecov.json")
            .context("no codecov.json in the merged kcov output")?;
        let text = fs::read_to_string(report.path())
            .with_context(|| format!("reading {}", report.path().display()))?;
        let gaps = uncovered_lines(&text)?;
        if gaps.is_empty() {
            println!("full line coverage");
            return Ok(());
        }
        for (file, lines) in &gaps {
            let rendered = lines
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            println!("missing coverage in {file}: lines {rendered}");
        }
        bail!("line coverage incomplete");
    }
}

/// Scans a codecov-format report for instrumentable lines with zero hits.
/// Each file maps to an array indexed by line number; null entries are not
/// instrumentable and are skipped.
fn uncovered_lines(report: &str) -> Result<Vec<(String, Vec<usize>)>> {
    let value: serde_json::Value =
        serde_json::from_str(report).context("parsing codecov.json")?;
    let files = value
        .get("coverage")
        .and_then(serde_json::Value::as_object)
        .context("codecov.json has no coverage map")?;
    let mut gaps = Vec::new();
    for (file, lines) in files {
        let Some(lines) = lines.as_array() else {
            continue;
        };
        let missing: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, hits)| hits.as_u64() == Some(0))
            .map(|(line, _)| line)
            .collect();
        if !missing.is_empty() {
            gaps.push((file.clone(), missing));
        }
    }
    gaps.sort();
    Ok(gaps)
}
