use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitCode, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(author, version, about = "rael golden-output test harness", long_about = None)]
struct Cli {
    /// Interpreter under test
    #[arg(long, env = "RAEL_PATH", default_value = "build/rael")]
    rael: PathBuf,
    /// Directory holding testN.<ext> and testN.<ext>.exp pairs
    #[arg(long, env = "RAEL_TEST_DIR", default_value = "tests")]
    test_dir: PathBuf,
    /// Source extension of test inputs
    #[arg(long, default_value = "rael")]
    ext: String,
    /// How the test path is handed to the interpreter
    #[arg(long, value_enum, default_value_t = ArgStyle::Positional)]
    arg_style: ArgStyle,
    /// What happens to the interpreter's stderr
    #[arg(long, value_enum, default_value_t = StderrMode::Merge)]
    stderr: StderrMode,
    /// Kill a test after this many seconds (0 waits forever)
    #[arg(long, default_value_t = 0)]
    timeout: u64,
    /// Print per-test execution details
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ArgStyle {
    /// rael <path>
    Positional,
    /// rael --file <path>
    Flag,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StderrMode {
    /// Interleave stderr with stdout in the compared output
    Merge,
    /// Discard stderr
    Ignore,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let harness = Harness::new(Config::from(cli))?;
    let summary = harness.run(&mut io::stdout().lock())?;
    if summary.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

// --------------------- Shared harness --------------------------------------
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct Config {
    rael: PathBuf,
    test_dir: PathBuf,
    ext: String,
    arg_style: ArgStyle,
    stderr: StderrMode,
    timeout: Option<Duration>,
    verbose: bool,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            rael: cli.rael,
            test_dir: cli.test_dir,
            ext: cli.ext,
            arg_style: cli.arg_style,
            stderr: cli.stderr,
            timeout: (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout)),
            verbose: cli.verbose,
        }
    }
}

struct Harness {
    /// `config.rael` holds the resolved interpreter path.
    config: Config,
}

impl Harness {
    /// Resolves the interpreter up front so a missing binary aborts the run
    /// before any test is reported.
    fn new(mut config: Config) -> Result<Self> {
        config.rael = which::which(&config.rael)
            .with_context(|| format!("rael interpreter not found at {:?}", config.rael))?;
        Ok(Self { config })
    }

    /// Runs every discovered test in order, writing the report to `out`.
    fn run<W: Write>(&self, out: &mut W) -> Result<Summary> {
        let mut summary = Summary::default();
        let verbose = self.config.verbose;
        for item in discover(&self.config.test_dir, &self.config.ext, verbose, out)? {
            match item {
                Discovered::MissingExpected { name } => {
                    writeln!(out, "no expected-output file for '{name}'")?;
                }
                Discovered::Case(case) => {
                    let result = self.execute(&case, out)?;
                    report(out, &result)?;
                    if !result.passed() {
                        summary.failed.push(result.number);
                    }
                }
            }
        }
        if let Some(line) = summary.line() {
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        Ok(summary)
    }

    fn execute<W: Write>(&self, case: &TestCase, log: &mut W) -> Result<RunResult> {
        let output = self.run_rael(&case.input, log)?;
        let expected = fs::read(&case.expected)
            .with_context(|| format!("reading {:?}", case.expected))?;
        Ok(RunResult {
            number: case.number,
            output: output.stdout,
            expected,
            timed_out: match output.status {
                Some(_) => None,
                None => self.config.timeout,
            },
        })
    }

    fn command(&self, input: &Path) -> Command {
        let mut command = Command::new(&self.config.rael);
        match self.config.arg_style {
            ArgStyle::Positional => command.arg(input),
            ArgStyle::Flag => command.arg("--file").arg(input),
        };
        command
    }

    fn run_rael<W: Write>(&self, input: &Path, log: &mut W) -> Result<CmdOutput> {
        let rael = &self.config.rael;
        let (mut reader, writer) = io::pipe().context("creating output pipe")?;
        let mut command = self.command(input);
        command.stdin(Stdio::null());
        if self.config.timeout.is_some() {
            // Own group, so a timeout can take down anything the interpreter spawned.
            command.process_group(0);
        }
        match self.config.stderr {
            StderrMode::Merge => command.stdout(writer.try_clone()?).stderr(writer),
            StderrMode::Ignore => command.stdout(writer).stderr(Stdio::null()),
        };
        let spawned = command.spawn();
        // `command` still owns write ends of the pipe; the reader only sees EOF once they close.
        drop(command);
        let mut child = spawned.with_context(|| format!("spawning {rael:?}"))?;

        let collector = thread::spawn(move || -> io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(buf)
        });
        let status = match self.config.timeout {
            Some(limit) => wait_with_deadline(&mut child, limit)?,
            None => Some(child.wait()?),
        };
        let stdout = collector
            .join()
            .map_err(|_| anyhow!("output reader for {input:?} panicked"))?
            .with_context(|| format!("reading output of {rael:?}"))?;

        if self.config.verbose {
            writeln!(
                log,
                "[CMD ] {:?} {:?} -> status {:?}, output {}B",
                rael,
                input,
                status.and_then(|s| s.code()),
                stdout.len()
            )?;
        }
        Ok(CmdOutput { status, stdout })
    }
}

// --------------------- Discovery ------------------------------------------
#[derive(Debug, PartialEq, Eq)]
struct TestCase {
    number: u32,
    input: PathBuf,
    expected: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
enum Discovered {
    Case(TestCase),
    MissingExpected { name: String },
}

/// Walks test1, test2, ... until the first number without an input file.
fn discover<W: Write>(dir: &Path, ext: &str, verbose: bool, log: &mut W) -> Result<Vec<Discovered>> {
    let mut files = list_dir(dir)?;
    if verbose {
        writeln!(log, "[SCAN] {:?}: {} entries", dir, files.len())?;
    }
    let mut found = Vec::new();
    for number in 1u32.. {
        let name = format!("test{number}.{ext}");
        if !files.remove(&name) {
            break;
        }
        let exp = format!("{name}.exp");
        if files.contains(&exp) {
            found.push(Discovered::Case(TestCase {
                number,
                input: dir.join(&name),
                expected: dir.join(exp),
            }));
        } else {
            found.push(Discovered::MissingExpected { name });
        }
    }
    Ok(found)
}

fn list_dir(dir: &Path) -> Result<HashSet<String>> {
    let mut names = HashSet::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("listing {dir:?}"))?;
        if let Some(name) = entry.file_name().to_str() {
            names.insert(name.to_owned());
        }
    }
    Ok(names)
}

// --------------------- Reporting ------------------------------------------
struct CmdOutput {
    /// `None` when the child was killed at the deadline.
    status: Option<ExitStatus>,
    stdout: Vec<u8>,
}

struct RunResult {
    number: u32,
    output: Vec<u8>,
    expected: Vec<u8>,
    timed_out: Option<Duration>,
}

impl RunResult {
    fn passed(&self) -> bool {
        self.timed_out.is_none() && self.output == self.expected
    }
}

fn report<W: Write>(out: &mut W, result: &RunResult) -> io::Result<()> {
    let n = result.number;
    if let Some(limit) = result.timed_out {
        writeln!(out, "Test {n} timed out after {limit:?}!")?;
        writeln!(out, "output:")?;
        writeln!(out, "{}", String::from_utf8_lossy(&result.output))?;
    } else if result.passed() {
        writeln!(out, "Test {n} passed!")?;
    } else {
        writeln!(out, "Test {n} failed!")?;
        writeln!(out, "expected:")?;
        writeln!(out, "{}", String::from_utf8_lossy(&result.expected))?;
        writeln!(out, "output:")?;
        writeln!(out, "{}", String::from_utf8_lossy(&result.output))?;
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    failed: Vec<u32>,
}

impl Summary {
    fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn line(&self) -> Option<String> {
        if self.is_clean() {
            return None;
        }
        let numbers: Vec<String> = self.failed.iter().map(u32::to_string).collect();
        Some(format!("Failed tests: {}", numbers.join(", ")))
    }
}

// --------------------- Helpers --------------------------------------------
fn wait_with_deadline(child: &mut Child, limit: Duration) -> Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= limit {
            // The child leads its own group, so its pid is the group id.
            let group = Pid::from_raw(child.id() as i32);
            match killpg(group, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => return Err(err).context("killing timed-out interpreter"),
            }
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
