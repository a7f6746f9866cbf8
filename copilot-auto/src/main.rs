//! `copilot-auto`: run the Copilot CLI unattended within iteration and time
//! limits, and pick up the repository's previous session when asked.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use copilot_auto::core::monitor::{RunReport, StopReason};
use copilot_auto::core::types::{OutputStream, RunConfig, SessionMode};
use copilot_auto::exit_codes;
use copilot_auto::io::config::{default_config_path, load_config};
use copilot_auto::io::supervisor::{CancelToken, RunEvent};
use copilot_auto::logging;
use copilot_auto::run::{ChildExitError, RunContext, run_direct, run_interactive};

#[derive(Parser, Debug)]
#[command(
    name = "copilot-auto",
    version,
    about = "Run the Copilot CLI unattended with iteration and time limits"
)]
struct Cli {
    /// Prompt to send. Without one the program starts interactively.
    prompt: Option<String>,

    /// Use a custom config file instead of `~/.copilot-auto/config.toml`.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stop after this many output chunks.
    #[arg(long, value_name = "N")]
    max_iterations: Option<u32>,

    /// Stop after this many milliseconds.
    #[arg(long, value_name = "MS")]
    max_duration: Option<u64>,

    /// Model passed to the program (empty to use the program's default).
    #[arg(long)]
    model: Option<String>,

    /// Allow access to all file paths.
    #[arg(long)]
    allow_all_paths: bool,

    /// Allow a specific tool (repeatable).
    #[arg(long = "allow-tool", value_name = "TOOL")]
    allow_tools: Vec<String>,

    /// Deny a specific tool (repeatable).
    #[arg(long = "deny-tool", value_name = "TOOL")]
    deny_tools: Vec<String>,

    /// Do not answer confirmation prompts.
    #[arg(long)]
    no_auto_approve: bool,

    /// Continue this repository's last session.
    #[arg(long = "continue", conflicts_with = "resume")]
    continue_session: bool,

    /// Resume a session: `--resume=<id>`, or `--resume` for the last one.
    #[arg(long, value_name = "ID", num_args = 0..=1, require_equals = true)]
    resume: Option<Option<String>>,

    /// Start in interactive mode (default if no prompt given).
    #[arg(long, conflicts_with = "direct")]
    interactive: bool,

    /// Run the prompt and exit (default if a prompt is given).
    #[arg(long)]
    direct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Interactive,
    Direct,
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.interactive {
            Mode::Interactive
        } else if self.direct || self.prompt.is_some() {
            Mode::Direct
        } else {
            Mode::Interactive
        }
    }

    /// Overlay command-line flags on the file config.
    fn apply(&self, config: &mut RunConfig) {
        if let Some(max) = self.max_iterations {
            config.max_iterations = max;
        }
        if let Some(max) = self.max_duration {
            config.max_duration_ms = max;
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if self.allow_all_paths {
            config.allow_all_paths = true;
        }
        config.allowed_tools.extend(self.allow_tools.iter().cloned());
        config.denied_tools.extend(self.deny_tools.iter().cloned());
        if self.no_auto_approve {
            config.auto_approve = false;
        }
        if self.continue_session {
            config.session_mode = SessionMode::Continue;
        }
        if let Some(target) = &self.resume {
            config.session_mode = SessionMode::Resume;
            config.resume_target = target.clone();
        }
    }
}

fn main() {
    logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Keep clap's usage errors off the child-failure exit code.
            let code = if err.use_stderr() {
                exit_codes::ERROR
            } else {
                exit_codes::OK
            };
            if let Err(print_err) = err.print() {
                tracing::debug!(error = %print_err, "failed to print usage");
            }
            std::process::exit(code);
        }
    };
    let cancel = CancelToken::new();
    let code = match run(cli, &cancel) {
        Ok(report) => report_exit_code(&report),
        Err(err) => {
            if let Some(exit) = err.downcast_ref::<ChildExitError>() {
                eprintln!("copilot-auto: {exit}");
                if cancel.is_cancelled() {
                    exit_codes::INTERRUPTED
                } else {
                    exit_codes::CHILD_FAILED
                }
            } else {
                eprintln!("copilot-auto: {err:#}");
                exit_codes::ERROR
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli, cancel: &CancelToken) -> Result<RunReport> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) => load_config(&path)?,
        None => RunConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("install Ctrl-C handler")?;

    let workdir = std::env::current_dir().context("resolve working directory")?;
    let ctx = RunContext::for_config(&config, workdir);
    eprintln!(
        "copilot-auto: limits {} iterations, {}s duration",
        config.max_iterations,
        config.max_duration_ms / 1000
    );

    match cli.mode() {
        Mode::Direct => {
            let Some(prompt) = cli.prompt.as_deref() else {
                bail!("--direct requires a prompt");
            };
            run_direct(&config, prompt, &ctx, cancel, print_event)
        }
        Mode::Interactive => {
            run_interactive(&config, cli.prompt.as_deref(), &ctx, cancel, print_event)
        }
    }
}

fn report_exit_code(report: &RunReport) -> i32 {
    if report.stop_reason == Some(StopReason::Interrupted) {
        exit_codes::INTERRUPTED
    } else if report.success() {
        exit_codes::OK
    } else {
        exit_codes::CHILD_FAILED
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Started { argv } => {
            eprintln!("copilot-auto: started {}", argv.join(" "));
        }
        RunEvent::Output { stream, bytes } => {
            // A closed terminal must not stop supervision.
            match stream {
                OutputStream::Stdout => forward_output(std::io::stdout().lock(), *stream, bytes),
                OutputStream::Stderr => forward_output(std::io::stderr().lock(), *stream, bytes),
            }
        }
        RunEvent::AutoApproved => eprintln!("copilot-auto: auto-approved prompt"),
        RunEvent::SessionCaptured { id } => eprintln!("copilot-auto: session {id}"),
        RunEvent::LimitExceeded(exceeded) => eprintln!("copilot-auto: {exceeded}, stopping"),
        RunEvent::Interrupted => eprintln!("copilot-auto: interrupted, stopping"),
        RunEvent::Stopping => {}
        RunEvent::ForceKilled => eprintln!("copilot-auto: child ignored SIGTERM, killed"),
        RunEvent::Exited(report) => {
            let code = report
                .exit_code
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            eprintln!(
                "copilot-auto: exited ({code}) after {} iterations in {:.1}s",
                report.iterations,
                report.elapsed.as_secs_f64()
            );
        }
    }
}

fn forward_output<W: Write>(mut out: W, stream: OutputStream, bytes: &[u8]) {
    if let Err(err) = out.write_all(bytes).and_then(|()| out.flush()) {
        tracing::debug!(?stream, error = %err, "dropped forwarded output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn forwarding_writes_bytes_through() {
        let mut sink = Vec::new();
        forward_output(&mut sink, OutputStream::Stdout, b"hello\n");
        assert_eq!(sink, b"hello\n");
    }

    #[test]
    fn forwarding_to_a_closed_pipe_is_dropped() {
        forward_output(ClosedPipe, OutputStream::Stderr, b"lost");
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("copilot-auto").chain(args.iter().copied()))
            .expect("parse")
    }

    #[test]
    fn prompt_defaults_to_direct_mode() {
        assert_eq!(parse(&["fix the tests"]).mode(), Mode::Direct);
        assert_eq!(parse(&[]).mode(), Mode::Interactive);
        assert_eq!(parse(&["--interactive", "hello"]).mode(), Mode::Interactive);
    }

    #[test]
    fn flags_override_file_config() {
        let cli = parse(&[
            "--max-iterations",
            "100",
            "--max-duration",
            "3600000",
            "--model",
            "gpt-5",
            "--allow-all-paths",
            "--deny-tool",
            "shell(rm *)",
            "--deny-tool",
            "shell(git push)",
            "--no-auto-approve",
            "refactor",
        ]);
        let mut config = RunConfig {
            denied_tools: vec!["write".to_string()],
            ..RunConfig::default()
        };
        cli.apply(&mut config);

        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.max_duration_ms, 3_600_000);
        assert_eq!(config.model, "gpt-5");
        assert!(config.allow_all_paths);
        assert!(!config.auto_approve);
        assert_eq!(
            config.denied_tools,
            vec!["write", "shell(rm *)", "shell(git push)"]
        );
        assert_eq!(cli.prompt.as_deref(), Some("refactor"));
    }

    #[test]
    fn resume_accepts_optional_id() {
        let mut config = RunConfig::default();
        parse(&["--resume"]).apply(&mut config);
        assert_eq!(config.session_mode, SessionMode::Resume);
        assert_eq!(config.resume_target, None);

        let mut config = RunConfig::default();
        parse(&["--resume=abc-123", "go on"]).apply(&mut config);
        assert_eq!(config.session_mode, SessionMode::Resume);
        assert_eq!(config.resume_target.as_deref(), Some("abc-123"));
    }

    #[test]
    fn continue_sets_session_mode() {
        let mut config = RunConfig::default();
        parse(&["--continue"]).apply(&mut config);
        assert_eq!(config.session_mode, SessionMode::Continue);
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        assert!(Cli::try_parse_from(["copilot-auto", "--continue", "--resume"]).is_err());
        assert!(Cli::try_parse_from(["copilot-auto", "--interactive", "--direct"]).is_err());
    }

    #[test]
    fn exit_code_reflects_report() {
        let report = RunReport {
            exit_code: Some(0),
            iterations: 1,
            elapsed: std::time::Duration::ZERO,
            session_id: None,
            stop_reason: None,
        };
        assert_eq!(report_exit_code(&report), exit_codes::OK);
        assert_eq!(
            report_exit_code(&RunReport {
                exit_code: Some(1),
                ..report.clone()
            }),
            exit_codes::CHILD_FAILED
        );
        assert_eq!(
            report_exit_code(&RunReport {
                exit_code: None,
                stop_reason: Some(StopReason::Interrupted),
                ..report
            }),
            exit_codes::INTERRUPTED
        );
    }
}
