#[cfg(not(unix))]
fn main() {
    eprintln!("procduplex requires a Unix system (fork/exec). This binary was built for another target.");
    std::process::exit(1);
}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::run()
}

#[cfg(unix)]
mod unix {
    use std::time::Duration;

    use anyhow::Context;
    use clap::{Args, Parser, Subcommand};
    use colored::Colorize;
    use rustyline::DefaultEditor;

    use procduplex::logging;
    use procduplex::pipeline::{self, PipelineSpec};
    use procduplex::{Channel, DetectStrategy, LaunchOptions};

    #[derive(Parser)]
    #[command(name = "procduplex", about = "Talk to a child process over its stdin/stdout")]
    struct Cli {
        /// Log level (error, warn, info, debug, trace); overrides PROCDUPLEX_LOG
        #[arg(long, global = true, value_parser = parse_level)]
        log_level: Option<tracing::Level>,

        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Start a program and exchange lines with it interactively
        Run(RunArgs),
        /// Feed one program's output into another for a fixed time
        Pipeline(PipelineArgs),
    }

    #[derive(Args)]
    struct RunArgs {
        /// How exec failures are detected: drain or signal
        #[arg(long, default_value = "drain")]
        strategy: DetectStrategy,

        /// Skip the start-up handshake
        #[arg(long)]
        no_handshake: bool,

        /// Handshake timeout in milliseconds
        #[arg(long, default_value_t = 1000)]
        handshake_timeout_ms: u64,

        /// Lines to read back after each line sent
        #[arg(long, default_value_t = 1)]
        replies: usize,

        /// Program and its arguments
        #[arg(trailing_var_arg = true, required = true)]
        program: Vec<String>,
    }

    #[derive(Args)]
    struct PipelineArgs {
        /// Producer command line (split on whitespace)
        #[arg(long)]
        producer: String,

        /// Consumer command line (split on whitespace)
        #[arg(long)]
        consumer: String,

        /// How long the producer runs before SIGTERM, in milliseconds
        #[arg(long, default_value_t = 1000)]
        duration_ms: u64,
    }

    fn parse_level(s: &str) -> Result<tracing::Level, String> {
        logging::parse_level(s).ok_or_else(|| format!("unknown log level: {}", s))
    }

    pub fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        logging::init_logging(cli.log_level);

        match cli.command {
            Command::Run(args) => cmd_run(args),
            Command::Pipeline(args) => cmd_pipeline(args),
        }
    }

    fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
        let opts = LaunchOptions::default()
            .with_strategy(args.strategy)
            .with_handshake(!args.no_handshake)
            .with_handshake_timeout(Duration::from_millis(args.handshake_timeout_ms));

        let mut channel = Channel::spawn_with(&args.program, opts)
            .with_context(|| format!("failed to start {}", args.program[0]))?;
        println!(
            "{} started {} (pid {})",
            "procduplex".bold().cyan(),
            channel.program(),
            channel.pid()
        );

        let mut rl = DefaultEditor::new()?;
        loop {
            let prompt = format!("{} ", ">".bold().green());
            let line = match rl.readline(&prompt) {
                Ok(line) => line,
                Err(
                    rustyline::error::ReadlineError::Interrupted
                    | rustyline::error::ReadlineError::Eof,
                ) => break,
                Err(e) => {
                    eprintln!("readline error: {}", e);
                    break;
                }
            };
            rl.add_history_entry(line.as_str())?;

            if let Err(e) = exchange(&mut channel, &line, args.replies) {
                eprintln!("{}: {}", "error".red(), e);
                break;
            }
        }

        channel.close_input();
        loop {
            let rest = channel.read_line()?;
            if rest.is_empty() {
                break;
            }
            print!("{}", rest);
        }
        let status = channel.wait()?;
        println!("{} child {}", "procduplex".bold().cyan(), status);
        Ok(())
    }

    fn exchange(channel: &mut Channel, line: &str, replies: usize) -> procduplex::Result<()> {
        channel.write_line(line)?;
        for _ in 0..replies {
            let reply = channel.read_line()?;
            if reply.is_empty() {
                println!("{}", "(end of output)".yellow());
                break;
            }
            print!("{}", reply);
            if !reply.ends_with('\n') {
                println!();
            }
        }
        Ok(())
    }

    fn cmd_pipeline(args: PipelineArgs) -> anyhow::Result<()> {
        let split = |s: &str| s.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        let spec = PipelineSpec {
            producer: split(&args.producer),
            consumer: split(&args.consumer),
            duration: Duration::from_millis(args.duration_ms),
        };

        let report = pipeline::run(&spec)?;
        for line in &report.output {
            println!("{}", line);
        }
        eprintln!("{}", report.producer);
        eprintln!("{}", report.consumer);

        if let Err(failure) = report.check() {
            eprintln!("{}: {}", "error".red(), failure);
            std::process::exit(match failure {
                pipeline::StageFailure::Abnormal { .. } => 3,
                pipeline::StageFailure::NonZero { .. } => 4,
            });
        }
        Ok(())
    }
}
