use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use labshell::config::parse_duration;
use labshell::{
    ASH, Arg, AutobootConfig, BASH, LoginConfig, Machine, MachineBuilder, TransportConnector,
};
use std::io::Write;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "labshell",
    about = "Run commands on a console provided by a local program",
    version
)]
struct Args {
    /// Program that provides the console (a shell, `ssh`, `picocom`, ...)
    #[arg(short, long)]
    command: String,

    /// Argument passed to the console program (repeatable)
    #[arg(short, long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Shell running on the console
    #[arg(long, value_enum, default_value_t = ShellKind::Bash)]
    shell: ShellKind,

    /// Fixed prompt of an interpreter that is not a shell, e.g. "=> "
    #[arg(long)]
    prompt: Option<String>,

    /// Autoboot countdown text to interrupt
    #[arg(long)]
    autoboot: Option<String>,

    /// Log in as this user first
    #[arg(long)]
    user: Option<String>,

    /// Password for --user
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Login prompt to wait for
    #[arg(long, default_value = "login: ")]
    login_prompt: String,

    /// Command timeout (e.g. 500ms, 30s, 2m)
    #[arg(short, long, value_parser = parse_timeout, default_value = "30s")]
    timeout: Duration,

    /// Log every console event
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Run a command and exit with its exit status
    Exec {
        /// Command and arguments, each passed as one word
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Attach the terminal to the console's shell
    Interactive,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ShellKind {
    Bash,
    Ash,
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| format!("{e:#}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "trace" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut builder = MachineBuilder::new(args.command.clone())
        .connector(TransportConnector::pty(&args.command, &args.args))
        .timeout(args.timeout);

    builder = match &args.prompt {
        Some(prompt) => builder.prompt(prompt.as_str()),
        None => builder.dialect(match args.shell {
            ShellKind::Bash => &BASH,
            ShellKind::Ash => &ASH,
        }),
    };
    if let Some(countdown) = &args.autoboot {
        builder = builder.autoboot(AutobootConfig::default().prompt(countdown.as_str()));
    }
    if let Some(user) = &args.user {
        let mut login = LoginConfig::new(user.as_str())?.login_prompt(args.login_prompt.as_str());
        if let Some(password) = &args.password {
            login = login.password(password.as_str());
        }
        builder = builder.login(login);
    }

    let machine = builder
        .acquire()
        .await
        .with_context(|| format!("Failed to acquire console from {}", args.command))?;

    let action = args.action;
    let status = machine
        .scope(move |m| Box::pin(async move { run(m, action).await }))
        .await
        .context("Console session failed")?;

    std::io::stdout().flush()?;
    std::process::exit(status);
}

async fn run(machine: &mut Machine, action: Action) -> labshell::Result<i32> {
    match action {
        Action::Exec { command } => {
            let args: Vec<Arg> = command.iter().map(Arg::from).collect();
            let (status, output) = machine.exec(&args).await?;
            print!("{output}");
            Ok(status)
        }
        Action::Interactive => {
            machine.interactive().await?;
            Ok(0)
        }
    }
}
