use async_trait::async_trait;
use labshell::{
    Arg, AutobootConfig, BootCommand, Error, HostPowerControl, LoginConfig, Machine,
    MachineBuilder, NestedConnector, Pivot, Reuse, Special, TransportConnector, cmd, null_sink,
};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

fn bash() -> TransportConnector {
    let args: Vec<String> = ["--norc", "--noprofile", "--noediting"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    TransportConnector::pty("bash", &args)
}

async fn lab() -> Machine {
    MachineBuilder::new("lab")
        .connector(bash())
        .timeout(Duration::from_secs(10))
        .sink(null_sink())
        .acquire()
        .await
        .expect("Failed to start local bash")
}

/// Turns a lab shell into an emulated board: a bash with a U-Boot like
/// prompt, currently counting down to autoboot.
///
/// Prompts are split in quotes so the echoed script never contains them.
struct EmulatedBoard;

const BOARD_SCRIPT: &[&str] = &[
    "bash --norc --noprofile --noediting; exit",
    "unset HISTFILE",
    "PS1='Test-U-''Boot> '",
    "bash --norc --noprofile --noediting",
    "unset HISTFILE",
    "read -p 'Auto''boot: '; exit",
];

#[async_trait]
impl Pivot for EmulatedBoard {
    async fn enter(&mut self, lab: &mut Machine) -> labshell::Result<()> {
        for line in BOARD_SCRIPT {
            lab.boot(&[Arg::from(Special::raw(*line)?)]).await?;
        }
        Ok(())
    }
}

/// A powered emulated board. The power switch is a marker file on the lab.
async fn board(marker: &std::path::Path) -> Machine {
    let mut console_host = lab().await;
    let power_host = console_host.clone_session().await.unwrap();

    let switch = power_host.path(marker.to_string_lossy());
    let power = HostPowerControl::new(
        power_host,
        cmd!["touch", &switch],
        cmd!["rm", "-f", &switch],
    );

    MachineBuilder::new("board")
        .connector(NestedConnector::new(console_host, EmulatedBoard))
        .power(power)
        .no_shell()
        .sink(null_sink())
        .acquire()
        .await
        .expect("Failed to acquire emulated board")
}

async fn uboot(board: Machine) -> labshell::Result<Machine> {
    MachineBuilder::new("u-boot")
        .connector(NestedConnector::new(board, Reuse))
        .autoboot(
            AutobootConfig::default()
                .prompt("Autoboot: ")
                .window(Duration::from_secs(10)),
        )
        .prompt("Test-U-Boot> ")
        .timeout(Duration::from_secs(10))
        .sink(null_sink())
        .acquire()
        .await
}

fn linux_over(parent: Machine, boot: &str, login: LoginConfig) -> labshell::Result<MachineBuilder> {
    Ok(MachineBuilder::new("linux")
        .connector(NestedConnector::new(
            parent,
            BootCommand::new(cmd![Special::raw(boot)?]),
        ))
        .login(login.login_prompt("tb-login: "))
        .timeout(Duration::from_secs(10))
        .sink(null_sink()))
}

fn marker_in(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("selftest_power")
}

#[tokio::test]
async fn test_exec_on_local_shell() {
    let mut lab = lab().await;

    assert_eq!(
        lab.exec0(&cmd!["echo", "hello world"]).await.unwrap(),
        "hello world\n"
    );

    let (status, output) = lab
        .exec(&cmd!["sh", "-c", "echo oops >&2; exit 3"])
        .await
        .unwrap();
    assert_eq!(status, 3);
    assert_eq!(output, "oops\n");

    let err = lab.exec0(&cmd!["false"]).await.unwrap_err();
    assert!(matches!(err, Error::CommandFailed { status: 1, .. }));

    let (status, output) = lab.exec(&cmd!["true"]).await.unwrap();
    assert_eq!((status, output.as_str()), (0, ""));

    lab.exit().await.unwrap();
}

#[tokio::test]
async fn test_arguments_stay_single_words() {
    let mut lab = lab().await;
    let words = ["a b", "$HOME", "it's", "`id`", "semi;colon", "*", "", "tab\there"];

    let mut args = cmd!["printf", "<%s>\\n"];
    args.extend(words.iter().map(|w| Arg::from(*w)));
    let output = lab.exec0(&args).await.unwrap();

    let expected: String = words.iter().map(|w| format!("<{w}>\n")).collect();
    assert_eq!(output, expected);
    lab.exit().await.unwrap();
}

#[tokio::test]
async fn test_workdir_paths_and_redirection() {
    let tmp = tempfile::tempdir().unwrap();
    let local_wd = tmp.path().join("wd");

    let mut lab = MachineBuilder::new("lab")
        .connector(bash())
        .workdir(local_wd.to_string_lossy())
        .sink(null_sink())
        .acquire()
        .await
        .unwrap();

    let wd = lab.workdir().await.unwrap();
    assert!(local_wd.is_dir());

    let file = &wd / "out file.txt";
    lab.exec0(&cmd!["echo", "data", Special::redirect_stdout(&file)])
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(local_wd.join("out file.txt")).unwrap(),
        "data\n"
    );
    assert!(lab.path_exists(&file).await.unwrap());
    assert!(!lab.path_exists(&(&wd / "missing")).await.unwrap());

    lab.exec0(&cmd![
        "sh",
        "-c",
        "echo err >&2",
        Special::STDERR_TO_STDOUT,
        Special::PIPE,
        "tr",
        "a-z",
        "A-Z",
        Special::append_stdout(&file)
    ])
    .await
    .unwrap();
    assert_eq!(lab.exec0(&cmd!["cat", &file]).await.unwrap(), "data\nERR\n");

    lab.exit().await.unwrap();
}

#[tokio::test]
async fn test_clone_and_foreign_paths() {
    let mut lab = lab().await;
    let mut other = lab.clone_session().await.unwrap();
    assert_ne!(lab.id(), other.id());

    let tmp = lab.path("/tmp");
    assert!(matches!(
        other.exec(&cmd!["ls", &tmp]).await,
        Err(Error::WrongHost { .. })
    ));
    assert!(!other.env("BASH_VERSION").await.unwrap().is_empty());

    other.exit().await.unwrap();
    lab.exit().await.unwrap();
}

#[tokio::test]
async fn test_uboot_autoboot_interception() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ub = uboot(board(&marker_in(&tmp)).await).await.unwrap();

    assert_eq!(ub.parent_name(), Some("board"));
    assert_eq!(ub.exec0(&cmd!["echo", "0x1234"]).await.unwrap(), "0x1234\n");
    assert!(matches!(
        ub.clone_session().await.err().unwrap(),
        Error::UnsupportedOperation { .. }
    ));

    ub.exit().await.unwrap();
}

#[tokio::test]
async fn test_power_is_switched_off_on_every_path() {
    let tmp = tempfile::tempdir().unwrap();
    let marker = marker_in(&tmp);

    // Normal run
    let ub = uboot(board(&marker).await).await.unwrap();
    assert!(marker.exists());
    ub.exit().await.unwrap();
    assert!(!marker.exists());

    // Failing run
    let ub = uboot(board(&marker).await).await.unwrap();
    let seen = marker.clone();
    let err = ub
        .scope(move |_| {
            Box::pin(async move {
                assert!(seen.exists());
                Err::<(), _>(Error::InvalidArgument("injected failure".into()))
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
    assert!(!marker.exists());

    // Panicking run
    let ub = uboot(board(&marker).await).await.unwrap();
    let seen = marker.clone();
    let joined = tokio::spawn(ub.scope(move |_| Box::pin(fail_loudly(seen)))).await;
    assert!(joined.unwrap_err().is_panic());
    assert!(!marker.exists());

    // Cancelled run: switching off happens in the background.
    let ub = uboot(board(&marker).await).await.unwrap();
    let scoped = ub.scope(|_| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
    });
    assert!(
        tokio::time::timeout(Duration::from_secs(1), scoped)
            .await
            .is_err()
    );
    assert!(wait_for_removal(&marker).await);
}

async fn fail_loudly(marker: PathBuf) -> labshell::Result<()> {
    assert!(marker.exists());
    panic!("injected failure")
}

async fn wait_for_removal(marker: &std::path::Path) -> bool {
    for _ in 0..100 {
        if !marker.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_linux_over_uboot_with_password() {
    let tmp = tempfile::tempdir().unwrap();
    let ub = uboot(board(&marker_in(&tmp)).await).await.unwrap();

    let boot = "printf 'tb-''login: '; read username; printf 'Pass''word: '; read password; \
                [[ $username = 'root' && $password = 'rootpw' ]] || exit 1";
    let login = LoginConfig::new("root").unwrap().password("rootpw");
    let lnx = linux_over(ub, boot, login).unwrap().acquire().await.unwrap();

    assert_eq!(lnx.parent_name(), Some("u-boot"));
    let out = lnx
        .scope(|lnx| {
            Box::pin(async move {
                let wd = lnx.workdir().await?;
                lnx.exec0(&cmd!["uname", "-s"]).await?;
                lnx.exec0(&cmd!["ls", "-d", &wd]).await
            })
        })
        .await
        .unwrap();
    assert_eq!(out, "/tmp/labshell-workdir\n");
    assert!(!marker_in(&tmp).exists());
}

#[tokio::test]
async fn test_linux_over_uboot_without_password() {
    let tmp = tempfile::tempdir().unwrap();
    let ub = uboot(board(&marker_in(&tmp)).await).await.unwrap();

    let boot = "printf 'tb-''login: '; read username; [[ $username = 'root' ]] || exit 1";
    let login = LoginConfig::new("root").unwrap();
    let mut lnx = linux_over(ub, boot, login).unwrap().acquire().await.unwrap();

    lnx.exec0(&cmd!["uname", "-a"]).await.unwrap();
    lnx.exit().await.unwrap();
}

#[tokio::test]
async fn test_standalone_login() {
    let tmp = tempfile::tempdir().unwrap();
    let marker = marker_in(&tmp);

    // Straight on the board console, the countdown prompt doubles as login.
    let standalone = |parent| {
        MachineBuilder::new("linux")
            .connector(NestedConnector::new(parent, Reuse))
            .login(
                LoginConfig::new("root")
                    .unwrap()
                    .login_prompt("Autoboot: ")
                    .timeout(Duration::from_secs(2)),
            )
            .sink(null_sink())
    };
    let mut lnx = standalone(board(&marker).await).acquire().await.unwrap();
    lnx.exec0(&cmd!["uname", "-a"]).await.unwrap();
    lnx.exit().await.unwrap();

    // Over U-Boot there is no login prompt: fail instead of hanging.
    let ub = uboot(board(&marker).await).await.unwrap();
    let err = standalone(ub).acquire().await.err().unwrap();
    assert!(
        matches!(err.root(), Error::LoginProtocolMismatch { .. }),
        "{err}"
    );
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_interactive_session_returns_to_shell() {
    let mut lab = lab().await;

    let mut input: &[u8] = b"echo inside-session\nexit\n";
    let mut output: Vec<u8> = Vec::new();
    lab.interactive_with(&mut input, &mut output).await.unwrap();

    let shown = String::from_utf8_lossy(&output);
    assert!(shown.contains("inside-session"), "{shown}");
    assert_eq!(lab.exec0(&cmd!["echo", "after"]).await.unwrap(), "after\n");
    lab.exit().await.unwrap();
}

#[test]
fn test_cli_exec_exits_with_remote_status() {
    let output = Command::new(env!("CARGO_BIN_EXE_labshell"))
        .args(["--command", "bash"])
        .args(["--arg", "--norc", "--arg", "--noprofile", "--arg", "--noediting"])
        .args(["exec", "--", "sh", "-c", "echo from-cli; exit 3"])
        .output()
        .expect("Failed to execute labshell");

    assert_eq!(
        output.status.code(),
        Some(3),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout), "from-cli\n");
}

#[test]
fn test_cli_rejects_bad_timeout() {
    let output = Command::new(env!("CARGO_BIN_EXE_labshell"))
        .args(["--command", "bash", "--timeout", "soon", "exec", "true"])
        .output()
        .expect("Failed to execute labshell");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("soon"));
}
