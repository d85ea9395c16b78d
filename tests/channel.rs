use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag};

use procduplex::detect::signal;
use procduplex::{Channel, DetectStrategy, Error, ExitStatus, LaunchOptions};

// Signal-strategy launches install a process-wide SIGCHLD handler.
static SIGNAL_GUARD: Mutex<()> = Mutex::new(());

const MISSING: &str = "procduplex-definitely-not-installed";

fn lenient() -> LaunchOptions {
    LaunchOptions::default().with_grace(Duration::from_millis(300))
}

#[test]
fn empty_arguments_are_a_contract_violation() {
    let args: [&str; 0] = [];
    let err = Channel::spawn(&args).unwrap_err();
    assert!(matches!(err, Error::ContractViolation(_)));
    assert_eq!(err.errno(), None);
}

#[test]
fn real_program_starts_and_runs() {
    let mut ch = Channel::spawn(&["cat"]).unwrap();
    assert!(ch.pid().as_raw() > 0);
    assert_eq!(ch.try_wait().unwrap(), None);
}

#[test]
fn echo_round_trip() {
    let mut ch = Channel::spawn(&["cat"]).unwrap();
    ch.write("hello\n").unwrap();
    assert_eq!(ch.read_line().unwrap(), "hello\n");
}

#[test]
fn many_lines_in_order() {
    let mut ch = Channel::spawn(&["cat"]).unwrap();
    for i in 0..200 {
        ch.write_line(format!("line {}", i)).unwrap();
        assert_eq!(ch.read_line().unwrap(), format!("line {}\n", i));
    }
}

#[test]
fn arguments_are_passed_verbatim() {
    let mut ch = Channel::spawn(&["printf", "%s|%s\\n", "a b", "c"]).unwrap();
    assert_eq!(ch.read_line().unwrap(), "a b|c\n");
    assert_eq!(ch.read_line().unwrap(), "");
}

#[test]
fn line_split_across_writes_is_returned_once() {
    let mut ch = Channel::spawn(&["sh", "-c", "printf ab; sleep 0.1; printf 'c\\n'"]).unwrap();
    assert_eq!(ch.read_line().unwrap(), "abc\n");
    assert_eq!(ch.read_line().unwrap(), "");
}

#[test]
fn end_of_stream_returns_partial_then_empty() {
    let mut ch = Channel::spawn(&["sh", "-c", "printf tail"]).unwrap();
    assert_eq!(ch.read_line().unwrap(), "tail");
    assert_eq!(ch.read_line().unwrap(), "");
    assert_eq!(ch.wait().unwrap(), ExitStatus::Exited(0));
}

#[test]
fn binary_output_survives() {
    let mut ch = Channel::spawn(&["printf", "\\377\\001\\n"]).unwrap();
    assert_eq!(ch.read_line_bytes().unwrap(), vec![0xff, 0x01, b'\n']);
}

#[test]
fn missing_program_reports_enoent() {
    let err = Channel::spawn_with(&[MISSING], lenient()).unwrap_err();
    assert!(err.is_exec_failure(), "got {:?}", err);
    assert_eq!(err.errno(), Some(Errno::ENOENT));
    assert!(err.to_string().contains(MISSING));
}

#[test]
fn non_executable_reports_eacces() {
    let err = Channel::spawn_with(&["/dev/null"], lenient()).unwrap_err();
    assert!(err.is_exec_failure(), "got {:?}", err);
    assert_eq!(err.errno(), Some(Errno::EACCES));
}

#[test]
fn failed_exec_leaves_no_zombie() {
    let opts = lenient().with_handshake(false);
    let mut ch = Channel::spawn_with(&[MISSING], opts).unwrap();
    let pid = ch.pid();
    let err = ch.read_line().unwrap_err();
    assert_eq!(err.errno(), Some(Errno::ENOENT));
    drop(ch);
    assert_eq!(
        waitpid(pid, Some(WaitPidFlag::WNOHANG)),
        Err(Errno::ECHILD)
    );
}

#[test]
fn drop_reaps_exactly_once() {
    let mut ch = Channel::spawn(&["true"]).unwrap();
    let pid = ch.pid();
    assert_eq!(ch.wait().unwrap(), ExitStatus::Exited(0));
    drop(ch);
    assert_eq!(
        waitpid(pid, Some(WaitPidFlag::WNOHANG)),
        Err(Errno::ECHILD)
    );
}

#[test]
fn write_after_child_exit_is_an_io_error() {
    let mut ch = Channel::spawn(&["true"]).unwrap();
    while ch.try_wait().unwrap().is_none() {
        std::thread::sleep(Duration::from_millis(5));
    }
    let err = ch.write("late\n").unwrap_err();
    assert_eq!(err.errno(), Some(Errno::EPIPE));
    assert!(!err.is_exec_failure());
}

#[test]
fn buffered_output_readable_after_exit() {
    let mut ch = Channel::spawn(&["sh", "-c", "printf 'a\\nb\\n'"]).unwrap();
    assert_eq!(ch.read_line().unwrap(), "a\n");
    while ch.try_wait().unwrap().is_none() {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(ch.read_line().unwrap(), "b\n");
    assert_eq!(ch.read_line().unwrap(), "");
}

#[test]
fn zero_handshake_timeout_still_cleans_up() {
    // Races the child on purpose: either outcome must leave nothing behind.
    let opts = LaunchOptions::default().with_handshake_timeout(Duration::ZERO);
    match Channel::spawn_with(&["cat"], opts) {
        Ok(ch) => drop(ch),
        Err(Error::HandshakeTimeout { pid, .. }) => {
            assert_eq!(
                waitpid(pid, Some(WaitPidFlag::WNOHANG)),
                Err(Errno::ECHILD)
            );
        }
        Err(other) => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn signal_strategy_round_trip() {
    let _g = SIGNAL_GUARD.lock().unwrap_or_else(|e| e.into_inner());
    let opts = LaunchOptions::default().with_strategy(DetectStrategy::Signal);
    let mut ch = Channel::spawn_with(&["cat"], opts).unwrap();
    ch.write("hello\n").unwrap();
    assert_eq!(ch.read_line().unwrap(), "hello\n");
}

#[test]
fn signal_strategy_never_cross_delivers() {
    let _g = SIGNAL_GUARD.lock().unwrap_or_else(|e| e.into_inner());
    let opts = || {
        LaunchOptions::default()
            .with_strategy(DetectStrategy::Signal)
            .with_grace(Duration::from_millis(100))
    };

    // Keep one healthy channel alive across every failing launch.
    let mut steady = Channel::spawn_with(&["cat"], opts()).unwrap();

    for i in 0..10 {
        if i % 2 == 0 {
            let err = Channel::spawn_with(&[MISSING], opts()).unwrap_err();
            assert_eq!(err.errno(), Some(Errno::ENOENT), "iteration {}", i);
        } else {
            let mut ch = Channel::spawn_with(&["cat"], opts()).unwrap();
            ch.write_line(format!("ok {}", i)).unwrap();
            assert_eq!(ch.read_line().unwrap(), format!("ok {}\n", i));
        }
        steady.write_line("still here").unwrap();
        assert_eq!(steady.read_line().unwrap(), "still here\n");
    }
}

#[test]
fn signal_handler_deactivates_with_last_channel() {
    let _g = SIGNAL_GUARD.lock().unwrap_or_else(|e| e.into_inner());
    let before = signal::live_count();
    {
        let opts = || LaunchOptions::default().with_strategy(DetectStrategy::Signal);
        let _a = Channel::spawn_with(&["cat"], opts()).unwrap();
        let _b = Channel::spawn_with(&["cat"], opts()).unwrap();
        assert_eq!(signal::live_count(), before + 2);
    }
    assert_eq!(signal::live_count(), before);
}
