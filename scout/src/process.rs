//! Shared subprocess execution helper: spawns into a new process group and
//! kills the whole group on timeout so a timed-out build or run never
//! leaves orphaned children behind.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use log::debug;

/// Outcome of running a command to completion or timeout.
pub enum RunOutcome {
    Completed { output: Output, wallclock: Duration },
    TimedOut { wallclock: Duration },
}

/// Runs `cmd` to completion, killing its entire process group if it runs
/// longer than `timeout`.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> io::Result<RunOutcome> {
    // New process group so the whole subtree (e.g. `make` spawning `cc1`)
    // can be killed together on timeout or driver shutdown.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning: {:?}", cmd);
    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let pid = child.id() as i32;

    loop {
        if let Some(status) = child.try_wait()? {
            let wallclock = start.elapsed();
            let stdout = read_all(child.stdout.take());
            let stderr = read_all(child.stderr.take());
            return Ok(RunOutcome::Completed {
                output: Output { status, stdout, stderr },
                wallclock,
            });
        }
        if start.elapsed() >= timeout {
            kill_process_group(pid);
            let _ = child.wait();
            return Ok(RunOutcome::TimedOut { wallclock: start.elapsed() });
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn read_all(pipe: Option<impl io::Read>) -> Vec<u8> {
    use io::Read;
    let mut buf = Vec::new();
    if let Some(mut p) = pipe {
        let _ = p.read_to_end(&mut buf);
    }
    buf
}

fn kill_process_group(pid: i32) {
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}
