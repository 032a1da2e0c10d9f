//! Watchdog for spawning subprocesses.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Output, Stdio};
use std::rc::Rc;

use calloop::LoopHandle;
use calloop::signals::{Signal, Signals};
use tracing::error;

use crate::Result;

/// Callback invoked after reaping.
pub type Callback = Box<dyn FnOnce(Output)>;

type ProcessTable = Rc<RefCell<HashMap<u32, (Child, Callback)>>>;

/// Watchdog for reaping dead children.
#[derive(Clone)]
pub struct Reaper {
    processes: ProcessTable,
}

impl Reaper {
    pub fn new<D: 'static>(event_loop: &LoopHandle<'static, D>) -> Result<Self> {
        let processes = ProcessTable::default();

        // Register calloop SIGCHLD handler.
        let signals = Signals::new(&[Signal::SIGCHLD])?;
        let reap_processes = processes.clone();
        event_loop.insert_source(signals, move |_, _, _| {
            // SIGCHLD coalesces, so check every supervised child.
            let mut reaped = Vec::new();
            {
                let mut processes = reap_processes.borrow_mut();
                let exited: Vec<u32> = processes
                    .iter_mut()
                    .filter_map(|(pid, (child, _))| {
                        matches!(child.try_wait(), Ok(Some(_))).then_some(*pid)
                    })
                    .collect();

                for pid in exited {
                    if let Some((child, callback)) = processes.remove(&pid) {
                        match child.wait_with_output() {
                            Ok(output) => reaped.push((callback, output)),
                            Err(err) => error!("Failed reaping child {pid}: {err}"),
                        }
                    }
                }
            }

            // Callbacks run without the process table borrow, so they may
            // spawn new children through this reaper.
            for (callback, output) in reaped {
                callback(output);
            }
        })?;

        Ok(Self { processes })
    }

    /// Start watching a child.
    ///
    /// Returns the child's PID, or `None` when spawning failed.
    pub fn watch(&self, mut command: Command, callback: Callback) -> Option<u32> {
        // Set STDIO handles so callees don't have to handle it.
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        // Try to spawn the child process.
        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!("Child process failed: {err}");
                return None;
            },
        };

        let pid = child.id();
        self.processes.borrow_mut().insert(pid, (child, callback));

        Some(pid)
    }
}

/// Spawn unsupervised daemons.
///
/// This will double-fork to avoid spawning zombies, but does not provide any
/// ability to retrieve the process output.
pub fn daemon<I, S>(program: S, args: I) -> io::Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());

    unsafe {
        command.pre_exec(|| {
            match libc::fork() {
                -1 => return Err(io::Error::last_os_error()),
                0 => (),
                _ => libc::_exit(0),
            }

            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        });
    }

    command.spawn()?.wait()?;

    Ok(())
}
