use std::{
    env,
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use crate::registry::DEFAULT_BACKLOG;

const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

/// What an upgrade executes.
#[derive(Clone, Debug)]
pub struct ChildCommand {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl ChildCommand {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            current_dir: None,
        }
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Re-run this process the way it was started: `argv[0]` with the same arguments, in
    /// the current directory. On upgrade `argv[0]` is resolved again, so a new binary at the
    /// same path is picked up.
    pub(crate) fn current() -> io::Result<Self> {
        let mut args = env::args_os();
        let program = args
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "argv[0] is missing"))?;
        Ok(Self {
            program,
            args: args.collect(),
            current_dir: Some(env::current_dir()?),
        })
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Upgrader configuration.
#[derive(Clone, Debug)]
pub struct Options {
    pub(crate) upgrade_timeout: Duration,
    pub(crate) pid_file: Option<PathBuf>,
    pub(crate) stop_child_on_failure: bool,
    pub(crate) listen_backlog: i32,
    pub(crate) command: Option<ChildCommand>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            pid_file: None,
            stop_child_on_failure: false,
            listen_backlog: DEFAULT_BACKLOG,
            command: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a new generation gets to report readiness. Defaults to 60 seconds.
    pub fn with_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.upgrade_timeout = timeout;
        self
    }

    /// Set a PID file for this application. A PID file allows proper pid tracking across
    /// upgrades when used with process supervisors (e.g. systemd).
    ///
    /// The file is replaced atomically once this process is ready, and rewritten by a parent
    /// whose upgrade failed.
    pub fn with_pid_file<P: AsRef<Path>>(mut self, pid_file: P) -> Self {
        self.pid_file = Some(pid_file.as_ref().to_path_buf());
        self
    }

    /// Send `STOP` to a child that failed or timed out instead of leaving it alone.
    pub fn stop_child_on_failure(mut self, stop: bool) -> Self {
        self.stop_child_on_failure = stop;
        self
    }

    /// Backlog for listeners created from scratch. Defaults to 128.
    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Run `command` on upgrade instead of re-running the current binary.
    pub fn with_command(mut self, command: ChildCommand) -> Self {
        self.command = Some(command);
        self
    }

    pub(crate) fn child_command(&self) -> io::Result<Command> {
        match &self.command {
            Some(command) => Ok(command.to_command()),
            None => ChildCommand::current().map(|c| c.to_command()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::new();
        assert_eq!(options.upgrade_timeout, Duration::from_secs(60));
        assert_eq!(options.listen_backlog, 128);
        assert!(!options.stop_child_on_failure);
        assert!(options.pid_file.is_none());
    }

    #[test]
    fn explicit_command() {
        let options = Options::new().with_command(
            ChildCommand::new("/bin/sh", ["-c", "exit 0"]).current_dir("/"),
        );
        let cmd = options.child_command().unwrap();
        assert_eq!(cmd.get_program(), "/bin/sh");
        assert_eq!(cmd.get_args().collect::<Vec<_>>(), ["-c", "exit 0"]);
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/")));
    }

    #[test]
    fn default_command_reruns_this_binary() {
        let cmd = Options::new().child_command().unwrap();
        assert_eq!(cmd.get_program(), env::args_os().next().unwrap());
        assert_eq!(cmd.get_current_dir(), Some(env::current_dir().unwrap().as_path()));
    }
}
