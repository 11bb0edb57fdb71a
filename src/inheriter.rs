use std::{env, os::fd::RawFd};

use nix::unistd::Pid;

use crate::{
    control::ControlChannel,
    handle::HandoffFd,
    handoff::{self, HandoffError},
    utils::{
        adopt_fd, CONTROL_FD, ENV_FD_INDEX, ENV_PARENT_PID, ENV_UPGRADE, INHERITED_FDS_START,
        UPGRADE_TRUE_VAL,
    },
};

#[derive(Debug, derive_more::From, derive_more::Display)]
pub enum InheritError {
    #[display("not started by an upgrade")]
    NotAnUpgrade,

    #[display("invalid environment: {_0}")]
    BadEnvironment(String),

    #[display("cannot decode inherited descriptors: {_0}")]
    #[from]
    Handoff(HandoffError),

    #[display("control channel unusable: {_0}")]
    ControlChannel(std::io::Error),
}

impl std::error::Error for InheritError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handoff(e) => Some(e),
            Self::ControlChannel(e) => Some(e),
            _ => None,
        }
    }
}

/// Everything a parent left behind for this process.
#[derive(Debug)]
pub(crate) struct Inheritance {
    pub(crate) fds: Vec<HandoffFd>,
    pub(crate) control: ControlChannel,
    pub(crate) parent_pid: Pid,
}

fn env_var(name: &str) -> Result<String, InheritError> {
    env::var(name).map_err(|_| InheritError::BadEnvironment(format!("cannot read env var {name}")))
}

/// Pick up the handoff if this process was started by an upgrade. The upgrade variables are
/// removed from the environment so they do not leak into unrelated subprocesses.
pub(crate) fn init_child() -> Result<Inheritance, InheritError> {
    // Are we in an upgrade?
    match env::var(ENV_UPGRADE) {
        Ok(ref s) if s == UPGRADE_TRUE_VAL => (),
        Err(env::VarError::NotPresent) => {
            log::info!("Initializing moult - upgrade: false");
            return Err(InheritError::NotAnUpgrade);
        }
        _ => {
            return Err(InheritError::BadEnvironment(format!(
                "value of env var {ENV_UPGRADE} is not valid"
            )));
        }
    };
    log::info!("Initializing moult - upgrade: true");

    let index = env_var(ENV_FD_INDEX)?;
    let parent_pid: i32 = env_var(ENV_PARENT_PID)?
        .parse()
        .map_err(|_| InheritError::BadEnvironment(format!("{ENV_PARENT_PID} is not a pid")))?;
    for var in [ENV_UPGRADE, ENV_FD_INDEX, ENV_PARENT_PID] {
        env::remove_var(var);
    }

    // The control channel first, so that a broken index still leaves us able to tell.
    // SAFETY: the spawner placed the control channel at CONTROL_FD and nothing else claims it.
    let control = unsafe { adopt_fd(CONTROL_FD) }.map_err(InheritError::ControlChannel)?;
    let control = ControlChannel::from_fd(control);

    let entries = handoff::decode(&index)?;
    let fds = handoff::adopt(entries, |ordinal| {
        let fd = RawFd::try_from(ordinal)
            .ok()
            .and_then(|n| n.checked_add(INHERITED_FDS_START))
            .ok_or_else(|| std::io::Error::from_raw_os_error(nix::errno::Errno::EBADF as i32))?;
        // SAFETY: ordinals are unique, so every inherited descriptor is adopted at most once.
        unsafe { adopt_fd(fd) }
    })?;

    log::debug!(
        "Inherited from parent {parent_pid}: {:?}",
        fds.iter().map(HandoffFd::name).collect::<Vec<_>>()
    );
    Ok(Inheritance {
        fds,
        control,
        parent_pid: Pid::from_raw(parent_pid),
    })
}
