//! Instance lifecycle transitions.
//!
//! Every status change in the agent goes through [`next`]; anything not listed
//! in the table is rejected and leaves the status untouched.

use std::fmt;

use anvil_process::Status;

use crate::error::AnvilError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    InstallRequested,
    InstallOk,
    InstallFail,
    StartRequested,
    ProcessReady,
    StartFail,
    StopRequested,
    ProcessExited,
    ProcessCrashed,
    DeleteRequested,
}

impl LifecycleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::InstallRequested => "install_requested",
            LifecycleEvent::InstallOk => "install_ok",
            LifecycleEvent::InstallFail => "install_fail",
            LifecycleEvent::StartRequested => "start_requested",
            LifecycleEvent::ProcessReady => "process_ready",
            LifecycleEvent::StartFail => "start_fail",
            LifecycleEvent::StopRequested => "stop_requested",
            LifecycleEvent::ProcessExited => "process_exited",
            LifecycleEvent::ProcessCrashed => "process_crashed",
            LifecycleEvent::DeleteRequested => "delete_requested",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the status reached by applying `event` in `current`.
///
/// `installed` only matters for recovering from `Error`: a broken install has to be
/// re-installed, a crashed server can simply be started again.
pub fn next(current: Status, event: LifecycleEvent, installed: bool) -> Result<Status, AnvilError> {
    use LifecycleEvent as E;
    use Status as S;

    let to = match (current, event) {
        (S::NotInstalled, E::InstallRequested) => S::Installing,
        (S::Error, E::InstallRequested) if !installed => S::Installing,
        (S::Installing, E::InstallOk) => S::Stopped,
        (S::Installing, E::InstallFail) => S::Error,

        (S::Stopped, E::StartRequested) => S::Starting,
        (S::Error, E::StartRequested) if installed => S::Starting,
        (S::Starting, E::ProcessReady) => S::Running,
        (S::Starting, E::StartFail) => S::Error,

        (S::Running, E::StopRequested) => S::Stopping,
        (S::Stopping, E::ProcessExited) => S::Stopped,
        (S::Running, E::ProcessCrashed) => S::Error,

        // Deletion does not move the status; it only has to be allowed.
        (S::NotInstalled | S::Stopped | S::Error, E::DeleteRequested) => current,

        (from, event) => return Err(AnvilError::InvalidTransition { from, event }),
    };
    Ok(to)
}

pub fn can_delete(status: Status) -> bool {
    next(status, LifecycleEvent::DeleteRequested, false).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUS: [Status; 7] = [
        Status::NotInstalled,
        Status::Installing,
        Status::Stopped,
        Status::Starting,
        Status::Running,
        Status::Stopping,
        Status::Error,
    ];

    const ALL_EVENTS: [LifecycleEvent; 10] = [
        LifecycleEvent::InstallRequested,
        LifecycleEvent::InstallOk,
        LifecycleEvent::InstallFail,
        LifecycleEvent::StartRequested,
        LifecycleEvent::ProcessReady,
        LifecycleEvent::StartFail,
        LifecycleEvent::StopRequested,
        LifecycleEvent::ProcessExited,
        LifecycleEvent::ProcessCrashed,
        LifecycleEvent::DeleteRequested,
    ];

    #[test]
    fn happy_path_walks_the_table() {
        let mut s = Status::NotInstalled;
        for (ev, want) in [
            (LifecycleEvent::InstallRequested, Status::Installing),
            (LifecycleEvent::InstallOk, Status::Stopped),
            (LifecycleEvent::StartRequested, Status::Starting),
            (LifecycleEvent::ProcessReady, Status::Running),
            (LifecycleEvent::StopRequested, Status::Stopping),
            (LifecycleEvent::ProcessExited, Status::Stopped),
        ] {
            s = next(s, ev, true).unwrap();
            assert_eq!(s, want);
        }
    }

    #[test]
    fn failures_land_in_error() {
        assert_eq!(
            next(Status::Installing, LifecycleEvent::InstallFail, false).unwrap(),
            Status::Error
        );
        assert_eq!(
            next(Status::Starting, LifecycleEvent::StartFail, true).unwrap(),
            Status::Error
        );
        assert_eq!(
            next(Status::Running, LifecycleEvent::ProcessCrashed, true).unwrap(),
            Status::Error
        );
    }

    #[test]
    fn error_recovers_only_by_reissue() {
        assert_eq!(
            next(Status::Error, LifecycleEvent::StartRequested, true).unwrap(),
            Status::Starting
        );
        assert!(next(Status::Error, LifecycleEvent::StartRequested, false).is_err());
        assert_eq!(
            next(Status::Error, LifecycleEvent::InstallRequested, false).unwrap(),
            Status::Installing
        );
        assert!(next(Status::Error, LifecycleEvent::InstallRequested, true).is_err());
    }

    #[test]
    fn delete_only_from_resting_states() {
        for s in ALL_STATUS {
            let want = matches!(s, Status::NotInstalled | Status::Stopped | Status::Error);
            assert_eq!(can_delete(s), want, "{s}");
        }
    }

    #[test]
    fn off_table_pairs_are_rejected() {
        let mut accepted = 0;
        for s in ALL_STATUS {
            for ev in ALL_EVENTS {
                match next(s, ev, true) {
                    Ok(_) => accepted += 1,
                    Err(AnvilError::InvalidTransition { from, event }) => {
                        assert_eq!(from, s);
                        assert_eq!(event, ev);
                    }
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
        }
        // 9 table edges + start from Error + 3 delete-allowed states.
        assert_eq!(accepted, 13);
    }
}
