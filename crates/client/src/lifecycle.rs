//! Study session lifecycle
//!
//! ```text
//! Uninitialized → Initializing → Ready → StartingComponent → Terminated
//!                                     ↘ Ending            ↗
//! ```
//! plus a one-way `run_invalid` flag that beats every phase.

use crate::error::{StudyError, StudyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing,
    Ready,
    StartingComponent,
    Ending,
    Terminated,
}

/// How the current component is being left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    StartComponent,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    phase: Phase,
    run_invalid: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
            run_invalid: false,
        }
    }
}

impl Lifecycle {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_run_invalid(&self) -> bool {
        self.run_invalid
    }

    /// Returns false when the session is already initialized.
    pub fn begin_init(&mut self) -> StudyResult<bool> {
        if self.run_invalid {
            return Err(StudyError::InvalidRun);
        }
        match self.phase {
            Phase::Uninitialized => {
                self.phase = Phase::Initializing;
                Ok(true)
            }
            Phase::Ready => Ok(false),
            _ => self.ensure_ready().map(|_| false),
        }
    }

    pub fn init_done(&mut self) {
        if self.phase == Phase::Initializing {
            self.phase = Phase::Ready;
        }
    }

    pub fn init_failed(&mut self) {
        if self.phase == Phase::Initializing {
            self.phase = Phase::Uninitialized;
        }
    }

    /// Fails unless plain operations (data submission, channel use) are allowed.
    pub fn ensure_ready(&self) -> StudyResult<()> {
        if self.run_invalid {
            return Err(StudyError::InvalidRun);
        }
        match self.phase {
            Phase::Ready => Ok(()),
            Phase::Uninitialized | Phase::Initializing => Err(StudyError::NotInitialized),
            Phase::StartingComponent => Err(StudyError::ComponentStartInProgress),
            Phase::Ending => Err(StudyError::StudyEnding),
            Phase::Terminated => Err(StudyError::InvalidRun),
        }
    }

    /// Claim the single exit of this component page.
    pub fn begin_exit(&mut self, exit: Exit) -> StudyResult<()> {
        self.ensure_ready()?;
        self.phase = match exit {
            Exit::StartComponent => Phase::StartingComponent,
            Exit::End => Phase::Ending,
        };
        Ok(())
    }

    pub fn finish(&mut self) {
        self.phase = Phase::Terminated;
    }

    pub fn invalidate(&mut self) {
        self.run_invalid = true;
        self.phase = Phase::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> Lifecycle {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.begin_init(), Ok(true));
        lifecycle.init_done();
        lifecycle
    }

    #[test]
    fn operations_need_initialization() {
        let lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.ensure_ready(), Err(StudyError::NotInitialized));
        assert_eq!(ready().ensure_ready(), Ok(()));
    }

    #[test]
    fn failed_init_can_be_retried() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.begin_init().expect("first init");
        lifecycle.init_failed();
        assert_eq!(lifecycle.begin_init(), Ok(true));
    }

    #[test]
    fn only_one_exit_at_a_time() {
        let mut lifecycle = ready();
        lifecycle.begin_exit(Exit::StartComponent).expect("first start");
        assert_eq!(
            lifecycle.begin_exit(Exit::StartComponent),
            Err(StudyError::ComponentStartInProgress)
        );
        assert_eq!(
            lifecycle.begin_exit(Exit::End),
            Err(StudyError::ComponentStartInProgress)
        );

        let mut lifecycle = ready();
        lifecycle.begin_exit(Exit::End).expect("end");
        assert_eq!(
            lifecycle.begin_exit(Exit::StartComponent),
            Err(StudyError::StudyEnding)
        );
    }

    #[test]
    fn finished_page_rejects_everything_as_invalid_run() {
        let mut lifecycle = ready();
        lifecycle.begin_exit(Exit::End).expect("end");
        lifecycle.finish();
        assert_eq!(lifecycle.ensure_ready(), Err(StudyError::InvalidRun));
        assert_eq!(lifecycle.begin_exit(Exit::End), Err(StudyError::InvalidRun));
        assert_eq!(lifecycle.begin_init(), Err(StudyError::InvalidRun));
    }

    #[test]
    fn invalid_run_is_permanent() {
        let mut lifecycle = ready();
        lifecycle.invalidate();
        assert_eq!(lifecycle.ensure_ready(), Err(StudyError::InvalidRun));
        assert_eq!(lifecycle.begin_init(), Err(StudyError::InvalidRun));
        lifecycle.finish();
        assert!(lifecycle.is_run_invalid());
    }
}
