//! Machine lifecycle phases.

use std::fmt;

/// Lifecycle phase of a session.
///
/// Phases advance `Preinit -> Init -> Reset -> Running -> Exit`. A running
/// session may re-enter `Reset` for a soft reset, and a failed startup goes
/// straight from `Init` (or `Reset`) to `Exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MachinePhase {
    /// Static configuration: the component tree is being built.
    Preinit = 0,
    /// Subsystems and components are being started. Registration window.
    Init = 1,
    /// Components are being reset.
    Reset = 2,
    /// The execution loop is active.
    Running = 3,
    /// Teardown.
    Exit = 4,
}

impl MachinePhase {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: MachinePhase) -> bool {
        use MachinePhase::*;
        matches!(
            (self, next),
            (Preinit, Init)
                | (Init, Reset)
                | (Reset, Running)
                | (Running, Reset)
                | (Init, Exit)
                | (Reset, Exit)
                | (Running, Exit)
        )
    }

    /// Registrations (notifiers, log sinks, state items) are only legal now.
    #[inline]
    pub fn allows_registration(self) -> bool {
        self == MachinePhase::Init
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> MachinePhase {
        match raw {
            0 => MachinePhase::Preinit,
            1 => MachinePhase::Init,
            2 => MachinePhase::Reset,
            3 => MachinePhase::Running,
            _ => MachinePhase::Exit,
        }
    }
}

impl fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachinePhase::Preinit => "preinit",
            MachinePhase::Init => "init",
            MachinePhase::Reset => "reset",
            MachinePhase::Running => "running",
            MachinePhase::Exit => "exit",
        };
        f.write_str(name)
    }
}
