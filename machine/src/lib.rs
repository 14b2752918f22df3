//! Session lifecycle and execution orchestration for emulated machines.
//!
//! A platform describes a system as a tree of [`Component`]s. The
//! [`Machine`] controller starts them (retrying until every dependency is
//! satisfied), drives them through a [`Scheduler`] in bounded time slices,
//! and owns the cross-cutting session concerns: save states, NVRAM,
//! configuration, the watchdog, pause/resume and orderly teardown.

pub mod activation;
pub mod component;
pub mod demo;
pub mod error;
pub mod logsink;
pub mod machine;
pub mod notify;
pub mod options;
pub mod phase;
pub mod platform;
pub mod saveload;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod state;
pub mod time;
pub mod watchdog;

pub use component::{Component, ComponentId, ComponentTree, DeviceContext, StartContext};
pub use error::{MachineError, Result, StartError, StartResult};
pub use machine::Machine;
pub use notify::NotifyKind;
pub use options::MachineOptions;
pub use phase::MachinePhase;
pub use platform::{InitContext, Platform, WatchdogConfig};
pub use saveload::SaveLoadOutcome;
pub use scheduler::{QuantumScheduler, Scheduler, TimerHandle};
pub use session::{SessionHandle, SessionRequest};
pub use state::{StateItem, StateManager};
pub use time::VirtualTime;
