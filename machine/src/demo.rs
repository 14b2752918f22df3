//! A small demonstration system.
//!
//! Nothing here models real hardware. The components exist to exercise the
//! lifecycle controller end to end: an executing processor that kicks the
//! watchdog, a screen driven by a periodic timer, a sound device that can
//! only start after the processor, and battery-backed memory.

use crate::component::{Component, ComponentTree, DeviceContext, StartContext};
use crate::error::{Result, StartResult};
use crate::notify::NotifyKind;
use crate::platform::{InitContext, Platform, WatchdogConfig};
use crate::session::SessionHandle;
use crate::state::StateItem;
use crate::time::VirtualTime;
use serde::{Deserialize, Serialize};

pub const DEMO_SYSTEM: &str = "bavydemo";
/// Processor clock.
pub const CPU_CLOCK_HZ: u64 = 1_000_000;
pub const FRAME_RATE_HZ: u64 = 60;
pub const WATCHDOG_TIMEOUT: VirtualTime = VirtualTime::from_millis(500);

const VBLANK_TIMER: u32 = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub cycles: u64,
    pub pc: u32,
    pub acc: u32,
}

/// Shared views onto the demo's state, for hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct DemoView {
    pub cpu: StateItem<CpuState>,
    pub frames: StateItem<u64>,
    pub samples: StateItem<u64>,
    pub boots: StateItem<u32>,
    pub volume: StateItem<u8>,
    /// Soft resets seen by the driver, including the one at boot.
    pub resets: StateItem<u32>,
}

struct DemoCpu {
    state: StateItem<CpuState>,
    /// Stop kicking the watchdog once this much time has elapsed.
    hang_after: Option<VirtualTime>,
}

impl Component for DemoCpu {
    fn start(&mut self, ctx: &mut StartContext<'_>) -> StartResult {
        ctx.save_item("regs", &self.state)?;
        Ok(())
    }

    fn reset(&mut self, _ctx: &mut DeviceContext<'_>) {
        self.state.with_mut(|s| {
            s.pc = 0;
            s.acc = 0;
        });
    }

    fn is_executing(&self) -> bool {
        true
    }

    fn execute(&mut self, budget: VirtualTime, ctx: &mut DeviceContext<'_>) -> Result<()> {
        let cycles = budget.cycles_of(VirtualTime::from_hz(CPU_CLOCK_HZ));
        self.state.with_mut(|s| {
            s.cycles += cycles;
            s.pc = s.pc.wrapping_add((cycles as u32).wrapping_mul(4));
            s.acc = s.acc.rotate_left(3) ^ s.pc;
        });

        let hung = self.hang_after.is_some_and(|after| ctx.now() >= after);
        if !hung {
            ctx.session.kick_watchdog();
        }
        Ok(())
    }
}

struct DemoScreen {
    frames: StateItem<u64>,
}

impl Component for DemoScreen {
    fn start(&mut self, ctx: &mut StartContext<'_>) -> StartResult {
        ctx.save_item("frame", &self.frames)?;
        let timer = ctx.timer_alloc(VBLANK_TIMER, Some("vblank"));
        let period = VirtualTime::from_hz(FRAME_RATE_HZ);
        ctx.scheduler.timer_adjust(timer, period, Some(period));
        Ok(())
    }

    fn timer_fired(&mut self, timer: u32, ctx: &mut DeviceContext<'_>) {
        if timer == VBLANK_TIMER {
            self.frames.with_mut(|f| *f += 1);
            ctx.session.signal_vblank();
        }
    }
}

/// Sound output. Samples the processor's accumulator, so it must start
/// after `maincpu`.
struct DemoSpeaker {
    cpu: StateItem<CpuState>,
    samples: StateItem<u64>,
    volume: StateItem<u8>,
}

impl Component for DemoSpeaker {
    fn start(&mut self, ctx: &mut StartContext<'_>) -> StartResult {
        ctx.require("maincpu")?;
        ctx.save_item("samples", &self.samples)?;
        Ok(())
    }

    fn is_executing(&self) -> bool {
        true
    }

    fn execute(&mut self, budget: VirtualTime, _ctx: &mut DeviceContext<'_>) -> Result<()> {
        if self.volume.get() > 0 && self.cpu.with(|c| c.acc & 1 == 1) {
            self.samples
                .with_mut(|s| *s += budget.cycles_of(VirtualTime::from_hz(44_100)));
        }
        Ok(())
    }

    fn config_load(&mut self, value: &serde_json::Value) {
        if let Some(volume) = value.get("volume").and_then(|v| v.as_u64()) {
            self.volume.set(volume.min(u8::MAX as u64) as u8);
        }
    }

    fn config_save(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "volume": self.volume.get() }))
    }
}

struct DemoNvram {
    boots: StateItem<u32>,
}

impl Component for DemoNvram {
    fn start(&mut self, ctx: &mut StartContext<'_>) -> StartResult {
        ctx.save_item("boots", &self.boots)?;
        Ok(())
    }

    fn has_nvram(&self) -> bool {
        true
    }

    fn nvram_load(&mut self, data: Option<&[u8]>) {
        let previous = data
            .and_then(|d| d.get(..4))
            .and_then(|d| d.try_into().ok())
            .map(u32::from_le_bytes)
            .unwrap_or(0);
        self.boots.set(previous.saturating_add(1));
    }

    fn nvram_save(&self) -> Option<Vec<u8>> {
        Some(self.boots.get().to_le_bytes().to_vec())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DemoConfig {
    /// Let the processor stop kicking the watchdog after this long.
    pub hang_after: Option<VirtualTime>,
}

pub struct DemoSystem {
    config: DemoConfig,
    view: DemoView,
}

impl DemoSystem {
    pub fn new(config: DemoConfig) -> Self {
        let view = DemoView {
            volume: StateItem::new(8),
            ..DemoView::default()
        };
        Self { config, view }
    }

    pub fn view(&self) -> DemoView {
        self.view.clone()
    }
}

impl Platform for DemoSystem {
    fn name(&self) -> &str {
        DEMO_SYSTEM
    }

    fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            vblank_count: 0,
            time: Some(WATCHDOG_TIMEOUT),
        }
    }

    fn configure(&mut self, tree: &mut ComponentTree) -> Result<()> {
        let view = &self.view;
        // The speaker comes first so that startup has to retry it.
        tree.add(
            None,
            "speaker",
            Box::new(DemoSpeaker {
                cpu: view.cpu.clone(),
                samples: view.samples.clone(),
                volume: view.volume.clone(),
            }),
        )?;
        tree.add(
            None,
            "maincpu",
            Box::new(DemoCpu {
                state: view.cpu.clone(),
                hang_after: self.config.hang_after,
            }),
        )?;
        let screen = tree.add(
            None,
            "screen",
            Box::new(DemoScreen {
                frames: view.frames.clone(),
            }),
        )?;
        tree.add(
            Some(screen),
            "nvram",
            Box::new(DemoNvram {
                boots: view.boots.clone(),
            }),
        )?;
        Ok(())
    }

    fn driver_init(&mut self, ctx: &mut InitContext<'_>) -> Result<()> {
        ctx.save_item("resets", &self.view.resets)?;
        let resets = self.view.resets.clone();
        ctx.add_notifier(
            NotifyKind::Reset,
            Box::new(move |_, _| resets.with_mut(|n| *n = n.wrapping_add(1))),
        )
    }

    fn show_startup_screens(&mut self, session: &SessionHandle, first_run: bool) -> Result<()> {
        if first_run {
            session.popmessage(format!(
                "{}: {} MHz processor, {} Hz display",
                DEMO_SYSTEM,
                CPU_CLOCK_HZ / 1_000_000,
                FRAME_RATE_HZ
            ));
        }
        Ok(())
    }
}
