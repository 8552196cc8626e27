//! Board power control and the guard that balances it.

use crate::command::Arg;
use crate::error::Result;
use crate::event::{Event, EventSink};
use crate::machine::Machine;
use async_trait::async_trait;

/// Switches a board's power.
#[async_trait]
pub trait PowerControl: Send {
    async fn poweron(&mut self) -> Result<()>;

    async fn poweroff(&mut self) -> Result<()>;

    /// Give back whatever the control holds, e.g. a lab host session.
    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Power control through commands on a host machine, such as a relay tool
/// on the lab host.
pub struct HostPowerControl {
    host: Machine,
    on: Vec<Arg>,
    off: Vec<Arg>,
}

impl HostPowerControl {
    /// Switch power by running `on` and `off` on `host`.
    pub fn new(host: Machine, on: Vec<Arg>, off: Vec<Arg>) -> Self {
        HostPowerControl { host, on, off }
    }
}

#[async_trait]
impl PowerControl for HostPowerControl {
    async fn poweron(&mut self) -> Result<()> {
        self.host.exec0(&self.on).await.map(drop)
    }

    async fn poweroff(&mut self) -> Result<()> {
        self.host.exec0(&self.off).await.map(drop)
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.host.exit().await
    }
}

/// Keeps track of whether a board is powered and switches it off exactly
/// once.
///
/// The guard counts as powered from the moment `poweron` is attempted: a
/// failed power-on may still have left the board half switched. Prefer
/// [`release`](PowerGuard::release); dropping a powered guard only schedules
/// the switch-off.
pub struct PowerGuard {
    control: Option<Box<dyn PowerControl>>,
    machine: String,
    sink: EventSink,
    on: bool,
}

impl PowerGuard {
    /// A guard for `machine`, initially off.
    pub fn new(control: Box<dyn PowerControl>, machine: &str, sink: EventSink) -> Self {
        PowerGuard {
            control: Some(control),
            machine: machine.to_string(),
            sink,
            on: false,
        }
    }

    /// Whether power is considered on and will be switched off.
    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Switch on. The guard counts as on even if switching fails.
    pub async fn poweron(&mut self) -> Result<()> {
        let Some(control) = self.control.as_mut() else {
            return Ok(());
        };
        self.on = true;
        control.poweron().await?;
        (self.sink)(&Event::PowerChanged {
            machine: self.machine.clone(),
            on: true,
        });
        Ok(())
    }

    /// Switch off if on. Safe to call any number of times.
    pub async fn poweroff(&mut self) -> Result<()> {
        if !self.on {
            return Ok(());
        }
        self.on = false;
        if let Some(control) = self.control.as_mut() {
            control.poweroff().await?;
        }
        (self.sink)(&Event::PowerChanged {
            machine: self.machine.clone(),
            on: false,
        });
        Ok(())
    }

    /// Switch off and release the power control.
    pub async fn release(mut self) -> Result<()> {
        let result = self.poweroff().await;
        let released = match self.control.take() {
            Some(control) => control.release().await,
            None => Ok(()),
        };
        match result {
            Ok(()) => released,
            Err(err) => Err(err.with_cleanup(released)),
        }
    }
}

impl Drop for PowerGuard {
    /// A guard dropped while still on switches off in the background on the
    /// current tokio runtime.
    fn drop(&mut self) {
        if !self.on {
            return;
        }
        self.on = false;
        let Some(mut control) = self.control.take() else {
            return;
        };
        let machine = std::mem::take(&mut self.machine);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::error!(
                "{machine}: dropped while powered on outside a tokio runtime, power stays on"
            );
            return;
        };
        log::warn!("{machine}: dropped while powered on, switching off");
        let sink = self.sink.clone();
        runtime.spawn(async move {
            match control.poweroff().await {
                Ok(()) => sink(&Event::PowerChanged {
                    machine: machine.clone(),
                    on: false,
                }),
                Err(err) => log::error!("{machine}: switching off after drop failed: {err}"),
            }
            if let Err(err) = control.release().await {
                log::error!("{machine}: releasing power control failed: {err}");
            }
        });
    }
}
