//! Strategies that bring a freshly connected console to a usable shell.
//!
//! Each strategy is a small state machine driven over a [`Channel`]:
//! [`autoboot::intercept`] races the bootloader countdown,
//! [`login::login`] answers the login handshake, and
//! [`power::PowerGuard`] keeps the power switch balanced.

pub mod autoboot;
pub mod login;
pub mod power;

pub use autoboot::{AutobootConfig, AutobootState};
pub use login::{LoginConfig, LoginState};
pub use power::{HostPowerControl, PowerControl, PowerGuard};

use crate::channel::Channel;
use crate::error::Result;
use crate::event::Event;
use crate::pattern::Pattern;

/// A state of one of the boot state machines.
pub(crate) trait BootState: Copy + PartialEq {
    fn name(self) -> &'static str;
}

/// Move `state` to `to` and report the transition.
pub(crate) fn enter<S: BootState>(channel: &Channel, state: &mut S, to: S) {
    if *state == to {
        return;
    }
    channel.emit(&Event::StateChanged {
        machine: channel.owner().to_string(),
        from: state.name(),
        to: to.name(),
    });
    *state = to;
}

/// A prompt of a typical interactive shell at the end of the output.
pub fn default_shell_prompt() -> Result<Pattern> {
    Pattern::regex(r"[$#>%] ?\z")
}
