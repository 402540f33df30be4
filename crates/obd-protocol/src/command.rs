//! ELM327 Command Codes
//!
//! A [`CommandCode`] is the text sent to the adapter: either an AT control
//! command addressed to the ELM327 itself or an OBD-II PID request that is
//! forwarded to the vehicle. The type performs no validation.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// A command understood by an ELM327 adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandCode(Cow<'static, str>);

impl CommandCode {
    /// Reset the adapter
    pub const RESET: CommandCode = CommandCode::from_static("ATZ");
    /// Disable command echo
    pub const ECHO_OFF: CommandCode = CommandCode::from_static("ATE0");
    /// Disable linefeeds after carriage returns
    pub const LINEFEED_OFF: CommandCode = CommandCode::from_static("ATL0");
    /// Select the OBD protocol automatically
    pub const AUTO_PROTOCOL: CommandCode = CommandCode::from_static("ATSP0");

    /// Calculated engine load
    pub const ENGINE_LOAD: CommandCode = CommandCode::from_static("0104");
    /// Engine coolant temperature
    pub const COOLANT_TEMPERATURE: CommandCode = CommandCode::from_static("0105");
    /// Intake manifold absolute pressure
    pub const INTAKE_MANIFOLD_PRESSURE: CommandCode = CommandCode::from_static("010B");
    /// Engine RPM
    pub const ENGINE_RPM: CommandCode = CommandCode::from_static("010C");
    /// Vehicle speed
    pub const VEHICLE_SPEED: CommandCode = CommandCode::from_static("010D");
    /// Intake air temperature
    pub const INTAKE_AIR_TEMPERATURE: CommandCode = CommandCode::from_static("010F");
    /// Mass air flow rate
    pub const MAF: CommandCode = CommandCode::from_static("0110");
    /// Throttle position
    pub const THROTTLE_POSITION: CommandCode = CommandCode::from_static("0111");
    /// Fuel tank level input
    pub const FUEL_LEVEL: CommandCode = CommandCode::from_static("012F");
    /// Ambient air temperature
    pub const AMBIENT_AIR_TEMPERATURE: CommandCode = CommandCode::from_static("0146");

    /// Build a command from a string literal (usable in `const` items)
    pub const fn from_static(code: &'static str) -> Self {
        CommandCode(Cow::Borrowed(code))
    }

    /// Build a command from any string
    pub fn new(code: impl Into<String>) -> Self {
        CommandCode(Cow::Owned(code.into()))
    }

    /// The command text without the trailing carriage return
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is an AT control command rather than a vehicle request
    pub fn is_at_command(&self) -> bool {
        self.0
            .get(..2)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("AT"))
    }

    /// Bytes written to the wire: the command followed by `\r`
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.0.len() + 1);
        frame.extend_from_slice(self.0.as_bytes());
        frame.push(b'\r');
        frame
    }

    /// Human-readable name for well-known commands
    pub fn description(&self) -> Option<&'static str> {
        let name = match self.0.to_ascii_uppercase().as_str() {
            "ATZ" => "Reset adapter",
            "ATE0" => "Echo off",
            "ATL0" => "Linefeeds off",
            "ATSP0" => "Automatic protocol",
            "0104" => "Engine load",
            "0105" => "Coolant temperature",
            "010B" => "Intake manifold pressure",
            "010C" => "Engine RPM",
            "010D" => "Vehicle speed",
            "010F" => "Intake air temperature",
            "0110" => "Mass air flow",
            "0111" => "Throttle position",
            "012F" => "Fuel level",
            "0146" => "Ambient air temperature",
            _ => return None,
        };
        Some(name)
    }

    /// PIDs monitored when no explicit list is configured
    pub fn default_monitor_set() -> Vec<CommandCode> {
        vec![
            Self::ENGINE_RPM,
            Self::VEHICLE_SPEED,
            Self::THROTTLE_POSITION,
            Self::COOLANT_TEMPERATURE,
        ]
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandCode {
    fn from(code: &str) -> Self {
        CommandCode::new(code)
    }
}

impl From<String> for CommandCode {
    fn from(code: String) -> Self {
        CommandCode::new(code)
    }
}

impl AsRef<str> for CommandCode {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
