//! OBD-II Protocol Selection

use crate::command::CommandCode;
use serde::{Deserialize, Serialize};

/// Vehicle bus protocols the ELM327 can be told to use (`ATSPn`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// ELM327 protocol number
    pub fn number(&self) -> u8 {
        match self {
            ObdProtocol::Auto => 0,
            ObdProtocol::J1850Pwm => 1,
            ObdProtocol::J1850Vpw => 2,
            ObdProtocol::Iso9141_2 => 3,
            ObdProtocol::Iso14230_4Kwp => 4,
            ObdProtocol::Iso14230_4KwpFast => 5,
            ObdProtocol::Iso15765_4Can11bit500 => 6,
            ObdProtocol::Iso15765_4Can29bit500 => 7,
            ObdProtocol::Iso15765_4Can11bit250 => 8,
            ObdProtocol::Iso15765_4Can29bit250 => 9,
        }
    }

    /// The `ATSPn` command selecting this protocol
    pub fn select_command(&self) -> CommandCode {
        match self {
            ObdProtocol::Auto => CommandCode::AUTO_PROTOCOL,
            other => CommandCode::new(format!("ATSP{}", other.number())),
        }
    }
}

/// Adapter initialization sequence: reset, echo off, linefeeds off, protocol select
pub fn init_sequence(protocol: ObdProtocol) -> [CommandCode; 4] {
    [
        CommandCode::RESET,
        CommandCode::ECHO_OFF,
        CommandCode::LINEFEED_OFF,
        protocol.select_command(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence_is_fixed() {
        let sequence = init_sequence(ObdProtocol::default());
        let codes: Vec<&str> = sequence.iter().map(|c| c.as_str()).collect();
        assert_eq!(codes, ["ATZ", "ATE0", "ATL0", "ATSP0"]);
    }

    #[test]
    fn test_fixed_protocol_select() {
        assert_eq!(
            ObdProtocol::Iso15765_4Can11bit500.select_command().as_str(),
            "ATSP6"
        );
    }
}
