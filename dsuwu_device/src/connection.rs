use std::convert::TryFrom;

/// A slot's reported connection type: `-1` is the disconnect sentinel, the
/// rest name the physical transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    Disconnected,
    #[default]
    NotApplicable,
    Usb,
    Bluetooth,
}

impl ConnectionType {
    pub fn as_i8(self) -> i8 {
        match self {
            ConnectionType::Disconnected => -1,
            ConnectionType::NotApplicable => 0,
            ConnectionType::Usb => 1,
            ConnectionType::Bluetooth => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection type: {0} (expected -1, 0, 1 or 2)")]
pub struct InvalidConnectionType(pub i8);

impl TryFrom<i8> for ConnectionType {
    type Error = InvalidConnectionType;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(ConnectionType::Disconnected),
            0 => Ok(ConnectionType::NotApplicable),
            1 => Ok(ConnectionType::Usb),
            2 => Ok(ConnectionType::Bluetooth),
            other => Err(InvalidConnectionType(other)),
        }
    }
}

impl From<ConnectionType> for i8 {
    fn from(value: ConnectionType) -> Self {
        value.as_i8()
    }
}
