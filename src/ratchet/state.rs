use crate::Error;

/// Which side of the conversation a session took on its first message.
///
/// Set once, on the first send (`Initiator`) or the first receive
/// (`Responder`), and never changed afterwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    Unset,
    Initiator,
    Responder,
}

impl Role {
    pub(crate) fn to_u32(self) -> u32 {
        match self {
            Role::Unset => 0,
            Role::Initiator => 1,
            Role::Responder => 2,
        }
    }
}

impl TryFrom<u32> for Role {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Unset),
            1 => Ok(Role::Initiator),
            2 => Ok(Role::Responder),
            other => Err(Error::Serde(format!("unknown role {other}"))),
        }
    }
}

/// Selects the send or receive chain of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}
