/// Which end of the connection we are. Decides masking in both directions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Clients must SEND masked.
    pub(crate) fn masks_outgoing(self) -> bool { matches!(self, Role::Client) }

    /// Servers must only RECEIVE masked frames.
    pub(crate) fn expects_masked(self) -> bool { matches!(self, Role::Server) }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Role::Client => "CLI",
            Role::Server => "SRV",
        }
    }
}
