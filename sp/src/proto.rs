use std::sync::Arc;

use spcore::SpResult;

use crate::pipe::Pipe;

/// The well-known SP protocol numbers (major * 16 + minor).
pub mod ids {
    pub const PAIR0: u16 = 0x10;
    pub const PAIR1: u16 = 0x11;
    pub const PUB0: u16 = 0x20;
    pub const SUB0: u16 = 0x21;
    pub const REQ0: u16 = 0x30;
    pub const REP0: u16 = 0x31;
    pub const PUSH0: u16 = 0x50;
    pub const PULL0: u16 = 0x51;
    pub const SURVEYOR0: u16 = 0x62;
    pub const RESPONDENT0: u16 = 0x63;
    pub const BUS0: u16 = 0x70;

    pub fn name(id: u16) -> &'static str {
        match id {
            PAIR0 => "pair",
            PAIR1 => "pair1",
            PUB0 => "pub",
            SUB0 => "sub",
            REQ0 => "req",
            REP0 => "rep",
            PUSH0 => "push",
            PULL0 => "pull",
            SURVEYOR0 => "surveyor",
            RESPONDENT0 => "respondent",
            BUS0 => "bus",
            _ => "unknown",
        }
    }
}

/// The policy layer a socket runs. The concrete SP patterns (REQ/REP, PUB/SUB,
///  BUS, ...) are implemented elsewhere against this seam; the core only needs
///  the identity pair for negotiation checks and the pipe lifecycle hooks.
pub trait Protocol: Send + Sync {
    /// Our 16-bit protocol number, sent during negotiation.
    fn self_id(&self) -> u16;

    /// The protocol number we expect the peer to present.
    fn peer_id(&self) -> u16;

    fn self_name(&self) -> &'static str {
        ids::name(self.self_id())
    }

    fn peer_name(&self) -> &'static str {
        ids::name(self.peer_id())
    }

    /// A negotiated, identity-checked pipe is joining the socket. Failing here
    ///  rejects the pipe (it is closed, the reject counter bumped).
    fn pipe_attach(&self, pipe: &Arc<Pipe>) -> SpResult<()> {
        let _ = pipe;
        Ok(())
    }

    /// The pipe stopped carrying traffic; queues should drop their references.
    fn pipe_close(&self, pipe: &Arc<Pipe>) {
        let _ = pipe;
    }

    /// Last callback for this pipe; after this returns it is destroyed.
    fn pipe_stop(&self, pipe: &Arc<Pipe>) {
        let _ = pipe;
    }
}

/// A protocol identity without any policy: useful for tests, demos and raw
///  pipe-level plumbing.
pub struct RawProtocol {
    self_id: u16,
    peer_id: u16,
}

impl RawProtocol {
    pub fn new(self_id: u16, peer_id: u16) -> RawProtocol {
        RawProtocol { self_id, peer_id }
    }

    /// Symmetric pair endpoints.
    pub fn pair() -> RawProtocol {
        RawProtocol::new(ids::PAIR0, ids::PAIR0)
    }
}

impl Protocol for RawProtocol {
    fn self_id(&self) -> u16 {
        self.self_id
    }

    fn peer_id(&self) -> u16 {
        self.peer_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_and_names() {
        assert_eq!(ids::REQ0, 0x30);
        assert_eq!(ids::name(ids::REQ0), "req");
        assert_eq!(ids::name(0x7f), "unknown");
    }

    #[test]
    fn test_raw_protocol_identity() {
        let p = RawProtocol::new(ids::REQ0, ids::REP0);
        assert_eq!(p.self_id(), 0x30);
        assert_eq!(p.peer_id(), 0x31);
        assert_eq!(p.self_name(), "req");
        assert_eq!(p.peer_name(), "rep");
    }
}
